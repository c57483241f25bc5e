// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Exit traces: recorded (JSON lines) or synthesized.

use std::io::BufRead;

use exitopt::{ExitKind, ExitTag, ExitType};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;
use serde::Deserialize;
use thiserror::Error;

/// One exit of a trace, ready to be fed to the exit history.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TraceExit {
    pub tag: ExitTag,
    pub pc: u64,
    pub timestamp: u64,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TypeField {
    Name(String),
    Code(u16),
}

/// A trace line: `{"pc": 4096, "type": "io-port-write"}`, optionally with
/// `"kind"` (defaulting to `"em"`) and `"timestamp"`.  Exits of kinds other
/// than `em` give their type as a number.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct TraceLine {
    pc: u64,
    #[serde(rename = "type")]
    exit_type: TypeField,
    kind: Option<String>,
    timestamp: Option<u64>,
}

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("line {line}: {source}")]
    Json { line: usize, source: serde_json::Error },

    #[error("line {line}: unknown exit kind {name:?}")]
    UnknownKind { line: usize, name: String },

    #[error("line {line}: unknown exit type {name:?}")]
    UnknownType { line: usize, name: String },
}

fn parse_kind(name: &str) -> Option<ExitKind> {
    Some(match name {
        "em" => ExitKind::Em,
        "vmx" => ExitKind::Vmx,
        "svm" => ExitKind::Svm,
        "nem" => ExitKind::Nem,
        "xcpt" => ExitKind::Xcpt,
        _ => return None,
    })
}

fn parse_line(line: usize, raw: &str) -> Result<TraceExit, TraceError> {
    let ent: TraceLine = serde_json::from_str(raw)
        .map_err(|source| TraceError::Json { line, source })?;

    let kind = match ent.kind.as_deref() {
        None => ExitKind::Em,
        Some(name) => parse_kind(name).ok_or_else(|| {
            TraceError::UnknownKind { line, name: name.to_string() }
        })?,
    };
    let sub_type = match ent.exit_type {
        TypeField::Code(code) => code,
        TypeField::Name(name) => match (kind, ExitType::from_name(&name)) {
            (ExitKind::Em, Some(ty)) => ty as u16,
            _ => return Err(TraceError::UnknownType { line, name }),
        },
    };

    Ok(TraceExit {
        tag: ExitTag::new(kind, sub_type),
        pc: ent.pc,
        timestamp: ent.timestamp.unwrap_or(0),
    })
}

/// Read a JSON-lines exit trace.  Blank lines and lines starting with `#`
/// are skipped.
pub fn read<R: BufRead>(reader: R) -> Result<Vec<TraceExit>, TraceError> {
    let mut exits = Vec::new();
    for (idx, raw) in reader.lines().enumerate() {
        let raw = raw?;
        let raw = raw.trim();
        if raw.is_empty() || raw.starts_with('#') {
            continue;
        }
        exits.push(parse_line(idx + 1, raw)?);
    }
    Ok(exits)
}

/// Generate `count` exits of a guest which spends its time in a few
/// device-polling loops, with a sprinkling of exits from elsewhere.
pub fn synthetic(count: usize) -> Vec<TraceExit> {
    // (pc, exit type) of the polling loops
    const HOT: [(u64, ExitType); 4] = [
        (0xffff_8000_0010_2a40, ExitType::IoPortRead),
        (0xffff_8000_0010_2a48, ExitType::IoPortWrite),
        (0xffff_8000_0020_1130, ExitType::MmioRead),
        (0xffff_8000_0031_0e02, ExitType::Cpuid),
    ];
    const NOISE: [ExitType; 4] = [
        ExitType::MsrRead,
        ExitType::MsrWrite,
        ExitType::Rdtsc,
        ExitType::Hlt,
    ];

    // Fixed seed: a given count always yields the same trace.
    let mut rng = Pcg64::seed_from_u64(0x853c_49e6_748f_ea9b);
    (0..count)
        .map(|n| {
            let (pc, ty) = if rng.random_ratio(7, 8) {
                HOT[rng.random_range(0..HOT.len())]
            } else {
                let pc = 0xffff_8000_0000_0000
                    | (rng.random_range(0..0x80_0000u64) << 1);
                (pc, NOISE[rng.random_range(0..NOISE.len())])
            };
            TraceExit {
                tag: ExitTag::em(ty),
                pc,
                timestamp: 1_000 + n as u64 * 250,
            }
        })
        .collect()
}
