// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Settings governing exit-history optimization for a vCPU.
//!
//! These are established once when the VM is created and are read-only
//! afterwards.  [`HistoryConfig::validate`] is the only place where their
//! ranges are checked; the per-exit paths trust them.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::exec::ExecutionContext;

/// Smallest permissible `exec_max_instructions`.
pub const MIN_EXEC_MAX_INSTRUCTIONS: u16 = 16;
/// Smallest permissible `probe_max_instructions_without_exit`.
pub const MIN_PROBE_MAX_WITHOUT_EXIT: u16 = 2;
/// Upper bound on the collision probe depth, dictated by the size of the
/// per-step statistics arrays.
pub const MAX_PROBE_DEPTH: u8 = (crate::stats::STEP_SLOTS - 1) as u8;

/// Errors in an exit-history configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error(
        "exec-max-instructions value {0} is too small, min {}",
        MIN_EXEC_MAX_INSTRUCTIONS
    )]
    ExecMaxTooSmall(u16),

    #[error(
        "probe-max-instructions-without-exit value {0} is too small, min {}",
        MIN_PROBE_MAX_WITHOUT_EXIT
    )]
    ProbeMaxTooSmall(u16),

    #[error(
        "promote threshold ({promote}) must be below retry limit ({retry})"
    )]
    ThresholdOrder { promote: u64, retry: u64 },

    #[error("promote threshold must be non-zero")]
    ZeroPromoteThreshold,

    #[error("probe depth {0} out of range (1..={})", MAX_PROBE_DEPTH)]
    ProbeDepth(u8),

    #[error("learned instruction cap limit must be non-zero")]
    ZeroCapLimit,
}

/// Policy constants of the exit record classifier and the executor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Tunables {
    /// Hit count at which a `Normal` record starts probing.
    pub promote_threshold: u64,
    /// Hit count at which a record still waiting on a probe gives up and
    /// becomes `Probed`.
    pub probe_retry_limit: u64,
    /// Slots examined beyond the primary one before evicting.
    pub probe_depth: u8,
    /// Instruction cap reported for records which have not learned one.
    pub default_instruction_cap: u16,
    /// Largest instruction cap a probe may establish.
    pub max_learned_cap: u16,
}
impl Default for Tunables {
    fn default() -> Self {
        Self {
            promote_threshold: 256,
            probe_retry_limit: 512,
            probe_depth: 8,
            default_instruction_cap: 64,
            max_learned_cap: 32,
        }
    }
}
impl Tunables {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.promote_threshold == 0 {
            return Err(ConfigError::ZeroPromoteThreshold);
        }
        if self.promote_threshold >= self.probe_retry_limit {
            return Err(ConfigError::ThresholdOrder {
                promote: self.promote_threshold,
                retry: self.probe_retry_limit,
            });
        }
        if self.probe_depth == 0 || self.probe_depth > MAX_PROBE_DEPTH {
            return Err(ConfigError::ProbeDepth(self.probe_depth));
        }
        if self.max_learned_cap == 0 {
            return Err(ConfigError::ZeroCapLimit);
        }
        Ok(())
    }
}

/// Which execution contexts may correlate exits and act on them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct OptimizationFlags {
    /// Master switch, covering every context.
    pub enabled: bool,
    /// Optimize exits handled in the inner (kernel) context.
    pub enabled_inner: bool,
    /// Optimize exits handled in the inner context while preemption is
    /// disabled.
    pub enabled_inner_preempt_disabled: bool,
}
impl Default for OptimizationFlags {
    fn default() -> Self {
        Self {
            enabled: true,
            enabled_inner: true,
            enabled_inner_preempt_disabled: false,
        }
    }
}
impl OptimizationFlags {
    /// Apply the hierarchy of the flags: a disabled outer switch disables
    /// the ones nested beneath it.
    pub fn cascaded(self) -> Self {
        let enabled_inner = self.enabled_inner && self.enabled;
        Self {
            enabled: self.enabled,
            enabled_inner,
            enabled_inner_preempt_disabled: self
                .enabled_inner_preempt_disabled
                && enabled_inner,
        }
    }

    pub fn enabled_in(&self, ctx: ExecutionContext) -> bool {
        match ctx {
            ExecutionContext::Outer => self.enabled,
            ExecutionContext::Inner => self.enabled_inner,
            ExecutionContext::InnerPreemptDisabled => {
                self.enabled_inner_preempt_disabled
            }
        }
    }
}

/// Default probe minimum for a given probe maximum: enough instructions
/// for roughly three exit-free stretches.
pub const fn default_probe_min(probe_max_without_exit: u16) -> u16 {
    if probe_max_without_exit < 0x5554 {
        (probe_max_without_exit + 1) * 3
    } else {
        u16::MAX
    }
}

/// Complete exit-history configuration for a vCPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct HistoryConfig {
    /// Ceiling on instructions executed by one history execution.
    pub exec_max_instructions: u16,
    /// Instructions a probe executes before it may stop on exits.
    pub probe_min_instructions: u16,
    /// Longest exit-free stretch tolerated while probing.
    pub probe_max_instructions_without_exit: u16,
    pub optimization: OptimizationFlags,
    pub tunables: Tunables,
}
impl Default for HistoryConfig {
    fn default() -> Self {
        let probe_max = 24;
        Self {
            exec_max_instructions: 8192,
            probe_min_instructions: default_probe_min(probe_max),
            probe_max_instructions_without_exit: probe_max,
            optimization: OptimizationFlags::default(),
            tunables: Tunables::default(),
        }
    }
}
impl HistoryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.exec_max_instructions < MIN_EXEC_MAX_INSTRUCTIONS {
            return Err(ConfigError::ExecMaxTooSmall(
                self.exec_max_instructions,
            ));
        }
        if self.probe_max_instructions_without_exit
            < MIN_PROBE_MAX_WITHOUT_EXIT
        {
            return Err(ConfigError::ProbeMaxTooSmall(
                self.probe_max_instructions_without_exit,
            ));
        }
        self.tunables.validate()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = HistoryConfig::default();
        assert_eq!(cfg.validate(), Ok(()));
        assert_eq!(cfg.exec_max_instructions, 8192);
        assert_eq!(cfg.probe_max_instructions_without_exit, 24);
        assert_eq!(cfg.probe_min_instructions, 75);
    }

    #[test]
    fn probe_min_saturates() {
        assert_eq!(default_probe_min(2), 9);
        assert_eq!(default_probe_min(0x5553), 0xfffc);
        assert_eq!(default_probe_min(0x5554), u16::MAX);
        assert_eq!(default_probe_min(u16::MAX), u16::MAX);
    }

    #[test]
    fn range_checks() {
        let cfg =
            HistoryConfig { exec_max_instructions: 15, ..Default::default() };
        assert_eq!(cfg.validate(), Err(ConfigError::ExecMaxTooSmall(15)));

        let cfg = HistoryConfig {
            probe_max_instructions_without_exit: 1,
            ..Default::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::ProbeMaxTooSmall(1)));

        let tunables = Tunables {
            promote_threshold: 512,
            probe_retry_limit: 512,
            ..Default::default()
        };
        assert!(matches!(
            tunables.validate(),
            Err(ConfigError::ThresholdOrder { .. })
        ));

        let tunables = Tunables { probe_depth: 16, ..Default::default() };
        assert_eq!(tunables.validate(), Err(ConfigError::ProbeDepth(16)));
        let tunables = Tunables { probe_depth: 0, ..Default::default() };
        assert_eq!(tunables.validate(), Err(ConfigError::ProbeDepth(0)));
    }

    #[test]
    fn flags_cascade() {
        let flags = OptimizationFlags {
            enabled: false,
            enabled_inner: true,
            enabled_inner_preempt_disabled: true,
        }
        .cascaded();
        assert!(!flags.enabled_in(ExecutionContext::Outer));
        assert!(!flags.enabled_in(ExecutionContext::Inner));
        assert!(!flags.enabled_in(ExecutionContext::InnerPreemptDisabled));

        let flags = OptimizationFlags {
            enabled: true,
            enabled_inner: false,
            enabled_inner_preempt_disabled: true,
        }
        .cascaded();
        assert!(flags.enabled_in(ExecutionContext::Outer));
        assert!(!flags.enabled_in(ExecutionContext::InnerPreemptDisabled));

        let flags = OptimizationFlags::default().cascaded();
        assert!(flags.enabled_in(ExecutionContext::Inner));
        assert!(!flags.enabled_in(ExecutionContext::InnerPreemptDisabled));
    }
}
