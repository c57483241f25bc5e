// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Exit-history driven execution strategy selection for virtual CPUs.
//!
//! Every VM exit taken by a vCPU is appended to a small per-vCPU ring
//! ([`history::ExitHistory`]).  Exits of the common kinds are further
//! correlated by guest PC in a fixed-size hash table
//! ([`records::ExitRecordTable`]).  Once an exit site has been hit often
//! enough, the table asks the caller to probe it by running a batch of
//! guest instructions through an interpreter ([`exec::BatchExecutor`]); if
//! the probe shows that exits cluster around the site, subsequent exits
//! there are serviced by executing a capped batch of instructions instead
//! of bouncing through the normal per-exit path.
//!
//! All of the state for one vCPU is held by [`EmCoreState`], which is owned
//! by (and only ever touched from) the thread driving that vCPU.

#![allow(clippy::style)]

pub extern crate usdt;
#[macro_use]
extern crate bitflags;

pub mod config;
pub mod em;
pub mod exec;
pub mod exits;
pub mod history;
pub mod records;
pub mod stats;

pub use config::{ConfigError, HistoryConfig, OptimizationFlags, Tunables};
pub use em::EmCoreState;
pub use exec::{
    BatchExecutor, ExecOutcome, ExecStats, ExecStatus, ExecutionContext,
    SuppressExits,
};
pub use exits::{ExitKind, ExitTag, ExitType};
pub use records::SlotHandle;

pub fn version() -> &'static str {
    concat!("v", env!("CARGO_PKG_VERSION"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn print_version() {
        let v = version();
        eprintln!("exitopt {v}");
        assert!(v.contains(env!("CARGO_PKG_VERSION")));
    }
}
