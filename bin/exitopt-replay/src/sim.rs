// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A stand-in for the instruction interpreter.

use exitopt::{BatchExecutor, ExecStats, ExecStatus, SuppressExits};

/// Simulated guest behavior following an exit.
///
/// After the exit which triggered the batch, the guest takes `cluster_exits`
/// further exits, `cluster_distance` instructions apart, and then runs
/// without exiting.
#[derive(Clone, Copy, Debug)]
pub struct SimGuest {
    pub cluster_distance: u32,
    pub cluster_exits: u32,
    /// Every n-th batch meets an instruction the interpreter lacks.
    pub unsupported_every: Option<u64>,
    /// Every n-th batch needs the outer loop to finish a device access.
    pub defer_every: Option<u64>,
}

pub struct SimExecutor {
    guest: SimGuest,
    pub batches: u64,
    pub instructions: u64,
}
impl SimExecutor {
    pub fn new(guest: SimGuest) -> Self {
        Self { guest, batches: 0, instructions: 0 }
    }

    pub fn guest(&self) -> SimGuest {
        self.guest
    }

    fn nth(&self, every: Option<u64>) -> bool {
        every.is_some_and(|n| n != 0 && self.batches % n == 0)
    }
}

impl BatchExecutor for SimExecutor {
    fn execute_batch(
        &mut self,
        _suppress: SuppressExits,
        min_instructions: u32,
        max_instructions: u32,
        max_instructions_without_exit: u32,
    ) -> (ExecStatus, ExecStats) {
        self.batches += 1;
        if self.nth(self.guest.unsupported_every) {
            return (ExecStatus::UnsupportedInstruction, ExecStats::default());
        }

        let mut res = ExecStats::default();
        let mut since_exit = 0;
        while res.instructions < max_instructions {
            res.instructions += 1;
            since_exit += 1;
            if res.exits < self.guest.cluster_exits
                && since_exit == self.guest.cluster_distance
            {
                res.exits += 1;
                res.max_exit_distance = res.max_exit_distance.max(since_exit);
                since_exit = 0;
            }
            if res.instructions >= min_instructions
                && since_exit >= max_instructions_without_exit
            {
                break;
            }
        }
        self.instructions += res.instructions as u64;

        let status = if self.nth(self.guest.defer_every) {
            ExecStatus::ResumeInOuterLoop
        } else {
            ExecStatus::Success
        };
        (status, res)
    }
}
