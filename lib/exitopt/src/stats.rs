// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Counters describing the behavior of exit-history optimization.
//!
//! The counters are plain integers owned by the per-vCPU state; consumers
//! take a copy with [`EmCoreState::stats`](crate::EmCoreState::stats).

use std::time::Duration;

use serde::Serialize;

use crate::records::Lookup;

/// Length of the per-step lookup counter arrays.  Lookups resolved after
/// more collision steps than this are accounted in the last element.
pub const STEP_SLOTS: usize = 16;

/// Accumulated time spent in an operation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ProfileCounter {
    pub calls: u64,
    pub total_ns: u64,
}
impl ProfileCounter {
    pub fn add(&mut self, elapsed: Duration) {
        self.calls += 1;
        self.total_ns =
            self.total_ns.saturating_add(elapsed.as_nanos() as u64);
    }

    /// Mean duration of a call, if any were made.
    pub fn mean(&self) -> Option<Duration> {
        (self.calls != 0)
            .then(|| Duration::from_nanos(self.total_ns / self.calls))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ExitOptStats {
    /// Record lookups which matched an existing record, by collision step.
    pub rec_hits: [u64; STEP_SLOTS],
    /// Lookups which claimed a free slot, by collision step.
    pub rec_new: [u64; STEP_SLOTS],
    /// Lookups which evicted another record, by collision step.
    pub rec_replaced: [u64; STEP_SLOTS],
    /// Lookups which reset a record whose exit type changed, by step.
    pub rec_type_changed: [u64; STEP_SLOTS],

    /// Occupied slots of the record table.
    pub records_used: u64,

    /// Records promoted from normal handling to probing.
    pub probes_requested: u64,
    /// Records which gave up waiting for a probe to be run.
    pub probes_abandoned: u64,

    /// History executions with a learned instruction cap.
    pub exec: u64,
    /// Exits avoided by those executions.
    pub exec_saved_exits: u64,
    pub exec_instructions: u64,

    /// Probing history executions.
    pub probe: u64,
    pub probe_instructions: u64,
    /// Probes concluding with a learned instruction cap.
    pub probed_exec_with_max: u64,
    /// Probes concluding that normal handling is best.
    pub probed_normal: u64,
    /// Probes deferred to the outer execution context.
    pub probed_to_outer: u64,

    /// Time spent classifying exits.
    pub prof_classify: ProfileCounter,
    /// Time spent in history execution.
    pub prof_history_exec: ProfileCounter,
}
impl ExitOptStats {
    pub(crate) fn record_lookup(&mut self, lookup: Lookup) {
        let (counters, step) = match lookup {
            Lookup::Hit { step } => (&mut self.rec_hits, step),
            Lookup::New { step } => (&mut self.rec_new, step),
            Lookup::Replaced { step } => (&mut self.rec_replaced, step),
            Lookup::TypeChanged { step } => {
                (&mut self.rec_type_changed, step)
            }
        };
        counters[(step as usize).min(STEP_SLOTS - 1)] += 1;
    }

    /// Total number of exits correlated in the record table.
    pub fn lookups(&self) -> u64 {
        [
            &self.rec_hits,
            &self.rec_new,
            &self.rec_replaced,
            &self.rec_type_changed,
        ]
        .iter()
        .flat_map(|counts| counts.iter())
        .sum()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lookups_by_step() {
        let mut stats = ExitOptStats::default();
        stats.record_lookup(Lookup::Hit { step: 0 });
        stats.record_lookup(Lookup::Hit { step: 0 });
        stats.record_lookup(Lookup::New { step: 3 });
        stats.record_lookup(Lookup::Replaced { step: 200 });
        stats.record_lookup(Lookup::TypeChanged { step: 1 });

        assert_eq!(stats.rec_hits[0], 2);
        assert_eq!(stats.rec_new[3], 1);
        assert_eq!(stats.rec_replaced[STEP_SLOTS - 1], 1);
        assert_eq!(stats.rec_type_changed[1], 1);
        assert_eq!(stats.lookups(), 5);
    }

    #[test]
    fn profile_mean() {
        let mut prof = ProfileCounter::default();
        assert_eq!(prof.mean(), None);
        prof.add(Duration::from_nanos(100));
        prof.add(Duration::from_nanos(300));
        assert_eq!(prof.calls, 2);
        assert_eq!(prof.mean(), Some(Duration::from_nanos(200)));
    }
}
