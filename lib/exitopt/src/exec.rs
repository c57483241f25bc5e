// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! History execution: servicing hot exit sites with instruction batches.

use std::time::Instant;

use serde::Serialize;
use slog::{debug, trace, warn, Logger};

use crate::config::HistoryConfig;
use crate::records::{ExitAction, ExitRecord, SlotHandle};
use crate::stats::ExitOptStats;

#[usdt::provider(provider = "exitopt")]
mod probes {
    fn history_exec_start(slot: u16, probing: bool, min: u32, max: u32) {}
    fn history_exec_done(slot: u16, status: i32, exits: u32, insns: u32) {}
    fn probe_result(slot: u16, outcome: &str, cap: u16) {}
}

bitflags! {
    /// Classes of exit which the caller will take itself once the batch
    /// stops.  Passed through verbatim to the [`BatchExecutor`].
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SuppressExits: u32 {
        const IO_PORT = 1 << 0;
        const MMIO = 1 << 1;
        const MSR = 1 << 2;
        const CPUID = 1 << 3;
        const HLT = 1 << 4;
    }
}

/// Status of a batch of guest instructions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ExecStatus {
    Success,
    /// The executor met an instruction it does not implement.
    UnsupportedInstruction,
    /// The executor met an instruction using a feature (operand form,
    /// addressing mode, etc) it does not implement.
    UnsupportedAspect,
    /// Execution must continue in the outer context, which can complete
    /// work (such as a pending device access) that the inner one cannot.
    ResumeInOuterLoop,
    /// Any other status indicating success, with extra information for the
    /// caller's scheduling loop.
    Informational(i32),
    Failure(i32),
}
impl ExecStatus {
    /// Numeric form of the status, as exposed via probes.  Negative values
    /// are failures.
    pub fn code(&self) -> i32 {
        match self {
            ExecStatus::Success => 0,
            ExecStatus::UnsupportedInstruction => -1,
            ExecStatus::UnsupportedAspect => -2,
            ExecStatus::ResumeInOuterLoop => 1,
            ExecStatus::Informational(c) | ExecStatus::Failure(c) => *c,
        }
    }
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            ExecStatus::Success
                | ExecStatus::ResumeInOuterLoop
                | ExecStatus::Informational(_)
        )
    }
    pub fn is_unsupported(&self) -> bool {
        matches!(
            self,
            ExecStatus::UnsupportedInstruction | ExecStatus::UnsupportedAspect
        )
    }

    /// Map "not implemented" statuses to success: the caller will simply
    /// fall back to handling the exit itself.
    fn absorb_unsupported(self) -> Self {
        if self.is_unsupported() {
            ExecStatus::Success
        } else {
            self
        }
    }
}

/// Figures reported by a [`BatchExecutor`] for one batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ExecStats {
    /// Exits encountered (and handled inline) during the batch
    pub exits: u32,
    /// Instructions executed
    pub instructions: u32,
    /// Largest number of instructions executed between two exits
    pub max_exit_distance: u32,
}

/// Context in which an exit is being handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ExecutionContext {
    /// The outermost scheduling loop.  Everything can be done here.
    Outer,
    /// An inner, more privileged context, which must defer some work to the
    /// outer loop.
    Inner,
    /// The inner context while preemption of the vCPU thread is disabled.
    InnerPreemptDisabled,
}
impl ExecutionContext {
    /// Can a probe in this context be suspended, and continued later from
    /// the outer loop?
    pub const fn can_defer(&self) -> bool {
        !matches!(self, ExecutionContext::Outer)
    }
}

/// Interpreter capable of executing a bounded batch of guest instructions,
/// handling the exits it encounters along the way.
#[cfg_attr(test, mockall::automock)]
pub trait BatchExecutor {
    /// Execute at least `min_instructions` and at most `max_instructions`
    /// instructions.  Past the first `min_instructions`, stop once
    /// `max_instructions_without_exit` instructions have passed without an
    /// exit.
    fn execute_batch(
        &mut self,
        suppress: SuppressExits,
        min_instructions: u32,
        max_instructions: u32,
        max_instructions_without_exit: u32,
    ) -> (ExecStatus, ExecStats);
}

/// Result of a history execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ExecOutcome {
    /// Status for the caller's scheduling loop.
    pub status: ExecStatus,
    /// The probe was suspended, to be continued from the outer loop.
    pub continuation: bool,
}

/// Bindings a history execution operates with.
pub(crate) struct HistoryExec<'a> {
    pub config: &'a HistoryConfig,
    pub stats: &'a mut ExitOptStats,
    pub log: &'a Logger,
}
impl HistoryExec<'_> {
    /// Service an exit at a hot site, given the record for that site.
    ///
    /// # Panics
    ///
    /// If `rec` is in a state which does not call for history execution.
    pub fn run(
        &mut self,
        slot: SlotHandle,
        rec: &mut ExitRecord,
        suppress: SuppressExits,
        ctx: ExecutionContext,
        executor: &mut dyn BatchExecutor,
    ) -> ExecOutcome {
        let start = Instant::now();
        let action = rec.action;
        let outcome = match action {
            ExitAction::ExecuteWithCap { cap } => ExecOutcome {
                status: self.exec_with_cap(slot, cap, suppress, executor),
                continuation: false,
            },
            ExitAction::Probing => {
                self.probe(slot, rec, suppress, ctx, executor)
            }
            state => panic!(
                "history exec of slot {slot} in state {state:?} (pc {:#x})",
                rec.flat_pc
            ),
        };
        self.stats.prof_history_exec.add(start.elapsed());
        outcome
    }

    fn exec_with_cap(
        &mut self,
        slot: SlotHandle,
        cap: u16,
        suppress: SuppressExits,
        executor: &mut dyn BatchExecutor,
    ) -> ExecStatus {
        let (min, max) = (cap as u32, self.config.exec_max_instructions as u32);
        probes::history_exec_start!(|| (slot.index() as u16, false, min, max));
        let (status, res) = executor.execute_batch(suppress, min, max, min);
        probes::history_exec_done!(|| (
            slot.index() as u16,
            status.code(),
            res.exits,
            res.instructions
        ));

        self.stats.exec += 1;
        self.stats.exec_saved_exits += res.exits.saturating_sub(1) as u64;
        self.stats.exec_instructions += res.instructions as u64;

        trace!(self.log, "history exec";
            "slot" => %slot,
            "status" => ?status,
            "exits" => res.exits,
            "instructions" => res.instructions,
        );
        status.absorb_unsupported()
    }

    fn probe(
        &mut self,
        slot: SlotHandle,
        rec: &mut ExitRecord,
        suppress: SuppressExits,
        ctx: ExecutionContext,
        executor: &mut dyn BatchExecutor,
    ) -> ExecOutcome {
        let cfg = self.config;
        let (min, max, stop) = (
            cfg.probe_min_instructions as u32,
            cfg.exec_max_instructions as u32,
            cfg.probe_max_instructions_without_exit as u32,
        );
        probes::history_exec_start!(|| (slot.index() as u16, true, min, max));
        let (status, res) = executor.execute_batch(suppress, min, max, stop);
        probes::history_exec_done!(|| (
            slot.index() as u16,
            status.code(),
            res.exits,
            res.instructions
        ));

        self.stats.probe += 1;
        self.stats.probe_instructions += res.instructions as u64;

        let mut continuation = false;
        let status = if res.exits >= 2 && status.is_success() {
            let cap = self.learned_cap(slot, res.max_exit_distance);
            rec.action = ExitAction::ExecuteWithCap { cap };
            self.stats.probed_exec_with_max += 1;
            probes::probe_result!(|| {
                (slot.index() as u16, "exec-with-cap", cap)
            });
            debug!(self.log, "probe found clustered exits";
                "slot" => %slot,
                "pc" => format!("{:#x}", rec.flat_pc),
                "exits" => res.exits,
                "cap" => cap,
            );
            status
        } else if ctx.can_defer() && status == ExecStatus::ResumeInOuterLoop {
            // Leave the record probing: the outer loop picks this slot up
            // again once it has finished the work it was handed.
            continuation = true;
            self.stats.probed_to_outer += 1;
            probes::probe_result!(|| (slot.index() as u16, "to-outer", 0));
            trace!(self.log, "probe continues in outer loop"; "slot" => %slot);
            status
        } else {
            rec.action = ExitAction::Probed;
            self.stats.probed_normal += 1;
            probes::probe_result!(|| (slot.index() as u16, "normal", 0));
            debug!(self.log, "probe found no clustering";
                "slot" => %slot,
                "pc" => format!("{:#x}", rec.flat_pc),
                "exits" => res.exits,
                "status" => ?status,
            );
            status.absorb_unsupported()
        };
        ExecOutcome { status, continuation }
    }

    /// Turn the exit distance measured by a probe into an instruction cap,
    /// clamping it to the permitted range.
    fn learned_cap(&self, slot: SlotHandle, distance: u32) -> u16 {
        let limit = self.config.tunables.max_learned_cap;
        let cap = distance.clamp(1, limit as u32) as u16;
        if cap as u32 != distance {
            warn!(self.log, "probe exit distance out of range";
                "slot" => %slot,
                "distance" => distance,
                "cap" => cap,
            );
        }
        cap
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::exits::{ExitTag, ExitType};
    use slog::{o, Discard};
    use ExecutionContext::{Inner, Outer};

    fn logger() -> Logger {
        Logger::root(Discard, o!())
    }

    fn record(action: ExitAction) -> ExitRecord {
        ExitRecord {
            flat_pc: 0x1000,
            tag: ExitTag::em(ExitType::IoPortRead),
            action,
            last_seen: 300,
            hits: 300,
        }
    }

    fn slot() -> SlotHandle {
        SlotHandle::new(0x200).unwrap()
    }

    fn stats_for(exits: u32, dist: u32, insns: u32) -> ExecStats {
        ExecStats { exits, instructions: insns, max_exit_distance: dist }
    }

    fn run(
        rec: &mut ExitRecord,
        ctx: ExecutionContext,
        executor: &mut dyn BatchExecutor,
    ) -> (ExecOutcome, ExitOptStats) {
        let config = HistoryConfig::default();
        let mut stats = ExitOptStats::default();
        let log = logger();
        let mut hx =
            HistoryExec { config: &config, stats: &mut stats, log: &log };
        let outcome =
            hx.run(slot(), rec, SuppressExits::empty(), ctx, executor);
        (outcome, stats)
    }

    #[test]
    fn exec_with_cap_bounds() {
        let mut exec = MockBatchExecutor::new();
        exec.expect_execute_batch()
            .withf(|_, min, max, stop| {
                *min == 12 && *max == 8192 && *stop == 12
            })
            .times(1)
            .return_const((ExecStatus::Success, stats_for(5, 9, 400)));

        let mut rec = record(ExitAction::ExecuteWithCap { cap: 12 });
        let before = rec;
        let (outcome, stats) = run(&mut rec, Inner, &mut exec);
        assert_eq!(
            outcome,
            ExecOutcome { status: ExecStatus::Success, continuation: false }
        );
        assert_eq!(rec, before);
        assert_eq!(stats.exec, 1);
        assert_eq!(stats.exec_saved_exits, 4);
        assert_eq!(stats.exec_instructions, 400);
        assert_eq!(stats.prof_history_exec.calls, 1);
    }

    #[test]
    fn exec_with_cap_absorbs_unsupported() {
        for unsupported in [
            ExecStatus::UnsupportedInstruction,
            ExecStatus::UnsupportedAspect,
        ] {
            let mut exec = MockBatchExecutor::new();
            exec.expect_execute_batch()
                .times(1)
                .return_const((unsupported, ExecStats::default()));

            let mut rec = record(ExitAction::ExecuteWithCap { cap: 7 });
            let before = rec;
            let (outcome, stats) =
                run(&mut rec, Outer, &mut exec);
            assert_eq!(outcome.status, ExecStatus::Success);
            assert_eq!(rec, before);
            assert_eq!(stats.exec_saved_exits, 0);
        }
    }

    #[test]
    fn exec_with_cap_absorbs_unsupported_after_progress() {
        // Instructions were retired before the unimplemented one: still
        // not an error for the caller.
        let mut exec = MockBatchExecutor::new();
        exec.expect_execute_batch().times(1).return_const((
            ExecStatus::UnsupportedInstruction,
            stats_for(2, 5, 40),
        ));

        let mut rec = record(ExitAction::ExecuteWithCap { cap: 7 });
        let before = rec;
        let (outcome, stats) = run(&mut rec, Outer, &mut exec);
        assert_eq!(outcome.status, ExecStatus::Success);
        assert!(!outcome.continuation);
        assert_eq!(rec, before);
        assert_eq!(stats.exec, 1);
        assert_eq!(stats.exec_saved_exits, 1);
        assert_eq!(stats.exec_instructions, 40);
    }

    #[test]
    fn exec_with_cap_propagates_failure() {
        let mut exec = MockBatchExecutor::new();
        exec.expect_execute_batch()
            .return_const((ExecStatus::Failure(-22), stats_for(1, 0, 3)));
        let mut rec = record(ExitAction::ExecuteWithCap { cap: 7 });
        let (outcome, _) = run(&mut rec, Outer, &mut exec);
        assert_eq!(outcome.status, ExecStatus::Failure(-22));
        assert_eq!(rec.action, ExitAction::ExecuteWithCap { cap: 7 });
    }

    #[test]
    fn probe_learns_cap() {
        let mut exec = MockBatchExecutor::new();
        exec.expect_execute_batch()
            .withf(|_, min, max, stop| {
                *min == 75 && *max == 8192 && *stop == 24
            })
            .times(1)
            .return_const((ExecStatus::Success, stats_for(3, 10, 120)));

        let mut rec = record(ExitAction::Probing);
        let (outcome, stats) = run(&mut rec, Inner, &mut exec);
        assert_eq!(outcome.status, ExecStatus::Success);
        assert!(!outcome.continuation);
        assert_eq!(rec.action, ExitAction::ExecuteWithCap { cap: 10 });
        assert_eq!(stats.probe, 1);
        assert_eq!(stats.probed_exec_with_max, 1);
        assert_eq!(stats.probe_instructions, 120);
    }

    #[test]
    fn probe_cap_is_clamped() {
        let mut exec = MockBatchExecutor::new();
        exec.expect_execute_batch()
            .return_const((ExecStatus::Success, stats_for(2, 500, 1000)));
        let mut rec = record(ExitAction::Probing);
        run(&mut rec, Outer, &mut exec);
        assert_eq!(rec.action, ExitAction::ExecuteWithCap { cap: 32 });

        let mut exec = MockBatchExecutor::new();
        exec.expect_execute_batch()
            .return_const((ExecStatus::Success, stats_for(2, 0, 2)));
        let mut rec = record(ExitAction::Probing);
        run(&mut rec, Outer, &mut exec);
        assert_eq!(rec.action, ExitAction::ExecuteWithCap { cap: 1 });
    }

    #[test]
    fn probe_without_clustering() {
        let mut exec = MockBatchExecutor::new();
        exec.expect_execute_batch()
            .return_const((
                ExecStatus::UnsupportedInstruction,
                stats_for(1, 0, 30),
            ));
        let mut rec = record(ExitAction::Probing);
        let (outcome, stats) = run(&mut rec, Inner, &mut exec);
        assert_eq!(outcome.status, ExecStatus::Success);
        assert_eq!(rec.action, ExitAction::Probed);
        assert_eq!(stats.probed_normal, 1);
    }

    #[test]
    fn probe_failure_propagates() {
        // Plenty of exits, but the batch failed: nothing is learned.
        let mut exec = MockBatchExecutor::new();
        exec.expect_execute_batch()
            .return_const((ExecStatus::Failure(-5), stats_for(6, 4, 40)));
        let mut rec = record(ExitAction::Probing);
        let (outcome, _) = run(&mut rec, Inner, &mut exec);
        assert_eq!(outcome.status, ExecStatus::Failure(-5));
        assert_eq!(rec.action, ExitAction::Probed);
    }

    #[test]
    fn probe_defers_from_inner_context() {
        let mut exec = MockBatchExecutor::new();
        exec.expect_execute_batch()
            .return_const((ExecStatus::ResumeInOuterLoop, stats_for(1, 0, 9)));
        let mut rec = record(ExitAction::Probing);
        let (outcome, stats) = run(&mut rec, Inner, &mut exec);
        assert_eq!(
            outcome,
            ExecOutcome {
                status: ExecStatus::ResumeInOuterLoop,
                continuation: true
            }
        );
        assert_eq!(rec.action, ExitAction::Probing);
        assert_eq!(stats.probed_to_outer, 1);

        // The outer loop has nowhere to defer to.
        let mut exec = MockBatchExecutor::new();
        exec.expect_execute_batch()
            .return_const((ExecStatus::ResumeInOuterLoop, stats_for(1, 0, 9)));
        let mut rec = record(ExitAction::Probing);
        let (outcome, stats) = run(&mut rec, Outer, &mut exec);
        assert!(!outcome.continuation);
        assert_eq!(rec.action, ExitAction::Probed);
        assert_eq!(stats.probed_to_outer, 0);
    }

    #[test]
    #[should_panic]
    fn normal_record_is_rejected() {
        let mut exec = MockBatchExecutor::new();
        exec.expect_execute_batch().never();
        let mut rec = record(ExitAction::Normal);
        run(&mut rec, Outer, &mut exec);
    }

    #[test]
    #[should_panic]
    fn probed_record_is_rejected() {
        let mut exec = MockBatchExecutor::new();
        let mut rec = record(ExitAction::Probed);
        run(&mut rec, Inner, &mut exec);
    }

    #[test]
    fn status_classes() {
        assert!(ExecStatus::Success.is_success());
        assert!(ExecStatus::ResumeInOuterLoop.is_success());
        assert!(ExecStatus::Informational(4).is_success());
        assert!(!ExecStatus::Failure(-1).is_success());
        assert!(!ExecStatus::UnsupportedAspect.is_success());
        assert!(ExecStatus::UnsupportedAspect.is_unsupported());
        assert_eq!(ExecStatus::Failure(-9).code(), -9);
    }
}
