// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-vCPU exit-history state and the entry points used by the
//! scheduling loop as it handles exits.

use std::time::Instant;

use slog::{debug, info, o, trace, Logger};

use crate::config::{ConfigError, HistoryConfig};
use crate::exec::{
    BatchExecutor, ExecOutcome, ExecStatus, ExecutionContext, HistoryExec,
    SuppressExits,
};
use crate::exits::ExitTag;
use crate::history::{ExitHistory, PC_UNKNOWN};
use crate::records::{ExitAction, ExitRecordTable, SlotHandle, Transition};
use crate::stats::ExitOptStats;

#[usdt::provider(provider = "exitopt")]
mod probes {
    fn exit_classified(seq: u64, pc: u64, tag: u32, slot: u16, act: bool) {}
    fn record_transition(slot: u16, pc: u64, transition: &str) {}
    fn continuation_cancel(slot: u16) {}
}

/// Exit history, exit records and history-execution state of one vCPU.
///
/// Only the thread running the vCPU touches this, so none of it is
/// synchronized.
pub struct EmCoreState {
    log: Logger,
    config: HistoryConfig,
    history: ExitHistory,
    records: ExitRecordTable,
    stats: ExitOptStats,
    /// Probing record whose execution was deferred to the outer loop
    continuation: Option<SlotHandle>,
}

impl EmCoreState {
    /// Set up exit-history state for vCPU `vcpu_id`, validating `config`.
    pub fn new(
        config: HistoryConfig,
        vcpu_id: i32,
        log: &Logger,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let config = HistoryConfig {
            optimization: config.optimization.cascaded(),
            ..config
        };
        let log = log.new(o!("vcpu" => vcpu_id));
        info!(log, "exit history optimization configured";
            "enabled" => config.optimization.enabled,
            "enabled_inner" => config.optimization.enabled_inner,
            "enabled_inner_preempt_disabled" =>
                config.optimization.enabled_inner_preempt_disabled,
            "exec_max_instructions" => config.exec_max_instructions,
            "probe_min_instructions" => config.probe_min_instructions,
            "probe_max_without_exit" =>
                config.probe_max_instructions_without_exit,
        );

        Ok(Self {
            log,
            records: ExitRecordTable::new(config.tunables),
            config,
            history: ExitHistory::new(),
            stats: ExitOptStats::default(),
            continuation: None,
        })
    }

    /// Record an exit taken by the vCPU.
    ///
    /// If the exit is a candidate for optimization, it is classified in the
    /// record table, and the slot is returned if the exit should be
    /// serviced with [`EmCoreState::history_exec`] rather than handled
    /// normally.
    pub fn add_exit(
        &mut self,
        tag: ExitTag,
        flat_pc: u64,
        timestamp: u64,
        ctx: ExecutionContext,
    ) -> Option<SlotHandle> {
        let seq = self.history.record_exit(tag, flat_pc, timestamp);
        self.classify(seq, tag, flat_pc, ctx)
    }

    /// Update the PC of the latest exit, once it is known.
    ///
    /// This does not classify the exit: callers follow up with
    /// [`EmCoreState::update_flags_and_type`] when they know what it was.
    pub fn update_pc(&mut self, flat_pc: u64, flattened: bool) {
        self.history.amend_pc(flat_pc, flattened);
    }

    /// Update the kind and type of the latest exit, and classify it.
    ///
    /// CS:EIP-relative and unflattened flags already recorded for the exit
    /// are kept.
    pub fn update_flags_and_type(
        &mut self,
        tag: ExitTag,
        ctx: ExecutionContext,
    ) -> Option<SlotHandle> {
        let (tag, pc) = self.history.amend_flags_and_type(tag)?;
        let seq = self.history.latest_sequence()?;
        self.classify(seq, tag, pc, ctx)
    }

    /// Replace the tag and PC of the latest exit, and classify it.
    pub fn update_flags_type_and_pc(
        &mut self,
        tag: ExitTag,
        flat_pc: u64,
        ctx: ExecutionContext,
    ) -> Option<SlotHandle> {
        let seq = self.history.latest_sequence()?;
        self.history.amend_flags_type_and_pc(tag, flat_pc);
        self.classify(seq, tag, flat_pc, ctx)
    }

    fn classify(
        &mut self,
        seq: u64,
        tag: ExitTag,
        flat_pc: u64,
        ctx: ExecutionContext,
    ) -> Option<SlotHandle> {
        if !tag.is_common()
            || flat_pc == PC_UNKNOWN
            || !self.config.optimization.enabled_in(ctx)
        {
            return None;
        }

        let start = Instant::now();
        let res = self.records.classify(flat_pc, tag, seq);
        self.history.set_slot(seq, res.slot);
        self.stats.record_lookup(res.lookup);
        self.stats.records_used = self.records.occupied() as u64;

        if let Some(transition) = res.transition {
            let name = match transition {
                Transition::StartProbe => {
                    self.stats.probes_requested += 1;
                    "start-probe"
                }
                Transition::ProbeAbandoned => {
                    self.stats.probes_abandoned += 1;
                    "probe-abandoned"
                }
            };
            probes::record_transition!(|| {
                (res.slot.index() as u16, flat_pc, name)
            });
            debug!(self.log, "exit record transition";
                "slot" => %res.slot,
                "pc" => format!("{flat_pc:#x}"),
                "transition" => name,
            );
        }
        probes::exit_classified!(|| (
            seq,
            flat_pc,
            u32::from(tag),
            res.slot.index() as u16,
            res.action.is_some()
        ));
        self.stats.prof_classify.add(start.elapsed());
        res.action
    }

    /// Service an exit by executing guest instructions in a batch, as the
    /// record in `slot` dictates.
    ///
    /// Any previously pending continuation is replaced: it is set again
    /// only if this execution was a probe deferred to the outer loop.
    ///
    /// # Panics
    ///
    /// If `slot` was not handed out by classification of the latest exit
    /// (or a pending continuation), that is, if its record is not probing
    /// or executing with a cap.
    pub fn history_exec(
        &mut self,
        slot: SlotHandle,
        suppress: SuppressExits,
        ctx: ExecutionContext,
        executor: &mut dyn BatchExecutor,
    ) -> ExecOutcome {
        let Some(rec) = self.records.get_mut(slot) else {
            panic!("history exec of free slot {slot}");
        };
        let mut hx = HistoryExec {
            config: &self.config,
            stats: &mut self.stats,
            log: &self.log,
        };
        let outcome = hx.run(slot, rec, suppress, ctx, executor);
        self.continuation = outcome.continuation.then_some(slot);
        outcome
    }

    /// Probe deferred to the outer loop, if any.
    pub fn pending_continuation(&self) -> Option<SlotHandle> {
        self.continuation
    }

    /// Continue a deferred probe from the outer loop, now that it has
    /// finished the work it was handed with status `status`.
    ///
    /// The probe is only resumed if that work succeeded outright; otherwise
    /// it is cancelled.  Returns `None` when nothing was executed.
    pub fn resume_continuation(
        &mut self,
        status: ExecStatus,
        suppress: SuppressExits,
        executor: &mut dyn BatchExecutor,
    ) -> Option<ExecOutcome> {
        let slot = self.continuation?;
        let still_probing = self
            .records
            .get(slot)
            .is_some_and(|rec| rec.action == ExitAction::Probing);
        if status != ExecStatus::Success || !still_probing {
            trace!(self.log, "dropping continuation";
                "slot" => %slot,
                "status" => ?status,
                "still_probing" => still_probing,
            );
            self.cancel_continuation();
            return None;
        }
        Some(self.history_exec(
            slot,
            suppress,
            ExecutionContext::Outer,
            executor,
        ))
    }

    /// Abandon a deferred probe.
    pub fn cancel_continuation(&mut self) {
        if let Some(slot) = self.continuation.take() {
            probes::continuation_cancel!(|| slot.index() as u16);
        }
    }

    /// Forget all exits and records, as when the VM is reset.  Statistics
    /// are kept.
    pub fn reset(&mut self) {
        self.cancel_continuation();
        self.history.clear();
        self.records.clear();
        self.stats.records_used = 0;
        debug!(self.log, "exit history reset");
    }

    pub fn history(&self) -> &ExitHistory {
        &self.history
    }
    pub fn records(&self) -> &ExitRecordTable {
        &self.records
    }
    pub fn stats(&self) -> &ExitOptStats {
        &self.stats
    }
    pub fn config(&self) -> &HistoryConfig {
        &self.config
    }
}
