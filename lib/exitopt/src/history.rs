// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ring of the most recent exits taken by a vCPU.

use crate::exits::ExitTag;
use crate::records::SlotHandle;

/// Number of exits retained in the ring.  Must be a power of two.
pub const HISTORY_CAPACITY: usize = 256;
const HISTORY_MASK: u64 = HISTORY_CAPACITY as u64 - 1;

/// PC value recorded when the exit site is not (yet) known.
pub const PC_UNKNOWN: u64 = u64::MAX;

/// A single observed exit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExitHistoryEntry {
    flat_pc: u64,
    tag: ExitTag,
    timestamp: u64,
    slot: Option<SlotHandle>,
}
impl Default for ExitHistoryEntry {
    fn default() -> Self {
        Self {
            flat_pc: PC_UNKNOWN,
            tag: ExitTag::default(),
            timestamp: 0,
            slot: None,
        }
    }
}
impl ExitHistoryEntry {
    /// Flattened PC of the exit, if known.
    pub fn pc(&self) -> Option<u64> {
        (self.flat_pc != PC_UNKNOWN).then_some(self.flat_pc)
    }
    /// Raw PC value, [`PC_UNKNOWN`] if not known.
    pub fn flat_pc(&self) -> u64 {
        self.flat_pc
    }
    pub fn tag(&self) -> ExitTag {
        self.tag
    }
    /// Host timestamp of the exit, if one was available.
    pub fn timestamp(&self) -> Option<u64> {
        (self.timestamp != 0).then_some(self.timestamp)
    }
    /// The exit record slot this exit was correlated with, if any.
    pub fn slot(&self) -> Option<SlotHandle> {
        self.slot
    }
}

/// Fixed-size circular log of exits.
///
/// Exits are numbered by a monotonically increasing sequence number, which
/// also determines their position in the ring.  The ring never allocates
/// after construction and is only written from the owning vCPU thread.
#[derive(Clone, Debug)]
pub struct ExitHistory {
    entries: [ExitHistoryEntry; HISTORY_CAPACITY],
    next: u64,
}
impl Default for ExitHistory {
    fn default() -> Self {
        Self::new()
    }
}
impl ExitHistory {
    pub fn new() -> Self {
        Self {
            entries: [ExitHistoryEntry::default(); HISTORY_CAPACITY],
            next: 0,
        }
    }

    const fn index(seq: u64) -> usize {
        (seq & HISTORY_MASK) as usize
    }

    /// Sequence number which will be assigned to the next recorded exit.
    pub fn next_sequence(&self) -> u64 {
        self.next
    }

    /// Append an exit, returning the sequence number assigned to it.
    pub fn record_exit(
        &mut self,
        tag: ExitTag,
        flat_pc: u64,
        timestamp: u64,
    ) -> u64 {
        let seq = self.next;
        self.next += 1;
        self.entries[Self::index(seq)] =
            ExitHistoryEntry { flat_pc, tag, timestamp, slot: None };
        seq
    }

    fn current_mut(&mut self) -> Option<&mut ExitHistoryEntry> {
        let seq = self.next.checked_sub(1)?;
        Some(&mut self.entries[Self::index(seq)])
    }

    /// Update the PC of the most recently recorded exit.
    ///
    /// The unflattened flag of the exit is set or cleared according to
    /// `flattened`.  Does nothing if no exit has been recorded.
    pub fn amend_pc(&mut self, flat_pc: u64, flattened: bool) {
        if let Some(ent) = self.current_mut() {
            ent.flat_pc = flat_pc;
            ent.tag.unflattened = !flattened;
        }
    }

    /// Replace the tag of the most recently recorded exit, keeping the
    /// sticky CS:EIP-relative and unflattened flags it already carried.
    ///
    /// Returns the resulting tag and PC of the entry.
    pub fn amend_flags_and_type(
        &mut self,
        tag: ExitTag,
    ) -> Option<(ExitTag, u64)> {
        let ent = self.current_mut()?;
        ent.tag = tag.with_sticky_from(&ent.tag);
        Some((ent.tag, ent.flat_pc))
    }

    /// Replace both tag and PC of the most recently recorded exit.  Unlike
    /// [`ExitHistory::amend_flags_and_type`], no flags are carried over.
    pub fn amend_flags_type_and_pc(&mut self, tag: ExitTag, flat_pc: u64) {
        if let Some(ent) = self.current_mut() {
            ent.tag = tag;
            ent.flat_pc = flat_pc;
        }
    }

    /// Note the record slot that the exit numbered `seq` was correlated
    /// with.
    pub(crate) fn set_slot(&mut self, seq: u64, slot: SlotHandle) {
        debug_assert!(self.get(seq).is_some());
        self.entries[Self::index(seq)].slot = Some(slot);
    }

    /// Sequence number of the most recently recorded exit.
    pub fn latest_sequence(&self) -> Option<u64> {
        self.next.checked_sub(1)
    }

    pub fn latest(&self) -> Option<&ExitHistoryEntry> {
        self.get(self.latest_sequence()?)
    }

    /// Fetch the exit numbered `seq`, provided it is still in the ring.
    pub fn get(&self, seq: u64) -> Option<&ExitHistoryEntry> {
        if seq >= self.next || self.next - seq > HISTORY_CAPACITY as u64 {
            return None;
        }
        Some(&self.entries[Self::index(seq)])
    }

    /// Iterate over the retained exits, most recent first.
    pub fn iter_recent(
        &self,
    ) -> impl Iterator<Item = (u64, &ExitHistoryEntry)> + '_ {
        let retained = self.next.min(HISTORY_CAPACITY as u64);
        (0..retained).map(move |back| {
            let seq = self.next - 1 - back;
            (seq, &self.entries[Self::index(seq)])
        })
    }

    pub fn len(&self) -> usize {
        self.next.min(HISTORY_CAPACITY as u64) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.next == 0
    }

    /// Forget all recorded exits.  Sequence numbering restarts at zero.
    pub fn clear(&mut self) {
        *self = Self::new();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::exits::{ExitKind, ExitType};

    fn io_write() -> ExitTag {
        ExitTag::em(ExitType::IoPortWrite)
    }

    #[test]
    fn sequence_numbers() {
        let mut hist = ExitHistory::new();
        assert!(hist.is_empty());
        assert_eq!(hist.latest(), None);

        assert_eq!(hist.record_exit(io_write(), 0x1000, 5), 0);
        assert_eq!(hist.record_exit(io_write(), 0x1004, 6), 1);
        assert_eq!(hist.next_sequence(), 2);
        assert_eq!(hist.len(), 2);

        let ent = hist.latest().unwrap();
        assert_eq!(ent.pc(), Some(0x1004));
        assert_eq!(ent.timestamp(), Some(6));
        assert_eq!(ent.slot(), None);
    }

    #[test]
    fn wraparound_keeps_most_recent() {
        let mut hist = ExitHistory::new();
        let total = HISTORY_CAPACITY as u64 * 3 + 17;
        for seq in 0..total {
            let got = hist.record_exit(io_write(), 0x10_0000 + seq, seq + 1);
            assert_eq!(got, seq);
        }
        assert_eq!(hist.len(), HISTORY_CAPACITY);

        let oldest = total - HISTORY_CAPACITY as u64;
        assert!(hist.get(oldest - 1).is_none());
        assert!(hist.get(total).is_none());
        for seq in oldest..total {
            let ent = hist.get(seq).unwrap();
            assert_eq!(ent.flat_pc(), 0x10_0000 + seq);
            assert_eq!(ent.timestamp(), Some(seq + 1));
        }

        let recent: Vec<u64> = hist.iter_recent().map(|(s, _)| s).collect();
        assert_eq!(recent.len(), HISTORY_CAPACITY);
        assert_eq!(recent[0], total - 1);
        assert_eq!(*recent.last().unwrap(), oldest);
    }

    #[test]
    fn amend_pc_targets_latest_only() {
        let mut hist = ExitHistory::new();
        for seq in 0..1000u64 {
            hist.record_exit(io_write(), seq, 0);
        }
        let seq = hist.record_exit(io_write(), PC_UNKNOWN, 0);
        assert_eq!(hist.latest().unwrap().pc(), None);

        hist.amend_pc(0xfeed, false);
        let ent = hist.get(seq).unwrap();
        assert_eq!(ent.pc(), Some(0xfeed));
        assert!(ent.tag().unflattened);

        hist.amend_pc(0xbeef, true);
        let ent = hist.get(seq).unwrap();
        assert_eq!(ent.pc(), Some(0xbeef));
        assert!(!ent.tag().unflattened);

        // the previous entry must be untouched
        let prev = hist.get(seq - 1).unwrap();
        assert_eq!(prev.flat_pc(), 999);
        assert!(!prev.tag().unflattened);
    }

    #[test]
    fn amend_flags_keeps_sticky_bits() {
        let mut hist = ExitHistory::new();
        let mut tag = ExitTag::new(ExitKind::Vmx, 30);
        tag.cs_eip_relative = true;
        hist.record_exit(tag, 0x7c00, 0);
        hist.amend_pc(0x7c00, false);

        let (tag, pc) = hist
            .amend_flags_and_type(ExitTag::em(ExitType::IoPortRead))
            .unwrap();
        assert_eq!(pc, 0x7c00);
        assert_eq!(tag.kind, ExitKind::Em);
        assert_eq!(tag.exit_type(), Some(ExitType::IoPortRead));
        assert!(tag.cs_eip_relative);
        assert!(tag.unflattened);

        hist.amend_flags_type_and_pc(ExitTag::em(ExitType::Cpuid), 0x8000);
        let ent = hist.latest().unwrap();
        assert_eq!(ent.tag(), ExitTag::em(ExitType::Cpuid));
        assert_eq!(ent.pc(), Some(0x8000));
    }

    #[test]
    fn amend_without_exits_is_ignored() {
        let mut hist = ExitHistory::new();
        hist.amend_pc(0x1000, true);
        assert_eq!(hist.amend_flags_and_type(io_write()), None);
        hist.amend_flags_type_and_pc(io_write(), 0x1000);
        assert!(hist.is_empty());
        assert_eq!(hist.get(0), None);
    }
}
