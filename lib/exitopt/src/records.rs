// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hash table correlating repeated exits by guest PC.
//!
//! The table is a fixed array of [`RECORD_CAPACITY`] slots, addressed by the
//! flat PC of an exit.  Collisions are resolved with a bounded number of
//! address-dependent steps away from the primary slot; when none of the
//! visited slots is free, the least recently used of them is overwritten.
//! The table is a best-effort cache: nothing it does can fail, and losing a
//! record only costs the optimization for that exit site.

use std::fmt;

use serde::Serialize;

use crate::config::Tunables;
use crate::exits::ExitTag;

/// Number of slots in the table.  Must be a power of two.
pub const RECORD_CAPACITY: usize = 1024;
const IDX_MASK: usize = RECORD_CAPACITY - 1;
const STRIDE_MASK: u64 = (RECORD_CAPACITY / 4 - 1) as u64;

/// Stable reference to a slot in an [`ExitRecordTable`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SlotHandle(u16);
impl SlotHandle {
    /// Raw value used for "no slot" by collaborators exchanging slot
    /// indices in packed form.
    pub const RAW_NONE: u16 = u16::MAX;

    pub fn new(index: usize) -> Option<Self> {
        (index < RECORD_CAPACITY).then_some(Self(index as u16))
    }
    pub const fn index(&self) -> usize {
        self.0 as usize
    }
    pub fn to_raw(slot: Option<Self>) -> u16 {
        slot.map(|s| s.0).unwrap_or(Self::RAW_NONE)
    }
    pub fn from_raw(raw: u16) -> Option<Self> {
        Self::new(raw as usize)
    }
}
impl fmt::Display for SlotHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#05x}", self.0)
    }
}

/// What to do when an exit matching a record is taken.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ExitAction {
    /// Handle the exit normally, counting hits until the site looks hot.
    Normal,
    /// Hot site: the next exit here should run a probing batch.
    Probing,
    /// Probing showed nearby exits: execute up to `cap` instructions past
    /// each exit before looking for the next one.
    ExecuteWithCap { cap: u16 },
    /// Probing found nothing worth batching; handle exits normally.
    Probed,
}
impl ExitAction {
    /// Does an exit hitting a record in this state call for history
    /// execution?
    pub const fn is_special(&self) -> bool {
        matches!(self, ExitAction::Probing | ExitAction::ExecuteWithCap { .. })
    }
}

/// An occupied slot of the table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ExitRecord {
    pub flat_pc: u64,
    pub tag: ExitTag,
    pub action: ExitAction,
    /// Sequence number of the latest exit which matched this record.
    pub last_seen: u64,
    /// Exits which matched this record, including the one creating it.
    pub hits: u64,
}
impl ExitRecord {
    fn new(flat_pc: u64, tag: ExitTag, seq: u64) -> Self {
        Self {
            flat_pc,
            tag,
            action: ExitAction::Normal,
            last_seen: seq,
            hits: 1,
        }
    }

    /// Instruction cap for history execution of this record.
    pub fn instruction_cap(&self, tunables: &Tunables) -> u16 {
        match self.action {
            ExitAction::ExecuteWithCap { cap } => cap,
            _ => tunables.default_instruction_cap,
        }
    }
}

/// How the slot for an exit was located.  `step` counts the collision
/// steps taken away from the primary slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lookup {
    /// An existing record matched PC and tag.
    Hit { step: u8 },
    /// A free slot was claimed.
    New { step: u8 },
    /// A record for the PC existed with a different tag, and was reset.
    TypeChanged { step: u8 },
    /// No match nor free slot; the least recently used record was evicted.
    Replaced { step: u8 },
}
impl Lookup {
    pub fn step(&self) -> u8 {
        match *self {
            Lookup::Hit { step }
            | Lookup::New { step }
            | Lookup::TypeChanged { step }
            | Lookup::Replaced { step } => step,
        }
    }
}

/// A change of [`ExitAction`] made while classifying an exit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    /// `Normal` -> `Probing`
    StartProbe,
    /// `Probing` -> `Probed`, the probe was never serviced
    ProbeAbandoned,
}

/// Result of [`ExitRecordTable::classify`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Classified {
    /// Slot holding the record for this exit.
    pub slot: SlotHandle,
    pub lookup: Lookup,
    /// Slots examined to locate `slot`.
    pub examined: usize,
    pub transition: Option<Transition>,
    /// Set if the exit calls for history execution of `slot`.
    pub action: Option<SlotHandle>,
}

/// Fixed-capacity table of [`ExitRecord`]s.
#[derive(Clone, PartialEq, Eq)]
pub struct ExitRecordTable {
    slots: Box<[Option<ExitRecord>]>,
    occupied: usize,
    tunables: Tunables,
}
impl fmt::Debug for ExitRecordTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExitRecordTable")
            .field("occupied", &self.occupied)
            .field("tunables", &self.tunables)
            .finish_non_exhaustive()
    }
}
impl ExitRecordTable {
    pub fn new(tunables: Tunables) -> Self {
        Self {
            slots: vec![None; RECORD_CAPACITY].into_boxed_slice(),
            occupied: 0,
            tunables,
        }
    }

    pub fn tunables(&self) -> &Tunables {
        &self.tunables
    }

    /// Primary slot for a PC.  Bit 0 is dropped, as exits are rarely
    /// taken on odd addresses.
    pub const fn primary_index(flat_pc: u64) -> usize {
        ((flat_pc >> 1) as usize) & IDX_MASK
    }

    /// Distance between successive slots visited on collision.
    ///
    /// It is derived from address bits above those selecting the primary
    /// slot, so neighbouring sites spread out rather than pile up in a run.
    /// Forcing it odd keeps it non-zero and coprime with the capacity: no
    /// probe chain visits the same slot twice.
    pub const fn stride(flat_pc: u64) -> usize {
        (((flat_pc >> 11) & STRIDE_MASK) | 1) as usize
    }

    /// Look up (or create) the record for an exit numbered `seq`, then
    /// update its hit accounting and action.
    ///
    /// Exactly one slot is modified, and at most `probe_depth + 1` slots
    /// are examined.
    pub fn classify(
        &mut self,
        flat_pc: u64,
        tag: ExitTag,
        seq: u64,
    ) -> Classified {
        let stride = Self::stride(flat_pc);
        let mut idx = Self::primary_index(flat_pc);

        // Least recently used of the slots visited: (index, seq, step).
        // The primary slot is always visited, and so always replaces this.
        let mut oldest = (idx, u64::MAX, 0u8);

        for step in 0..=self.tunables.probe_depth {
            if step != 0 {
                idx = (idx + stride) & IDX_MASK;
            }
            let examined = step as usize + 1;
            let slot = SlotHandle(idx as u16);

            match &mut self.slots[idx] {
                Some(rec) if rec.flat_pc == flat_pc => {
                    if rec.tag != tag {
                        *rec = ExitRecord::new(flat_pc, tag, seq);
                        return Classified {
                            slot,
                            lookup: Lookup::TypeChanged { step },
                            examined,
                            transition: None,
                            action: None,
                        };
                    }
                    rec.last_seen = seq;
                    let transition = Self::note_hit(&self.tunables, rec);
                    return Classified {
                        slot,
                        lookup: Lookup::Hit { step },
                        examined,
                        transition,
                        action: rec.action.is_special().then_some(slot),
                    };
                }
                Some(rec) => {
                    if rec.last_seen < oldest.1 {
                        oldest = (idx, rec.last_seen, step);
                    }
                }
                free @ None => {
                    *free = Some(ExitRecord::new(flat_pc, tag, seq));
                    self.occupied += 1;
                    return Classified {
                        slot,
                        lookup: Lookup::New { step },
                        examined,
                        transition: None,
                        action: None,
                    };
                }
            }
        }

        // Every visited slot was occupied by somebody else.
        let (idx, _, step) = oldest;
        self.slots[idx] = Some(ExitRecord::new(flat_pc, tag, seq));
        Classified {
            slot: SlotHandle(idx as u16),
            lookup: Lookup::Replaced { step },
            examined: self.tunables.probe_depth as usize + 1,
            transition: None,
            action: None,
        }
    }

    /// Count a hit against a matching record, advancing its action.
    fn note_hit(
        tunables: &Tunables,
        rec: &mut ExitRecord,
    ) -> Option<Transition> {
        rec.hits += 1;
        match rec.action {
            ExitAction::Normal if rec.hits >= tunables.promote_threshold => {
                rec.action = ExitAction::Probing;
                Some(Transition::StartProbe)
            }
            // The probe request went unserviced (the caller could not, or
            // chose not to, run it) for too long.
            ExitAction::Probing if rec.hits >= tunables.probe_retry_limit => {
                rec.action = ExitAction::Probed;
                Some(Transition::ProbeAbandoned)
            }
            _ => None,
        }
    }

    pub fn get(&self, slot: SlotHandle) -> Option<&ExitRecord> {
        self.slots[slot.index()].as_ref()
    }

    pub(crate) fn get_mut(
        &mut self,
        slot: SlotHandle,
    ) -> Option<&mut ExitRecord> {
        self.slots[slot.index()].as_mut()
    }

    /// Number of slots holding a record.
    pub fn occupied(&self) -> usize {
        self.occupied
    }

    /// Iterate over the occupied slots.
    pub fn iter(&self) -> impl Iterator<Item = (SlotHandle, &ExitRecord)> + '_ {
        self.slots.iter().enumerate().filter_map(|(idx, slot)| {
            slot.as_ref().map(|rec| (SlotHandle(idx as u16), rec))
        })
    }

    /// Free every slot.
    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.occupied = 0;
    }
}
