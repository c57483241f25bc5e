// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Describes the exits recorded in the per-vCPU exit history.

use bitstruct::bitstruct;
use serde::Serialize;

/// Which part of the hypervisor took (and describes) an exit.
///
/// Only [`ExitKind::Em`] exits carry an [`ExitType`] which is understood by
/// the execution manager; the others use a sub-type whose meaning is
/// specific to that kind (a VMX exit reason, an SVM exit code, etc).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub enum ExitKind {
    #[default]
    Em,
    Vmx,
    Svm,
    Nem,
    Xcpt,
    Reserved(u8),
}

/// Exit types understood by the execution manager itself.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    strum::FromRepr,
    strum::IntoStaticStr,
    strum::EnumIter,
)]
#[repr(u16)]
#[strum(serialize_all = "kebab-case")]
pub enum ExitType {
    Invalid = 0,
    IoPortRead,
    IoPortWrite,
    IoPortStrRead,
    IoPortStrWrite,
    MmioRead,
    MmioWrite,
    MsrRead,
    MsrWrite,
    Cpuid,
    Rdtsc,
    Mwait,
    Monitor,
    Cli,
    Sti,
    Hlt,
    Invlpg,
    Rdpmc,
    Rdtscp,
    Xsetbv,
    Vmcall,
    Vmmcall,
}
impl ExitType {
    /// Parse the kebab-case name of an exit type (`"io-port-write"`).
    pub fn from_name(name: &str) -> Option<Self> {
        use strum::IntoEnumIterator;
        Self::iter().find(|ty| <&'static str>::from(*ty) == name)
    }

    pub fn name(&self) -> &'static str {
        self.into()
    }
}

bitstruct! {
    /// Packed representation of an exit's kind, type and flags.
    ///
    /// This is the form exchanged with collaborators which record exits;
    /// everything inside this crate operates on [`ExitTag`] instead.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct PackedExitTag(pub u32) {
        /// Kind-specific exit type
        pub sub_type: u16 = 0..12;

        /// Who took the exit
        pub kind: ExitKind = 12..15;

        reserved1: bool = 15;

        /// The recorded PC is CS:EIP rather than a flat address
        pub cs_eip_relative: bool = 16;

        /// The recorded PC has not been flattened
        pub unflattened: bool = 17;

        reserved2: u16 = 18..32;
    }
}

impl bitstruct::FromRaw<u8, ExitKind> for PackedExitTag {
    fn from_raw(raw: u8) -> ExitKind {
        match raw {
            0b000 => ExitKind::Em,
            0b001 => ExitKind::Vmx,
            0b010 => ExitKind::Svm,
            0b011 => ExitKind::Nem,
            0b100 => ExitKind::Xcpt,
            0b101..=0b111 => ExitKind::Reserved(raw),
            _ => unreachable!(),
        }
    }
}

impl bitstruct::IntoRaw<u8, ExitKind> for PackedExitTag {
    fn into_raw(target: ExitKind) -> u8 {
        match target {
            ExitKind::Em => 0b000,
            ExitKind::Vmx => 0b001,
            ExitKind::Svm => 0b010,
            ExitKind::Nem => 0b011,
            ExitKind::Xcpt => 0b100,
            ExitKind::Reserved(raw) => raw & 0b111,
        }
    }
}

/// Mask of the sub-type field within [`PackedExitTag`].
pub const SUB_TYPE_MASK: u16 = 0xfff;

/// Kind, type and flags of a recorded exit.
///
/// Two exits at the same PC are only correlated when their tags compare
/// equal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub struct ExitTag {
    pub kind: ExitKind,
    pub sub_type: u16,
    /// The PC is CS:EIP rather than a flat address.  Kept when the flags of
    /// a history entry are amended.
    pub cs_eip_relative: bool,
    /// The PC has not been flattened.  Sticky, like `cs_eip_relative`.
    pub unflattened: bool,
}

impl ExitTag {
    pub const fn new(kind: ExitKind, sub_type: u16) -> Self {
        Self {
            kind,
            sub_type: sub_type & SUB_TYPE_MASK,
            cs_eip_relative: false,
            unflattened: false,
        }
    }

    /// Tag for an exit of a type handled by the execution manager.
    pub const fn em(ty: ExitType) -> Self {
        Self::new(ExitKind::Em, ty as u16)
    }

    pub fn exit_type(&self) -> Option<ExitType> {
        match self.kind {
            ExitKind::Em => ExitType::from_repr(self.sub_type),
            _ => None,
        }
    }

    /// Is this an exit which is a candidate for correlation in the exit
    /// record table?
    ///
    /// Only exits described by the execution manager, with a PC which is
    /// a flat address, qualify.
    pub const fn is_common(&self) -> bool {
        matches!(self.kind, ExitKind::Em)
            && !self.cs_eip_relative
            && !self.unflattened
    }

    /// Copy the sticky flags of `prev` into this tag.
    pub(crate) fn with_sticky_from(self, prev: &ExitTag) -> Self {
        Self {
            cs_eip_relative: self.cs_eip_relative || prev.cs_eip_relative,
            unflattened: self.unflattened || prev.unflattened,
            ..self
        }
    }

    pub fn packed(&self) -> PackedExitTag {
        PackedExitTag(0)
            .with_sub_type(self.sub_type & SUB_TYPE_MASK)
            .with_kind(self.kind)
            .with_cs_eip_relative(self.cs_eip_relative)
            .with_unflattened(self.unflattened)
    }
}

impl From<PackedExitTag> for ExitTag {
    fn from(packed: PackedExitTag) -> Self {
        Self {
            kind: packed.kind(),
            sub_type: packed.sub_type(),
            cs_eip_relative: packed.cs_eip_relative(),
            unflattened: packed.unflattened(),
        }
    }
}
impl From<ExitTag> for PackedExitTag {
    fn from(tag: ExitTag) -> Self {
        tag.packed()
    }
}
impl From<u32> for ExitTag {
    fn from(raw: u32) -> Self {
        Self::from(PackedExitTag(raw))
    }
}
impl From<ExitTag> for u32 {
    fn from(tag: ExitTag) -> Self {
        tag.packed().0
    }
}
