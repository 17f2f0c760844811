//! Replica priorities.
//!
//! A replica is either the authoritative `Master`, a `Border` copy of a shared
//! lower-dimensional entity, or a ghost. Ghosts carry two independent flags:
//! *horizontal* (kept for same-level neighbour lookups) and *vertical* (kept
//! because finer children exist). A replica may be both at once.
//!
//! Priorities are partially ordered: `Master > Border > any ghost`, and two
//! ghosts compare by flag inclusion, so a pure horizontal and a pure vertical
//! ghost are incomparable.

use crate::mesh_error::MeshReplicaError;
use std::cmp::Ordering;
use std::fmt;
use std::ops::BitOr;

/// Independent horizontal/vertical ghost bits.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct GhostFlags(u8);

impl GhostFlags {
    pub const NONE: GhostFlags = GhostFlags(0);
    pub const HORIZONTAL: GhostFlags = GhostFlags(0b01);
    pub const VERTICAL: GhostFlags = GhostFlags(0b10);
    pub const BOTH: GhostFlags = GhostFlags(0b11);

    #[inline]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[inline]
    pub const fn from_bits(bits: u8) -> Self {
        GhostFlags(bits & 0b11)
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn horizontal(self) -> bool {
        self.0 & Self::HORIZONTAL.0 != 0
    }

    #[inline]
    pub const fn vertical(self) -> bool {
        self.0 & Self::VERTICAL.0 != 0
    }

    #[inline]
    pub const fn contains(self, other: GhostFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub const fn union(self, other: GhostFlags) -> Self {
        GhostFlags(self.0 | other.0)
    }
}

impl BitOr for GhostFlags {
    type Output = GhostFlags;

    fn bitor(self, rhs: GhostFlags) -> GhostFlags {
        self.union(rhs)
    }
}

/// Priority of one replica.
///
/// `Ghost` is only meaningful with at least one flag set; use
/// [`Priority::ghost`] to build one from computed flags.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Priority {
    Master,
    Border,
    Ghost(GhostFlags),
}

impl Priority {
    pub const HGHOST: Priority = Priority::Ghost(GhostFlags::HORIZONTAL);
    pub const VGHOST: Priority = Priority::Ghost(GhostFlags::VERTICAL);
    pub const VHGHOST: Priority = Priority::Ghost(GhostFlags::BOTH);

    /// Ghost priority from flags, `None` if no flag is set.
    pub fn ghost(flags: GhostFlags) -> Option<Priority> {
        (!flags.is_empty()).then_some(Priority::Ghost(flags))
    }

    /// `self`, unless it is a ghost without flags.
    ///
    /// `Ghost(GhostFlags::NONE)` is constructible but names no replica role;
    /// every entry point that stores a priority rejects it here.
    pub fn validated(self) -> Result<Priority, MeshReplicaError> {
        match self {
            Priority::Ghost(flags) if flags.is_empty() => {
                Err(MeshReplicaError::InvalidPriority(self.to_wire()))
            }
            p => Ok(p),
        }
    }

    #[inline]
    pub fn is_master(self) -> bool {
        matches!(self, Priority::Master)
    }

    #[inline]
    pub fn is_border(self) -> bool {
        matches!(self, Priority::Border)
    }

    #[inline]
    pub fn is_ghost(self) -> bool {
        matches!(self, Priority::Ghost(_))
    }

    #[inline]
    pub fn is_border_or_master(self) -> bool {
        matches!(self, Priority::Master | Priority::Border)
    }

    /// Ghost flags of this replica (empty for master and border).
    #[inline]
    pub fn ghost_flags(self) -> GhostFlags {
        match self {
            Priority::Ghost(flags) => flags,
            _ => GhostFlags::NONE,
        }
    }

    fn class(self) -> u8 {
        match self {
            Priority::Master => 2,
            Priority::Border => 1,
            Priority::Ghost(_) => 0,
        }
    }

    /// Combine two priorities that meet on one process in the same epoch.
    ///
    /// The higher class wins; two ghosts keep the union of their flags.
    pub fn merge(self, other: Priority) -> Priority {
        match (self, other) {
            (Priority::Ghost(a), Priority::Ghost(b)) => Priority::Ghost(a | b),
            _ if other.class() > self.class() => other,
            _ => self,
        }
    }

    /// Stable one-byte code: 1 master, 2 border, `4 | flags` for ghosts.
    ///
    /// A flagless ghost encodes to 4, which [`Priority::from_wire`] rejects;
    /// [`Priority::validated`] keeps such values out of the directory.
    pub fn to_wire(self) -> u8 {
        match self {
            Priority::Master => 1,
            Priority::Border => 2,
            Priority::Ghost(flags) => 4 | flags.bits(),
        }
    }

    pub fn from_wire(code: u8) -> Result<Priority, MeshReplicaError> {
        match code {
            1 => Ok(Priority::Master),
            2 => Ok(Priority::Border),
            5..=7 => Ok(Priority::Ghost(GhostFlags::from_bits(code & 0b11))),
            other => Err(MeshReplicaError::InvalidPriority(other)),
        }
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Priority) -> Option<Ordering> {
        match (self, other) {
            (Priority::Ghost(a), Priority::Ghost(b)) => {
                if a == b {
                    Some(Ordering::Equal)
                } else if b.contains(*a) {
                    Some(Ordering::Less)
                } else if a.contains(*b) {
                    Some(Ordering::Greater)
                } else {
                    None
                }
            }
            _ => Some(self.class().cmp(&other.class())),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Master => f.write_str("Master"),
            Priority::Border => f.write_str("Border"),
            Priority::Ghost(flags) => match (flags.horizontal(), flags.vertical()) {
                (true, true) => f.write_str("VHGhost"),
                (true, false) => f.write_str("HGhost"),
                (false, true) => f.write_str("VGhost"),
                (false, false) => f.write_str("Ghost(none)"),
            },
        }
    }
}

/// Set of priorities used to select interface members.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct PrioritySet(u8);

impl PrioritySet {
    const MASTER_BIT: u8 = 0b0001;
    const BORDER_BIT: u8 = 0b0010;
    const HGHOST_BIT: u8 = 0b0100;
    const VGHOST_BIT: u8 = 0b1000;

    pub const EMPTY: PrioritySet = PrioritySet(0);
    pub const MASTER: PrioritySet = PrioritySet(Self::MASTER_BIT);
    pub const BORDER_OR_MASTER: PrioritySet = PrioritySet(Self::MASTER_BIT | Self::BORDER_BIT);
    pub const GHOSTS: PrioritySet = PrioritySet(Self::HGHOST_BIT | Self::VGHOST_BIT);
    pub const ALL: PrioritySet =
        PrioritySet(Self::MASTER_BIT | Self::BORDER_BIT | Self::HGHOST_BIT | Self::VGHOST_BIT);

    pub const fn union(self, other: PrioritySet) -> PrioritySet {
        PrioritySet(self.0 | other.0)
    }

    /// A ghost is a member if any of its flags is selected.
    pub fn contains(self, priority: Priority) -> bool {
        match priority {
            Priority::Master => self.0 & Self::MASTER_BIT != 0,
            Priority::Border => self.0 & Self::BORDER_BIT != 0,
            Priority::Ghost(flags) => {
                (flags.horizontal() && self.0 & Self::HGHOST_BIT != 0)
                    || (flags.vertical() && self.0 & Self::VGHOST_BIT != 0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn any_priority() -> impl Strategy<Value = Priority> {
        prop_oneof![
            Just(Priority::Master),
            Just(Priority::Border),
            Just(Priority::HGHOST),
            Just(Priority::VGHOST),
            Just(Priority::VHGHOST),
        ]
    }

    #[test]
    fn predicates() {
        assert!(Priority::Master.is_master());
        assert!(Priority::Master.is_border_or_master());
        assert!(Priority::Border.is_border_or_master());
        assert!(!Priority::Border.is_ghost());
        assert!(Priority::HGHOST.is_ghost());
        assert!(!Priority::VGHOST.is_border_or_master());
    }

    #[test]
    fn ghost_flags_combine_as_bits() {
        let combined = Priority::HGHOST.merge(Priority::VGHOST);
        assert_eq!(combined, Priority::VHGHOST);
        assert_eq!(combined.to_wire(), 7);
        assert!(Priority::ghost(GhostFlags::NONE).is_none());
    }

    #[test]
    fn horizontal_and_vertical_are_incomparable() {
        assert_eq!(Priority::HGHOST.partial_cmp(&Priority::VGHOST), None);
        assert!(Priority::HGHOST < Priority::VHGHOST);
        assert!(Priority::VHGHOST < Priority::Border);
        assert!(Priority::Border < Priority::Master);
    }

    #[test]
    fn wire_codes_reject_garbage() {
        assert_eq!(Priority::from_wire(0), Err(MeshReplicaError::InvalidPriority(0)));
        assert_eq!(Priority::from_wire(4), Err(MeshReplicaError::InvalidPriority(4)));
        assert_eq!(Priority::from_wire(3), Err(MeshReplicaError::InvalidPriority(3)));
    }

    #[test]
    fn flagless_ghost_is_rejected() {
        let empty = Priority::Ghost(GhostFlags::NONE);
        assert_eq!(empty.validated(), Err(MeshReplicaError::InvalidPriority(4)));
        assert_eq!(
            Priority::from_wire(empty.to_wire()),
            Err(MeshReplicaError::InvalidPriority(4))
        );
        assert_eq!(Priority::VGHOST.validated(), Ok(Priority::VGHOST));
        assert_eq!(Priority::Master.validated(), Ok(Priority::Master));
    }

    #[test]
    fn set_membership() {
        assert!(PrioritySet::GHOSTS.contains(Priority::VHGHOST));
        assert!(!PrioritySet::GHOSTS.contains(Priority::Border));
        assert!(PrioritySet::BORDER_OR_MASTER.contains(Priority::Border));
        assert!(PrioritySet::ALL.contains(Priority::Master));
        assert!(!PrioritySet::EMPTY.contains(Priority::HGHOST));
    }

    proptest! {
        #[test]
        fn merge_is_commutative_and_idempotent(a in any_priority(), b in any_priority()) {
            prop_assert_eq!(a.merge(b), b.merge(a));
            prop_assert_eq!(a.merge(a), a);
        }

        #[test]
        fn merge_is_an_upper_bound(a in any_priority(), b in any_priority()) {
            let m = a.merge(b);
            prop_assert!(a <= m);
            prop_assert!(b <= m);
        }

        #[test]
        fn wire_code_roundtrips(a in any_priority()) {
            prop_assert_eq!(Priority::from_wire(a.to_wire()).unwrap(), a);
        }
    }
}
