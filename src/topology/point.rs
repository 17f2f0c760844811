//! `Gid`: the global identifier of a distributed mesh entity
//!
//! Every node, edge, side vector and element carries a `Gid` that is stable
//! for the entity's whole lifetime and identical on every process that holds
//! a replica of it. `Gid` wraps a nonzero `u64`; 0 is reserved as the
//! "none" sentinel used on the wire (e.g. for an edge without a midpoint).
//!
//! This module provides:
//! - A transparent `Gid` newtype around `NonZeroU64`.
//! - [`GidAllocator`], the per-rank generator that keeps GIDs globally unique
//!   without any communication.

use crate::mesh_error::MeshReplicaError;
use std::{fmt, num::NonZeroU64};

/// Global identifier of a mesh entity.
///
/// # Memory layout
/// `repr(transparent)` over `NonZeroU64`, so `Option<Gid>` is also 8 bytes
/// and a `Gid` can be shipped as a plain `u64`.
#[derive(
    Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct Gid(NonZeroU64);

impl Gid {
    /// Creates a new `Gid` from a raw `u64` value.
    ///
    /// # Errors
    /// Returns [`MeshReplicaError::InvalidGid`] if `raw == 0`.
    #[inline]
    pub fn new(raw: u64) -> Result<Self, MeshReplicaError> {
        NonZeroU64::new(raw)
            .map(Gid)
            .ok_or(MeshReplicaError::InvalidGid)
    }

    /// Returns the inner `u64` value.
    #[inline]
    pub const fn get(self) -> u64 {
        self.0.get()
    }

    /// Encode an optional GID, mapping `None` to the 0 sentinel.
    #[inline]
    pub fn to_wire(gid: Option<Gid>) -> u64 {
        gid.map_or(0, Gid::get)
    }

    /// Decode a wire value, mapping the 0 sentinel to `None`.
    #[inline]
    pub fn from_wire(raw: u64) -> Option<Gid> {
        NonZeroU64::new(raw).map(Gid)
    }
}

impl fmt::Debug for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Gid").field(&self.get()).finish()
    }
}

impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.get())
    }
}

#[cfg(feature = "mpi-support")]
unsafe impl mpi::datatype::Equivalence for Gid {
    type Out = <u64 as mpi::datatype::Equivalence>::Out;

    fn equivalent_datatype() -> Self::Out {
        u64::equivalent_datatype()
    }
}

/// Bits reserved for the per-rank counter.
pub const GID_COUNTER_BITS: u32 = 40;

/// Per-rank GID generator.
///
/// GIDs are `(rank + 1) << 40 | counter`, so two ranks can never hand out the
/// same value and a GID never encodes rank 0 as all-zero high bits.
#[derive(Clone, Debug)]
pub struct GidAllocator {
    rank: usize,
    next: u64,
}

impl GidAllocator {
    pub fn new(rank: usize) -> Self {
        Self { rank, next: 0 }
    }

    /// Rank whose GID space this allocator draws from.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Hand out the next unused GID of this rank.
    pub fn next_gid(&mut self) -> Result<Gid, MeshReplicaError> {
        let prefix = self.rank as u64 + 1;
        if self.next >= (1u64 << GID_COUNTER_BITS) || prefix >= (1u64 << (64 - GID_COUNTER_BITS)) {
            return Err(MeshReplicaError::GidSpaceExhausted(self.rank));
        }
        let gid = Gid::new((prefix << GID_COUNTER_BITS) | self.next)?;
        self.next += 1;
        Ok(gid)
    }

    /// The rank that created `gid`, if it came from a `GidAllocator`.
    pub fn creator_of(gid: Gid) -> Option<usize> {
        (gid.get() >> GID_COUNTER_BITS).checked_sub(1).map(|r| r as usize)
    }
}

#[cfg(test)]
mod layout_tests {
    use super::*;
    use static_assertions::assert_eq_size;

    assert_eq_size!(Gid, u64);
    assert_eq_size!(Option<Gid>, u64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn zero_is_rejected() {
        assert_eq!(Gid::new(0), Err(MeshReplicaError::InvalidGid));
    }

    #[test]
    fn debug_and_display() {
        let g = Gid::new(7).unwrap();
        assert_eq!(format!("{:?}", g), "Gid(7)");
        assert_eq!(format!("{}", g), "7");
    }

    #[test]
    fn wire_sentinel() {
        assert_eq!(Gid::to_wire(None), 0);
        assert_eq!(Gid::from_wire(0), None);
        assert_eq!(Gid::from_wire(42), Some(Gid::new(42).unwrap()));
    }

    #[test]
    fn bincode_roundtrip() {
        let g = Gid::new(456).unwrap();
        let bytes = bincode::serialize(&g).unwrap();
        let back: Gid = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, g);
    }

    #[test]
    fn allocator_records_creator() {
        let mut alloc = GidAllocator::new(3);
        let g = alloc.next_gid().unwrap();
        assert_eq!(GidAllocator::creator_of(g), Some(3));
    }

    proptest! {
        #[test]
        fn allocators_never_collide(ranks in 1usize..6, per_rank in 1usize..50) {
            let mut seen = HashSet::new();
            for rank in 0..ranks {
                let mut alloc = GidAllocator::new(rank);
                for _ in 0..per_rank {
                    let gid = alloc.next_gid().unwrap();
                    prop_assert!(seen.insert(gid), "duplicate gid {gid}");
                }
            }
        }
    }
}
