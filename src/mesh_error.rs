//! MeshReplicaError: unified error type for mesh-replica public APIs
//!
//! Every fallible operation in this crate returns this error. Variants fall
//! into two groups: fatal usage errors (nested envelopes, payload size
//! mismatches, open envelopes across a reconstruction) and lookup or
//! communication failures. Detected replica divergence is *not* an error; it
//! is reported by the consistency checker as data.

use crate::topology::point::Gid;
use thiserror::Error;

/// Unified error type for mesh-replica operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MeshReplicaError {
    /// Attempted to construct a `Gid` from zero.
    #[error("Gid must be non-zero (0 is reserved as the \"none\" sentinel)")]
    InvalidGid,
    /// The per-rank GID counter ran out of space.
    #[error("GID space exhausted on rank {0}")]
    GidSpaceExhausted(usize),
    /// The replica directory has no entry for this GID.
    #[error("no replica of entity {0} is known on this process")]
    ReplicaNotFound(Gid),
    /// The local mesh does not hold an entity with this GID.
    #[error("entity {0} is not present in the local mesh")]
    UnknownEntity(Gid),
    /// A directory entry couples to the process that owns the directory.
    #[error("directory entry {0} couples to its own process")]
    SelfCoupling(Gid),
    /// A priority byte on the wire does not decode.
    #[error("invalid priority code {0}")]
    InvalidPriority(u8),
    /// A destination rank is outside the communicator.
    #[error("rank {rank} is out of range for a communicator of size {size}")]
    RankOutOfRange { rank: usize, size: usize },
    /// `begin_transaction` was called while an envelope is open.
    #[error("a transaction envelope is already open; envelopes cannot nest")]
    NestedTransaction,
    /// A buffered operation or `end_transaction` was issued with no open envelope.
    #[error("no transaction envelope is open")]
    TransactionClosed,
    /// Reconstruction or checking was requested while an envelope is open.
    #[error("a transaction envelope is still open")]
    TransactionOpen,
    /// Gather and scatter disagree on the per-entity payload size.
    #[error("payload size mismatch with rank {peer}: expected {expected} bytes, found {found}")]
    PayloadSizeMismatch {
        peer: usize,
        expected: usize,
        found: usize,
    },
    /// Level sequences must be ascending and contiguous from the coarsest level.
    #[error("invalid level sequence {0:?}: levels must ascend contiguously from 0")]
    InvalidLevels(Vec<u8>),
    /// An element and its local father are not on adjacent levels.
    #[error("element {element} has father {father} on a non-adjacent level")]
    InvalidHierarchy { element: Gid, father: Gid },
    /// A geometric mapping could not be evaluated.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),
    /// A message could not be serialized.
    #[error("failed to encode message for rank {peer}: {reason}")]
    Encode { peer: usize, reason: String },
    /// A peer sent bytes that could not be decoded.
    #[error("failed to decode message from rank {peer}: {reason}")]
    Decode { peer: usize, reason: String },
    /// Point-to-point communication failed.
    #[error("communication error with rank {neighbor}: {reason}")]
    CommError { neighbor: usize, reason: String },
}
