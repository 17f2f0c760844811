//! Collective algorithms over a distributed mesh: communication plumbing,
//! the transaction envelope, migration, reconstruction and checking.

pub mod communicator;
pub mod consistency_check;
pub mod exchange;
pub mod gather_scatter;
pub mod migrate;
pub mod reconstruct;
pub mod transaction;
pub mod wire;

pub use consistency_check::{CheckOptions, ConsistencyReport, Divergence};
pub use gather_scatter::{GatherScatter, RoundStats};
pub use reconstruct::{ReconstructOptions, ReconstructReport};
pub use transaction::CommitStats;
