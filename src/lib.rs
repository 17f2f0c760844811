#![cfg_attr(docsrs, feature(doc_cfg))]
//! # mesh-replica
//!
//! Distributed-object consistency for partitioned, hierarchically refined
//! meshes. Every process holds a [`dist_mesh::DistMesh`]: its share of the
//! nodes, edges, side vectors and elements, plus a replica directory that
//! records, per entity, every other process holding a copy and the priority
//! (`Master`, `Border`, ghost) of each copy.
//!
//! ## Features
//! - Globally unique identifiers with a zero wire sentinel
//! - Replica directory and cached communication interfaces
//! - Batched gather/scatter rounds over an interface
//! - Transaction envelopes for copy / delete / priority changes
//! - Post-migration reconstruction of priorities, fathers, local
//!   coordinates and counts
//! - A distributed invariant checker with structured divergence reports
//!
//! ## Usage
//! ```toml
//! [dependencies]
//! mesh-replica = "0.1"
//! # features = ["mpi-support"]
//! ```
//!
//! All cross-process operations take a [`algs::communicator::Communicator`]
//! and are collective. [`algs::communicator::NoComm`] runs serially and
//! [`algs::communicator::LocalComm`] runs several ranks as threads of one
//! process.

pub mod algs;
pub mod debug_invariants;
pub mod dist_mesh;
pub mod geometry;
pub mod mesh_error;
pub mod overlap;
pub mod topology;

pub use debug_invariants::DebugInvariants;

/// A convenient prelude to import the most-used traits & types:
pub mod prelude {
    pub use crate::algs::communicator::{Communicator, LocalComm, NoComm};
    #[cfg(feature = "mpi-support")]
    pub use crate::algs::communicator::MpiComm;
    pub use crate::algs::consistency_check::{CheckOptions, ConsistencyReport, Divergence};
    pub use crate::algs::gather_scatter::{GatherScatter, RoundStats};
    pub use crate::algs::reconstruct::{ReconstructOptions, ReconstructReport};
    pub use crate::debug_invariants::DebugInvariants;
    pub use crate::dist_mesh::DistMesh;
    pub use crate::mesh_error::MeshReplicaError;
    pub use crate::overlap::interface::{Direction, InterfaceItem, InterfaceSpec};
    pub use crate::topology::cell_type::CellType;
    pub use crate::topology::mesh::{Edge, Element, Entity, EntityKind, Node, NodeOrigin, SideVector};
    pub use crate::topology::point::Gid;
    pub use crate::topology::priority::{GhostFlags, Priority, PrioritySet};
}
