//! Replica bookkeeping: who else holds a copy of each local entity, and the
//! communication interfaces derived from that.

pub mod directory;
pub mod interface;

pub use directory::{ReplicaDirectory, ReplicaEntry};
pub use interface::{Direction, Interface, InterfaceRegistry, InterfaceSpec};
