//! Local mesh topology: identifiers, priorities, cell shapes and the
//! per-process entity arena.

pub mod cache;
pub mod cell_type;
pub mod mesh;
pub mod point;
pub mod priority;

pub use cache::InvalidateCache;
pub use mesh::{EntityKind, LocalMesh};
pub use point::Gid;
pub use priority::Priority;
