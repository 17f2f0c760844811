//! Geometry utilities for mesh-replica.
//!
//! Only the reference-element mappings needed to express vertices in the
//! local frame of their father element live here.

pub mod metrics;
