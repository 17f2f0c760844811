//! Structural self-checks, run after every committed envelope.
//!
//! `validate_invariants` is always available; `debug_assert_invariants`
//! only checks in debug builds or with the `check-invariants` feature.

use crate::mesh_error::MeshReplicaError;

/// Types with checkable structural invariants.
pub trait DebugInvariants {
    /// Name used in the panic message.
    const NAME: &'static str;

    /// First violated invariant, if any.
    fn validate_invariants(&self) -> Result<(), MeshReplicaError>;

    /// Panic on a violated invariant when invariant checking is enabled.
    #[inline]
    fn debug_assert_invariants(&self) {
        #[cfg(any(debug_assertions, feature = "check-invariants"))]
        if let Err(e) = self.validate_invariants() {
            log::error!("[invariants] {}: {e}", Self::NAME);
            panic!("[invariants] {}: {e}", Self::NAME);
        }
    }
}
