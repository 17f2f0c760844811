//! Generation-stamped caches over the replica directory.
//!
//! Derived views (interfaces, adjacency snapshots) remember the directory
//! generation they were built at and rebuild once it moves on.

/// A cache of state derived from replica couplings.
pub trait InvalidateCache {
    /// Drop everything cached; the next query rebuilds.
    fn invalidate_cache(&mut self);
}

/// Directory generation a cache was last built at; empty when never built
/// or explicitly invalidated.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BuildStamp(Option<u64>);

impl BuildStamp {
    #[inline]
    pub fn is_current(self, generation: u64) -> bool {
        self.0 == Some(generation)
    }

    #[inline]
    pub fn mark(&mut self, generation: u64) {
        self.0 = Some(generation);
    }

    #[inline]
    pub fn clear(&mut self) {
        self.0 = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamp_tracks_one_generation() {
        let mut stamp = BuildStamp::default();
        assert!(!stamp.is_current(0));
        stamp.mark(3);
        assert!(stamp.is_current(3));
        assert!(!stamp.is_current(4));
        stamp.clear();
        assert!(!stamp.is_current(3));
    }
}
