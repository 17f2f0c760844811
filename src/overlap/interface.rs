//! Interfaces: per-peer lists of entities shared with another process.
//!
//! An [`InterfaceSpec`] selects entities by kind and by a pair of priority
//! sets. An entity shared with rank `p` is a member of the interface towards
//! `p` when its local priority lies in one set and the priority of the copy
//! on `p` lies in the other. Items are sorted by GID on both sides, so two
//! processes enumerate a shared interface in the same order.
//!
//! The [`InterfaceRegistry`] caches built interfaces and rebuilds them lazily
//! after the replica directory changed.

use crate::overlap::directory::ReplicaDirectory;
use crate::topology::cache::{BuildStamp, InvalidateCache};
use crate::topology::mesh::EntityKind;
use crate::topology::point::Gid;
use crate::topology::priority::{Priority, PrioritySet};
use std::collections::{BTreeMap, HashMap};

/// Direction of a gather/scatter round over an interface.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// From the `local`-set side to the `remote`-set side (e.g. master → ghost).
    Forward,
    /// From the `remote`-set side back to the `local`-set side.
    Backward,
    /// Every member sends to and receives from its partner.
    ExchangeSymmetric,
}

/// Selection rule of an interface.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct InterfaceSpec {
    pub name: &'static str,
    pub kinds: &'static [EntityKind],
    pub local: PrioritySet,
    pub remote: PrioritySet,
}

impl InterfaceSpec {
    /// Local replica is on the `local` side, its partner on the `remote` side.
    fn forward_member(&self, local: Priority, remote: Priority) -> bool {
        self.local.contains(local) && self.remote.contains(remote)
    }

    /// Local replica is on the `remote` side, its partner on the `local` side.
    fn backward_member(&self, local: Priority, remote: Priority) -> bool {
        self.remote.contains(local) && self.local.contains(remote)
    }

    pub fn is_symmetric(&self) -> bool {
        self.local == self.remote
    }
}

/// Every element replica paired with every other replica of the same element.
pub const ELEMENT_SYMMETRIC: InterfaceSpec = InterfaceSpec {
    name: "element-symmetric",
    kinds: &[EntityKind::Element],
    local: PrioritySet::ALL,
    remote: PrioritySet::ALL,
};

/// Master/border copies of shared lower-dimensional entities.
pub const BORDER_SYMMETRIC: InterfaceSpec = InterfaceSpec {
    name: "border-symmetric",
    kinds: &[EntityKind::Node, EntityKind::Edge, EntityKind::SideVector],
    local: PrioritySet::BORDER_OR_MASTER,
    remote: PrioritySet::BORDER_OR_MASTER,
};

/// Every replicated entity of every kind.
pub const ALL_SYMMETRIC: InterfaceSpec = InterfaceSpec {
    name: "all-symmetric",
    kinds: &[
        EntityKind::Node,
        EntityKind::Edge,
        EntityKind::SideVector,
        EntityKind::Element,
    ],
    local: PrioritySet::ALL,
    remote: PrioritySet::ALL,
};

/// Master copies towards their ghost copies, any kind.
pub const MASTER_TO_GHOST: InterfaceSpec = InterfaceSpec {
    name: "master-to-ghost",
    kinds: &[
        EntityKind::Node,
        EntityKind::Edge,
        EntityKind::SideVector,
        EntityKind::Element,
    ],
    local: PrioritySet::MASTER,
    remote: PrioritySet::GHOSTS,
};

/// One shared entity as seen from this process.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct InterfaceItem {
    pub gid: Gid,
    pub kind: EntityKind,
    pub local: Priority,
    pub remote: Priority,
    forward: bool,
    backward: bool,
}

impl InterfaceItem {
    /// Whether this process sends the item in a round with `direction`.
    pub fn sends(&self, direction: Direction) -> bool {
        match direction {
            Direction::Forward => self.forward,
            Direction::Backward => self.backward,
            Direction::ExchangeSymmetric => true,
        }
    }

    /// Whether this process receives the item in a round with `direction`.
    pub fn receives(&self, direction: Direction) -> bool {
        match direction {
            Direction::Forward => self.backward,
            Direction::Backward => self.forward,
            Direction::ExchangeSymmetric => true,
        }
    }
}

/// Built interface: peer rank → items sorted by GID.
#[derive(Clone, Debug, Default)]
pub struct Interface {
    spec_name: &'static str,
    peers: BTreeMap<usize, Vec<InterfaceItem>>,
}

impl Interface {
    /// Select members of `spec` from the current directory.
    pub fn build(directory: &ReplicaDirectory, spec: &InterfaceSpec) -> Self {
        let mut peers: BTreeMap<usize, Vec<InterfaceItem>> = BTreeMap::new();
        for (gid, entry) in directory.iter() {
            if !spec.kinds.contains(&entry.kind()) {
                continue;
            }
            let local = entry.local_priority();
            for (rank, remote) in entry.couplings() {
                let forward = spec.forward_member(local, remote);
                let backward = spec.backward_member(local, remote);
                if forward || backward {
                    peers.entry(rank).or_default().push(InterfaceItem {
                        gid,
                        kind: entry.kind(),
                        local,
                        remote,
                        forward,
                        backward,
                    });
                }
            }
        }
        Self {
            spec_name: spec.name,
            peers,
        }
    }

    pub fn name(&self) -> &'static str {
        self.spec_name
    }

    /// Peer ranks with at least one shared item.
    pub fn peers(&self) -> impl Iterator<Item = usize> + '_ {
        self.peers.keys().copied()
    }

    pub fn items(&self, peer: usize) -> &[InterfaceItem] {
        self.peers.get(&peer).map_or(&[], Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.peers.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

/// Lazily rebuilt cache of interfaces, keyed by spec name.
#[derive(Debug, Default)]
pub struct InterfaceRegistry {
    built_at: BuildStamp,
    cache: HashMap<&'static str, Interface>,
}

impl InterfaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if the cache no longer reflects `directory`.
    pub fn is_dirty(&self, directory: &ReplicaDirectory) -> bool {
        !self.built_at.is_current(directory.generation())
    }

    /// The interface for `spec`, rebuilding every cached interface first if the
    /// directory changed since the last build.
    pub fn interface(&mut self, directory: &ReplicaDirectory, spec: &InterfaceSpec) -> &Interface {
        if self.is_dirty(directory) {
            log::debug!(
                "rank {}: rebuilding interfaces at generation {}",
                directory.rank(),
                directory.generation()
            );
            self.cache.clear();
            self.built_at.mark(directory.generation());
        }
        self.cache
            .entry(spec.name)
            .or_insert_with(|| Interface::build(directory, spec))
    }
}

impl InvalidateCache for InterfaceRegistry {
    fn invalidate_cache(&mut self) {
        self.cache.clear();
        self.built_at.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gid(v: u64) -> Gid {
        Gid::new(v).unwrap()
    }

    fn directory() -> ReplicaDirectory {
        let mut dir = ReplicaDirectory::new(0);
        dir.insert_local(gid(10), EntityKind::Element, Priority::Master);
        dir.set_priority(gid(10), 1, Priority::HGHOST).unwrap();
        dir.insert_local(gid(1), EntityKind::Node, Priority::Master);
        dir.set_priority(gid(1), 1, Priority::Border).unwrap();
        dir.set_priority(gid(1), 2, Priority::HGHOST).unwrap();
        dir.insert_local(gid(2), EntityKind::Node, Priority::Master);
        dir
    }

    #[test]
    fn master_to_ghost_directions() {
        let dir = directory();
        let iface = Interface::build(&dir, &MASTER_TO_GHOST);
        assert_eq!(iface.peers().collect::<Vec<_>>(), vec![1, 2]);
        let to1 = iface.items(1);
        assert_eq!(to1.len(), 1);
        assert_eq!(to1[0].gid, gid(10));
        assert!(to1[0].sends(Direction::Forward));
        assert!(!to1[0].receives(Direction::Forward));
        assert!(to1[0].receives(Direction::Backward));
        assert_eq!(iface.items(2)[0].gid, gid(1));
    }

    #[test]
    fn border_interface_skips_ghost_partners() {
        let dir = directory();
        let iface = Interface::build(&dir, &BORDER_SYMMETRIC);
        assert_eq!(iface.len(), 1);
        assert_eq!(iface.items(1)[0].gid, gid(1));
        assert!(iface.items(2).is_empty());
    }

    #[test]
    fn registry_rebuilds_after_directory_change() {
        let mut dir = directory();
        let mut reg = InterfaceRegistry::new();
        assert_eq!(reg.interface(&dir, &ELEMENT_SYMMETRIC).len(), 1);
        assert!(!reg.is_dirty(&dir));
        dir.remove_replica(gid(10), 1).unwrap();
        assert!(reg.is_dirty(&dir));
        assert!(reg.interface(&dir, &ELEMENT_SYMMETRIC).is_empty());
        reg.invalidate_cache();
        assert!(reg.is_dirty(&dir));
    }
}
