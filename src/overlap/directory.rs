//! Replica directory: which processes hold a copy of each entity, and with
//! which priority.
//!
//! The directory is process-local. An entry exists exactly while this process
//! holds a replica of the entity, and records this process's own priority
//! plus the priorities of all remote replicas ("couplings"). Because the
//! local replica is always part of the entry, an entry can never be observed
//! with zero replicas: removing the local replica destroys the entry.
//!
//! Every mutation bumps a generation counter; the
//! [`InterfaceRegistry`](crate::overlap::interface::InterfaceRegistry)
//! compares it to decide when to rebuild.

use crate::debug_invariants::DebugInvariants;
use crate::mesh_error::MeshReplicaError;
use crate::topology::mesh::EntityKind;
use crate::topology::point::Gid;
use crate::topology::priority::Priority;
use std::collections::BTreeMap;

/// Replica state of one entity as seen from this process.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ReplicaEntry {
    kind: EntityKind,
    local: Priority,
    remote: BTreeMap<usize, Priority>,
}

impl ReplicaEntry {
    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    /// Priority of this process's replica.
    pub fn local_priority(&self) -> Priority {
        self.local
    }

    /// Remote replicas in ascending rank order.
    pub fn couplings(&self) -> impl Iterator<Item = (usize, Priority)> + '_ {
        self.remote.iter().map(|(&rank, &prio)| (rank, prio))
    }

    pub fn coupling(&self, rank: usize) -> Option<Priority> {
        self.remote.get(&rank).copied()
    }

    /// True if no other process holds a replica.
    pub fn is_local_only(&self) -> bool {
        self.remote.is_empty()
    }

    /// All replicas, including `my_rank`, in ascending rank order.
    pub fn replicas(&self, my_rank: usize) -> Vec<(usize, Priority)> {
        let mut out: Vec<(usize, Priority)> = self.couplings().collect();
        let pos = out.partition_point(|(rank, _)| *rank < my_rank);
        out.insert(pos, (my_rank, self.local));
        out
    }

    /// True if any replica, local or remote, is `Master`.
    pub fn has_master(&self) -> bool {
        self.local.is_master() || self.remote.values().any(|p| p.is_master())
    }

    /// Ranks holding a `Master` replica, ascending.
    pub fn master_ranks(&self, my_rank: usize) -> Vec<usize> {
        self.replicas(my_rank)
            .into_iter()
            .filter(|(_, prio)| prio.is_master())
            .map(|(rank, _)| rank)
            .collect()
    }
}

/// Per-process GID → replica set map.
#[derive(Clone, Debug)]
pub struct ReplicaDirectory {
    rank: usize,
    entries: BTreeMap<Gid, ReplicaEntry>,
    generation: u64,
}

impl ReplicaDirectory {
    pub fn new(rank: usize) -> Self {
        Self {
            rank,
            entries: BTreeMap::new(),
            generation: 0,
        }
    }

    /// Rank of the process owning this directory.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Monotonic counter bumped by every mutation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, gid: Gid) -> bool {
        self.entries.contains_key(&gid)
    }

    pub fn entry(&self, gid: Gid) -> Option<&ReplicaEntry> {
        self.entries.get(&gid)
    }

    /// Entries in ascending GID order.
    pub fn iter(&self) -> impl Iterator<Item = (Gid, &ReplicaEntry)> {
        self.entries.iter().map(|(&gid, entry)| (gid, entry))
    }

    pub fn local_priority(&self, gid: Gid) -> Option<Priority> {
        self.entries.get(&gid).map(|e| e.local)
    }

    /// Every replica of `gid` in ascending rank order.
    ///
    /// # Errors
    /// [`MeshReplicaError::ReplicaNotFound`] if this process holds no replica.
    pub fn list_replicas(&self, gid: Gid) -> Result<Vec<(usize, Priority)>, MeshReplicaError> {
        self.entries
            .get(&gid)
            .map(|e| e.replicas(self.rank))
            .ok_or(MeshReplicaError::ReplicaNotFound(gid))
    }

    /// Register the local replica of a new entity, or reset the local priority
    /// of an existing one.
    pub fn insert_local(&mut self, gid: Gid, kind: EntityKind, priority: Priority) {
        self.entries
            .entry(gid)
            .and_modify(|e| e.local = priority)
            .or_insert_with(|| ReplicaEntry {
                kind,
                local: priority,
                remote: BTreeMap::new(),
            });
        self.bump();
    }

    /// Set the priority of the replica held by `process`.
    ///
    /// # Errors
    /// [`MeshReplicaError::InvalidPriority`] for a ghost without flags,
    /// [`MeshReplicaError::ReplicaNotFound`] for an unknown GID.
    pub fn set_priority(
        &mut self,
        gid: Gid,
        process: usize,
        priority: Priority,
    ) -> Result<(), MeshReplicaError> {
        let priority = priority.validated()?;
        let rank = self.rank;
        let entry = self
            .entries
            .get_mut(&gid)
            .ok_or(MeshReplicaError::ReplicaNotFound(gid))?;
        if process == rank {
            entry.local = priority;
        } else {
            entry.remote.insert(process, priority);
        }
        self.bump();
        Ok(())
    }

    /// Forget the replica held by `process`.
    ///
    /// Removing the local replica destroys the whole entry.
    pub fn remove_replica(&mut self, gid: Gid, process: usize) -> Result<(), MeshReplicaError> {
        if process == self.rank {
            self.entries
                .remove(&gid)
                .ok_or(MeshReplicaError::ReplicaNotFound(gid))?;
        } else {
            let entry = self
                .entries
                .get_mut(&gid)
                .ok_or(MeshReplicaError::ReplicaNotFound(gid))?;
            entry.remote.remove(&process);
        }
        self.bump();
        Ok(())
    }

    /// Replace the remote replica set wholesale; `replicas` may include this
    /// process, whose element is ignored.
    pub fn replace_couplings<I>(&mut self, gid: Gid, replicas: I) -> Result<(), MeshReplicaError>
    where
        I: IntoIterator<Item = (usize, Priority)>,
    {
        let rank = self.rank;
        let entry = self
            .entries
            .get_mut(&gid)
            .ok_or(MeshReplicaError::ReplicaNotFound(gid))?;
        entry.remote = replicas.into_iter().filter(|(r, _)| *r != rank).collect();
        self.bump();
        Ok(())
    }

    fn bump(&mut self) {
        self.generation = self.generation.wrapping_add(1);
    }
}

impl DebugInvariants for ReplicaDirectory {
    const NAME: &'static str = "ReplicaDirectory";

    fn validate_invariants(&self) -> Result<(), MeshReplicaError> {
        for (&gid, entry) in &self.entries {
            if entry.remote.contains_key(&self.rank) {
                return Err(MeshReplicaError::SelfCoupling(gid));
            }
        }
        Ok(())
    }
}
