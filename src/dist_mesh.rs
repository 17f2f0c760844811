//! `DistMesh`: one process's share of a distributed mesh.
//!
//! Owns the local mesh arena, the replica directory, the interface registry
//! and the transaction envelope state. All cross-process operations take the
//! communicator explicitly and are collective: every rank must call them in
//! the same order.

use crate::algs::communicator::{CommTag, Communicator, ExchangeTags};
use crate::algs::consistency_check::{self, CheckOptions, ConsistencyReport};
use crate::algs::gather_scatter::{self, GatherScatter, RoundStats};
use crate::algs::migrate;
use crate::algs::reconstruct::{self, ReconstructOptions, ReconstructReport};
use crate::algs::transaction::{self, CommitStats, PendingOps};
use crate::debug_invariants::DebugInvariants;
use crate::mesh_error::MeshReplicaError;
use crate::overlap::directory::ReplicaDirectory;
use crate::overlap::interface::{Direction, Interface, InterfaceRegistry, InterfaceSpec};
use crate::topology::cache::InvalidateCache;
use crate::topology::mesh::{Entity, LocalMesh};
use crate::topology::point::{Gid, GidAllocator};
use crate::topology::priority::Priority;
use std::collections::BTreeMap;

const USER_ROUND_TAGS: ExchangeTags = ExchangeTags::from_base(CommTag::new(0x5000));

#[derive(Debug)]
pub struct DistMesh {
    rank: usize,
    size: usize,
    mesh: LocalMesh,
    directory: ReplicaDirectory,
    registry: InterfaceRegistry,
    transaction: Option<PendingOps>,
    gids: GidAllocator,
}

impl DistMesh {
    /// Empty share of a `dimension`-D mesh for process `rank` of `size`.
    pub fn new(rank: usize, size: usize, dimension: u8) -> Self {
        Self {
            rank,
            size,
            mesh: LocalMesh::new(dimension),
            directory: ReplicaDirectory::new(rank),
            registry: InterfaceRegistry::new(),
            transaction: None,
            gids: GidAllocator::new(rank),
        }
    }

    /// Empty share sized after `comm`.
    pub fn for_comm<C: Communicator>(comm: &C, dimension: u8) -> Self {
        Self::new(comm.rank(), comm.size(), dimension)
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn mesh(&self) -> &LocalMesh {
        &self.mesh
    }

    /// Direct mutable access to the local arena. Changes made here bypass
    /// the directory; the checker is what notices if they diverge.
    pub fn mesh_mut(&mut self) -> &mut LocalMesh {
        &mut self.mesh
    }

    pub fn directory(&self) -> &ReplicaDirectory {
        &self.directory
    }

    /// Fresh GID created by this process.
    pub fn next_gid(&mut self) -> Result<Gid, MeshReplicaError> {
        self.gids.next_gid()
    }

    /// Seed a locally built entity as the only (`Master`) replica.
    /// Elements get `partition` set to this rank.
    pub fn insert_master(&mut self, mut entity: Entity) -> Gid {
        if let Entity::Element(el) = &mut entity {
            el.partition = self.rank;
        }
        let gid = entity.gid();
        self.directory
            .insert_local(gid, entity.kind(), Priority::Master);
        self.mesh.upsert(entity);
        gid
    }

    /// Every replica of `gid`, ascending by process.
    pub fn list_replicas(&self, gid: Gid) -> Result<Vec<(usize, Priority)>, MeshReplicaError> {
        self.directory.list_replicas(gid)
    }

    /// The interface selected by `spec`, rebuilt if the directory changed.
    pub fn interface(&mut self, spec: &InterfaceSpec) -> &Interface {
        self.registry.interface(&self.directory, spec)
    }

    // --- transaction envelope ---

    pub fn is_transaction_open(&self) -> bool {
        self.transaction.is_some()
    }

    /// Open an envelope.
    ///
    /// # Errors
    /// [`MeshReplicaError::NestedTransaction`] if one is already open.
    pub fn begin_transaction(&mut self) -> Result<(), MeshReplicaError> {
        if self.transaction.is_some() {
            return Err(MeshReplicaError::NestedTransaction);
        }
        self.transaction = Some(PendingOps::default());
        Ok(())
    }

    /// Buffer a copy of a local entity to `dest` with `priority`.
    pub fn xfer_copy(
        &mut self,
        gid: Gid,
        dest: usize,
        priority: Priority,
    ) -> Result<(), MeshReplicaError> {
        if dest >= self.size {
            return Err(MeshReplicaError::RankOutOfRange {
                rank: dest,
                size: self.size,
            });
        }
        let priority = priority.validated()?;
        self.require_local(gid)?;
        self.pending()?.copy(gid, dest, priority);
        Ok(())
    }

    /// Buffer deletion of the local replica of `gid`.
    pub fn xfer_delete(&mut self, gid: Gid) -> Result<(), MeshReplicaError> {
        self.require_local(gid)?;
        self.pending()?.delete(gid);
        Ok(())
    }

    /// Buffer a new priority for the local replica of `gid`.
    ///
    /// # Errors
    /// [`MeshReplicaError::InvalidPriority`] for a ghost without flags.
    pub fn xfer_set_priority(&mut self, gid: Gid, priority: Priority) -> Result<(), MeshReplicaError> {
        let priority = priority.validated()?;
        self.require_local(gid)?;
        self.pending()?.set_priority(gid, priority);
        Ok(())
    }

    /// Close the envelope and commit its operations collectively.
    ///
    /// # Errors
    /// [`MeshReplicaError::TransactionClosed`] if no envelope is open; any
    /// communication error of the commit rounds. The envelope is closed
    /// either way.
    pub fn end_transaction<C: Communicator>(
        &mut self,
        comm: &C,
    ) -> Result<CommitStats, MeshReplicaError> {
        let ops = self
            .transaction
            .take()
            .ok_or(MeshReplicaError::TransactionClosed)?;
        let result = transaction::commit(comm, &mut self.mesh, &mut self.directory, ops);
        self.registry.invalidate_cache();
        self.directory.debug_assert_invariants();
        self.mesh.debug_assert_invariants();
        result
    }

    fn pending(&mut self) -> Result<&mut PendingOps, MeshReplicaError> {
        self.transaction
            .as_mut()
            .ok_or(MeshReplicaError::TransactionClosed)
    }

    fn require_local(&self, gid: Gid) -> Result<(), MeshReplicaError> {
        if !self.mesh.contains(gid) {
            return Err(MeshReplicaError::UnknownEntity(gid));
        }
        if !self.directory.contains(gid) {
            return Err(MeshReplicaError::ReplicaNotFound(gid));
        }
        Ok(())
    }

    fn require_closed(&self) -> Result<(), MeshReplicaError> {
        if self.transaction.is_some() {
            Err(MeshReplicaError::TransactionOpen)
        } else {
            Ok(())
        }
    }

    // --- collective operations ---

    /// Move master elements to the ranks in `targets` (one envelope).
    pub fn migrate_elements<C: Communicator>(
        &mut self,
        comm: &C,
        targets: &BTreeMap<Gid, usize>,
    ) -> Result<CommitStats, MeshReplicaError> {
        self.require_closed()?;
        migrate::migrate_elements(self, comm, targets)
    }

    /// Repair priorities and derived attributes after a migration, with
    /// default options.
    pub fn reconstruct_consistency<C: Communicator>(
        &mut self,
        comm: &C,
        levels: &[u8],
    ) -> Result<ReconstructReport, MeshReplicaError> {
        self.reconstruct_consistency_with(comm, levels, &ReconstructOptions::default())
    }

    pub fn reconstruct_consistency_with<C: Communicator>(
        &mut self,
        comm: &C,
        levels: &[u8],
        options: &ReconstructOptions,
    ) -> Result<ReconstructReport, MeshReplicaError> {
        self.require_closed()?;
        reconstruct::reconstruct(self, comm, levels, options)
    }

    /// Verify the distributed state; never mutates the mesh.
    pub fn check_consistency<C: Communicator>(
        &mut self,
        comm: &C,
        levels: &[u8],
        options: &CheckOptions,
    ) -> Result<ConsistencyReport, MeshReplicaError> {
        self.require_closed()?;
        let Self {
            mesh,
            directory,
            registry,
            ..
        } = self;
        consistency_check::check(comm, mesh, directory, registry, levels, options)
    }

    /// One gather/scatter round over the interface selected by `spec`.
    pub fn gather_scatter<C, H>(
        &mut self,
        comm: &C,
        spec: &InterfaceSpec,
        direction: Direction,
        handler: &mut H,
    ) -> Result<RoundStats, MeshReplicaError>
    where
        C: Communicator,
        H: GatherScatter + ?Sized,
    {
        let iface = self.registry.interface(&self.directory, spec);
        gather_scatter::gather_scatter(comm, iface, direction, handler, USER_ROUND_TAGS)
    }
}
