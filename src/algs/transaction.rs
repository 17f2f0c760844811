//! Transaction envelope: buffered replica changes committed in one collective epoch.
//!
//! Operations buffered while the envelope is open never touch the directory.
//! [`commit`] applies them in three all-to-all rounds:
//!
//! 1. **copies**: every copy is shipped with the full entity state and the
//!    sender's replica list; an element brings its corners, edges and side
//!    vectors along;
//! 2. **notices**: every process whose replica of an entity changed (created,
//!    reprioritized or deleted) tells all previous holders its new state;
//! 3. **final lists**: the lowest-ranked previous holder sends the complete
//!    new replica list to every new holder.
//!
//! The local mesh and directory are only mutated after round 3, so any
//! reader sees either the state before the epoch or the state after it.

use crate::algs::communicator::{CommTag, Communicator, ExchangeTags};
use crate::algs::exchange::all_to_all;
use crate::mesh_error::MeshReplicaError;
use crate::overlap::directory::ReplicaDirectory;
use crate::topology::mesh::{Entity, EntityKind, LocalMesh};
use crate::topology::point::Gid;
use crate::topology::priority::Priority;
use serde::{Serialize, de::DeserializeOwned};
use std::collections::{BTreeMap, BTreeSet};

const COPY_TAGS: ExchangeTags = ExchangeTags::from_base(CommTag::new(0x7100));
const NOTICE_TAGS: ExchangeTags = ExchangeTags::from_base(CommTag::new(0x7102));
const FINAL_TAGS: ExchangeTags = ExchangeTags::from_base(CommTag::new(0x7104));

/// Operations buffered by an open envelope.
///
/// Buffering never fails and never touches the directory; validation of
/// GIDs and ranks happens in [`DistMesh`](crate::dist_mesh::DistMesh)
/// before an operation lands here. A delete and a priority change for the
/// same GID are both kept: the delete wins unless a copy of the entity
/// arrives in the same epoch.
#[derive(Clone, Debug, Default)]
pub struct PendingOps {
    copies: BTreeMap<Gid, BTreeMap<usize, Priority>>,
    deletes: BTreeSet<Gid>,
    priorities: BTreeMap<Gid, Priority>,
}

impl PendingOps {
    /// Buffer a copy of `gid` to `dest`; repeated copies merge priorities.
    ///
    /// Copying an element also copies its corners, edges and side vectors
    /// at commit time, see [`dependent_priority`].
    pub fn copy(&mut self, gid: Gid, dest: usize, priority: Priority) {
        self.copies
            .entry(gid)
            .or_default()
            .entry(dest)
            .and_modify(|p| *p = p.merge(priority))
            .or_insert(priority);
    }

    /// Buffer deletion of the local replica of `gid`.
    pub fn delete(&mut self, gid: Gid) {
        self.deletes.insert(gid);
    }

    /// Buffer a new local priority for `gid`; the last call wins.
    pub fn set_priority(&mut self, gid: Gid, priority: Priority) {
        self.priorities.insert(gid, priority);
    }

    /// True if nothing was buffered.
    pub fn is_empty(&self) -> bool {
        self.copies.is_empty() && self.deletes.is_empty() && self.priorities.is_empty()
    }
}

/// What one commit did on this process.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CommitStats {
    /// Copy records shipped to other processes, dependents included.
    pub copies_sent: usize,
    /// Copy records received, before merging duplicates.
    pub copies_received: usize,
    /// Replicas that did not exist here before the epoch.
    pub created: usize,
    /// Local replicas removed.
    pub deleted: usize,
    /// Existing local replicas whose priority changed.
    pub reprioritized: usize,
    /// State changes reported to previous holders.
    pub notices_sent: usize,
}

#[derive(Debug, Serialize, serde::Deserialize)]
struct CopyRecord {
    priority: Priority,
    entity: Entity,
    holders: Vec<(usize, Priority)>,
}

#[derive(Debug, Serialize, serde::Deserialize)]
struct Notice {
    gid: Gid,
    rank: usize,
    state: Option<Priority>,
}

#[derive(Debug, Serialize, serde::Deserialize)]
struct FinalList {
    gid: Gid,
    replicas: Vec<(usize, Priority)>,
}

/// Incoming copies of one entity, merged over all senders.
struct Received {
    priority: Priority,
    entity: Entity,
    holders: BTreeMap<usize, Priority>,
}

/// Replica states of one entity during the epoch; `None` means deleted.
#[derive(Debug)]
struct EpochView {
    old_holders: BTreeSet<usize>,
    states: BTreeMap<usize, Option<Priority>>,
}

impl EpochView {
    fn from_replicas<I: IntoIterator<Item = (usize, Priority)>>(replicas: I) -> Self {
        let states: BTreeMap<usize, Option<Priority>> =
            replicas.into_iter().map(|(r, p)| (r, Some(p))).collect();
        Self {
            old_holders: states.keys().copied().collect(),
            states,
        }
    }

    fn live(&self) -> Vec<(usize, Priority)> {
        self.states
            .iter()
            .filter_map(|(&r, p)| p.map(|p| (r, p)))
            .collect()
    }
}

/// Priority of an element's corners, edges and sides when the element is
/// copied with `priority`.
pub fn dependent_priority(priority: Priority) -> Priority {
    match priority {
        Priority::Master | Priority::Border => Priority::Border,
        ghost => ghost,
    }
}

/// Apply `ops` collectively. Every rank of `comm` must call this.
///
/// Local decisions merge a buffered priority with the priorities of
/// incoming copies (see [`Priority::merge`]); an incoming copy cancels a
/// buffered delete. Element partitions are reset to the rank of the first
/// `Master` in the new replica list.
///
/// # Errors
/// Encoding, decoding and communication errors of the three rounds.
pub fn commit<C: Communicator>(
    comm: &C,
    mesh: &mut LocalMesh,
    directory: &mut ReplicaDirectory,
    ops: PendingOps,
) -> Result<CommitStats, MeshReplicaError> {
    let rank = comm.rank();
    let mut stats = CommitStats::default();

    // 1) copies
    let expanded = expand_copies(mesh, directory, &ops);
    let mut received: BTreeMap<Gid, Received> = BTreeMap::new();
    let mut outgoing: BTreeMap<usize, Vec<CopyRecord>> = BTreeMap::new();
    for (dest, items) in expanded {
        for (gid, priority) in items {
            let (Ok(entity), Some(entry)) = (mesh.entity(gid), directory.entry(gid)) else {
                continue;
            };
            let record = CopyRecord {
                priority,
                entity,
                holders: entry.replicas(rank),
            };
            if dest == rank {
                merge_received(&mut received, record);
            } else {
                stats.copies_sent += 1;
                outgoing.entry(dest).or_default().push(record);
            }
        }
    }
    for (_, records) in round(comm, COPY_TAGS, &outgoing)? {
        for record in records {
            stats.copies_received += 1;
            merge_received(&mut received, record);
        }
    }

    // local decisions
    let touched: BTreeSet<Gid> = ops
        .priorities
        .keys()
        .chain(ops.deletes.iter())
        .chain(received.keys())
        .copied()
        .collect();
    let mut views: BTreeMap<Gid, EpochView> = BTreeMap::new();
    let mut changed: Vec<Gid> = Vec::new();
    for gid in touched {
        let current = directory.local_priority(gid);
        let copied = received.get(&gid).map(|r| r.priority);
        let state = if ops.deletes.contains(&gid) {
            // an incoming copy cancels the delete
            copied
        } else {
            let base = ops.priorities.get(&gid).copied().or(current);
            match (base, copied) {
                (Some(b), Some(c)) => Some(b.merge(c)),
                (b, c) => b.or(c),
            }
        };
        if state == current {
            continue;
        }
        let Some(mut view) = initial_view(directory, &received, gid, rank) else {
            continue;
        };
        view.states.insert(rank, state);
        views.insert(gid, view);
        changed.push(gid);
    }

    // 2) notices to previous holders
    let mut notices: BTreeMap<usize, Vec<Notice>> = BTreeMap::new();
    for &gid in &changed {
        let view = &views[&gid];
        let state = view.states.get(&rank).copied().flatten();
        for &holder in view.old_holders.iter().filter(|&&h| h != rank) {
            stats.notices_sent += 1;
            notices.entry(holder).or_default().push(Notice { gid, rank, state });
        }
    }
    for (peer, list) in round(comm, NOTICE_TAGS, &notices)? {
        for notice in list {
            if !views.contains_key(&notice.gid) {
                match initial_view(directory, &received, notice.gid, rank) {
                    Some(view) => {
                        views.insert(notice.gid, view);
                    }
                    None => {
                        log::debug!(
                            "rank {rank}: notice for {} from rank {peer} without a local replica",
                            notice.gid
                        );
                        continue;
                    }
                }
            }
            if let Some(view) = views.get_mut(&notice.gid) {
                view.states.insert(notice.rank, notice.state);
            }
        }
    }

    // 3) final lists to new holders
    let mut finals: BTreeMap<usize, Vec<FinalList>> = BTreeMap::new();
    for (&gid, view) in &views {
        if view.old_holders.first() != Some(&rank) {
            continue;
        }
        let replicas = view.live();
        for &(holder, _) in replicas.iter().filter(|(h, _)| !view.old_holders.contains(h)) {
            finals.entry(holder).or_default().push(FinalList {
                gid,
                replicas: replicas.clone(),
            });
        }
    }
    for (_, lists) in round(comm, FINAL_TAGS, &finals)? {
        for list in lists {
            if let Some(view) = views.get_mut(&list.gid) {
                let own = view.states.get(&rank).copied().flatten();
                view.states = list.replicas.into_iter().map(|(r, p)| (r, Some(p))).collect();
                view.states.insert(rank, own);
            }
        }
    }

    // apply
    for (gid, view) in views {
        match view.states.get(&rank).copied().flatten() {
            Some(priority) => {
                if directory.contains(gid) {
                    if directory.local_priority(gid) != Some(priority) {
                        stats.reprioritized += 1;
                    }
                    directory.set_priority(gid, rank, priority)?;
                } else if let Some(r) = received.remove(&gid) {
                    let kind = r.entity.kind();
                    mesh.upsert(r.entity);
                    directory.insert_local(gid, kind, priority);
                    stats.created += 1;
                } else {
                    continue;
                }
                directory.replace_couplings(gid, view.live())?;
                if directory.entry(gid).map(|e| e.kind()) == Some(EntityKind::Element) {
                    if let Some(&(master, _)) = view.live().iter().find(|(_, p)| p.is_master()) {
                        if let Some(el) = mesh.element_mut(gid) {
                            el.partition = master;
                        }
                    }
                }
            }
            None => {
                if directory.contains(gid) {
                    mesh.remove(gid);
                    directory.remove_replica(gid, rank)?;
                    stats.deleted += 1;
                }
            }
        }
    }

    log::debug!("rank {rank}: committed {stats:?}");
    Ok(stats)
}

/// Per destination: every entity to copy with its merged priority.
fn expand_copies(
    mesh: &LocalMesh,
    directory: &ReplicaDirectory,
    ops: &PendingOps,
) -> BTreeMap<usize, BTreeMap<Gid, Priority>> {
    let mut out: BTreeMap<usize, BTreeMap<Gid, Priority>> = BTreeMap::new();
    let mut add = |dest: usize, gid: Gid, priority: Priority| {
        out.entry(dest)
            .or_default()
            .entry(gid)
            .and_modify(|p| *p = p.merge(priority))
            .or_insert(priority);
    };
    for (&gid, dests) in &ops.copies {
        for (&dest, &priority) in dests {
            add(dest, gid, priority);
            if let Some(element) = mesh.element(gid) {
                let dep = dependent_priority(priority);
                for d in element.dependents().filter(|&d| directory.contains(d)) {
                    add(dest, d, dep);
                }
            }
        }
    }
    out
}

fn merge_received(received: &mut BTreeMap<Gid, Received>, record: CopyRecord) {
    let gid = record.entity.gid();
    match received.get_mut(&gid) {
        Some(r) => {
            r.priority = r.priority.merge(record.priority);
            r.holders.extend(record.holders);
        }
        None => {
            received.insert(
                gid,
                Received {
                    priority: record.priority,
                    entity: record.entity,
                    holders: record.holders.into_iter().collect(),
                },
            );
        }
    }
}

/// Replica states before the epoch, from the directory or, for a new
/// replica, from the holder lists that came with its copies.
fn initial_view(
    directory: &ReplicaDirectory,
    received: &BTreeMap<Gid, Received>,
    gid: Gid,
    rank: usize,
) -> Option<EpochView> {
    if let Some(entry) = directory.entry(gid) {
        return Some(EpochView::from_replicas(entry.replicas(rank)));
    }
    received
        .get(&gid)
        .map(|r| EpochView::from_replicas(r.holders.iter().map(|(&h, &p)| (h, p))))
}

/// One all-to-all round of bincode-encoded record lists.
fn round<C, T>(
    comm: &C,
    tags: ExchangeTags,
    outgoing: &BTreeMap<usize, Vec<T>>,
) -> Result<Vec<(usize, Vec<T>)>, MeshReplicaError>
where
    C: Communicator,
    T: Serialize + DeserializeOwned,
{
    let mut bytes = BTreeMap::new();
    let mut maybe_err = None;
    for (&peer, records) in outgoing {
        match bincode::serialize(records) {
            Ok(buf) => {
                bytes.insert(peer, buf);
            }
            Err(e) => {
                maybe_err.get_or_insert(MeshReplicaError::Encode {
                    peer,
                    reason: e.to_string(),
                });
            }
        }
    }
    if maybe_err.is_some() {
        bytes.clear();
    }
    let incoming = all_to_all(comm, tags, &bytes)?;
    if let Some(err) = maybe_err {
        return Err(err);
    }
    incoming
        .into_iter()
        .filter(|(_, buf)| !buf.is_empty())
        .map(|(peer, buf)| {
            bincode::deserialize::<Vec<T>>(&buf)
                .map(|records| (peer, records))
                .map_err(|e| MeshReplicaError::Decode {
                    peer,
                    reason: e.to_string(),
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;
    use crate::topology::mesh::Node;

    fn gid(v: u64) -> Gid {
        Gid::new(v).unwrap()
    }

    fn serial_mesh() -> (LocalMesh, ReplicaDirectory) {
        let mut mesh = LocalMesh::new(2);
        let mut dir = ReplicaDirectory::new(0);
        for v in 1..=3 {
            mesh.upsert(Entity::Node(Node::new(gid(v), 0, [v as f64, 0.0, 0.0])));
            dir.insert_local(gid(v), EntityKind::Node, Priority::Master);
        }
        (mesh, dir)
    }

    #[test]
    fn pending_copies_merge() {
        let mut ops = PendingOps::default();
        assert!(ops.is_empty());
        ops.copy(gid(1), 2, Priority::HGHOST);
        ops.copy(gid(1), 2, Priority::VGHOST);
        assert_eq!(ops.copies[&gid(1)][&2], Priority::VHGHOST);
    }

    #[test]
    fn serial_delete_and_reprioritize() {
        let (mut mesh, mut dir) = serial_mesh();
        let mut ops = PendingOps::default();
        ops.delete(gid(1));
        ops.set_priority(gid(2), Priority::Border);
        let stats = commit(&NoComm, &mut mesh, &mut dir, ops).unwrap();
        assert_eq!(stats.deleted, 1);
        assert_eq!(stats.reprioritized, 1);
        assert!(!mesh.contains(gid(1)));
        assert_eq!(
            dir.list_replicas(gid(1)),
            Err(MeshReplicaError::ReplicaNotFound(gid(1)))
        );
        assert_eq!(dir.local_priority(gid(2)), Some(Priority::Border));
    }

    #[test]
    fn self_copy_cancels_delete() {
        let (mut mesh, mut dir) = serial_mesh();
        let mut ops = PendingOps::default();
        ops.delete(gid(3));
        ops.copy(gid(3), 0, Priority::HGHOST);
        commit(&NoComm, &mut mesh, &mut dir, ops).unwrap();
        assert!(mesh.contains(gid(3)));
        assert_eq!(dir.local_priority(gid(3)), Some(Priority::HGHOST));
    }

    #[test]
    fn dependents_of_master_copies_are_border() {
        assert_eq!(dependent_priority(Priority::Master), Priority::Border);
        assert_eq!(dependent_priority(Priority::VGHOST), Priority::VGHOST);
    }
}
