//! Turn a partitioning decision into one transaction envelope.

use crate::algs::communicator::Communicator;
use crate::algs::transaction::CommitStats;
use crate::dist_mesh::DistMesh;
use crate::mesh_error::MeshReplicaError;
use crate::topology::point::Gid;
use crate::topology::priority::Priority;
use std::collections::BTreeMap;

/// Move every local master element in `targets` to its target rank.
///
/// A moving element is copied as `Master` to the target and demoted to
/// `HorizontalGhost` here. Its local same-level neighbours go along as
/// horizontal ghosts and its father chain as vertical ghosts, so the new
/// owner can run the ghost pass of the reconstructor. Elements that are not
/// local masters, or whose target is this rank, are ignored.
///
/// Collective: every rank must call this, possibly with an empty map.
pub fn migrate_elements<C: Communicator>(
    dm: &mut DistMesh,
    comm: &C,
    targets: &BTreeMap<Gid, usize>,
) -> Result<CommitStats, MeshReplicaError> {
    let rank = dm.rank();
    let adjacency = dm.mesh().adjacency();
    let mut plan: Vec<(Gid, usize, Priority)> = Vec::new();
    let mut demote: Vec<Gid> = Vec::new();

    for (&gid, &target) in targets {
        if target == rank || dm.directory().local_priority(gid) != Some(Priority::Master) {
            continue;
        }
        let Some(element) = dm.mesh().element(gid) else {
            continue;
        };
        plan.push((gid, target, Priority::Master));
        demote.push(gid);
        for n in adjacency.neighbors(dm.mesh(), element) {
            plan.push((n, target, Priority::HGHOST));
        }
        let mut father = element.father;
        while let Some(f) = father {
            let Some(up) = dm.mesh().element(f) else {
                break;
            };
            plan.push((f, target, Priority::VGHOST));
            father = up.father;
        }
    }
    log::info!(
        "rank {rank}: migrating {} elements ({} copies)",
        demote.len(),
        plan.len()
    );

    dm.begin_transaction()?;
    let buffered = buffer(dm, &plan, &demote);
    let committed = dm.end_transaction(comm);
    buffered?;
    committed
}

fn buffer(
    dm: &mut DistMesh,
    plan: &[(Gid, usize, Priority)],
    demote: &[Gid],
) -> Result<(), MeshReplicaError> {
    for &(gid, target, priority) in plan {
        dm.xfer_copy(gid, target, priority)?;
    }
    for &gid in demote {
        dm.xfer_set_priority(gid, Priority::HGHOST)?;
    }
    Ok(())
}
