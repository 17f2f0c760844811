//! Consistency reconstruction after a migration epoch.
//!
//! Three passes, each over the given levels coarsest first:
//!
//! 1. ghost priorities, one envelope per level;
//! 2. border priorities, one envelope per level;
//! 3. local repair of vertex fathers, local coordinates and reference
//!    counts, without communication.
//!
//! Ghost decisions for all levels are computed up front from the finest
//! level down, because a coarse element survives as a vertical ghost only if
//! one of its sons survives.

use crate::algs::communicator::Communicator;
use crate::dist_mesh::DistMesh;
use crate::geometry::metrics::physical_to_reference;
use crate::mesh_error::MeshReplicaError;
use crate::topology::mesh::{Adjacency, LocalMesh, Node, NodeOrigin};
use crate::topology::point::Gid;
use crate::topology::priority::{GhostFlags, Priority};
use std::collections::BTreeMap;

/// Tunables of [`DistMesh::reconstruct_consistency_with`].
#[derive(Clone, Debug, PartialEq)]
pub struct ReconstructOptions {
    /// Re-project moved boundary vertices onto their father's geometry.
    pub reproject_moved_boundary: bool,
    /// Residual tolerance of the Newton inversion.
    pub newton_tolerance: f64,
}

impl Default for ReconstructOptions {
    fn default() -> Self {
        Self {
            reproject_moved_boundary: true,
            newton_tolerance: 1e-10,
        }
    }
}

/// What a reconstruction changed on this process.
///
/// Counts are local; a second run without migration in between reports
/// nothing (see [`ReconstructReport::is_empty`]).
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct ReconstructReport {
    /// Priority changes buffered by the ghost and border passes.
    pub priorities_changed: usize,
    /// Replicas deleted by the ghost pass.
    pub deleted: usize,
    /// Vertices given a new father.
    pub fathers_set: usize,
    /// Vertices whose father was cleared, unclassifiable or stale.
    pub fathers_reset: usize,
    /// Vertices whose local coordinates changed.
    pub coordinates_updated: usize,
    /// Moved boundary vertices re-projected onto their father.
    pub reprojected: usize,
    /// Edge, side and son reference counts corrected.
    pub counts_updated: usize,
    /// Moved boundary vertices whose re-projection failed; not a change.
    pub reprojection_failures: usize,
}

impl ReconstructReport {
    /// True if nothing was changed.
    pub fn is_empty(&self) -> bool {
        self.priorities_changed == 0
            && self.deleted == 0
            && self.fathers_set == 0
            && self.fathers_reset == 0
            && self.coordinates_updated == 0
            && self.reprojected == 0
            && self.counts_updated == 0
    }
}

const COORD_EPS: f64 = 1e-12;

/// Levels must be `0, 1, …, n` with no gaps.
///
/// # Errors
/// [`MeshReplicaError::InvalidLevels`] carrying the rejected list.
pub fn validate_levels(levels: &[u8]) -> Result<(), MeshReplicaError> {
    let contiguous = levels.first() == Some(&0) && levels.windows(2).all(|w| w[1] == w[0] + 1);
    if contiguous {
        Ok(())
    } else {
        Err(MeshReplicaError::InvalidLevels(levels.to_vec()))
    }
}

/// Run the three passes over `levels`; collective.
///
/// Each ghost and border envelope is closed even when buffering failed, so
/// peers are never left waiting in a commit.
pub(crate) fn reconstruct<C: Communicator>(
    dm: &mut DistMesh,
    comm: &C,
    levels: &[u8],
    options: &ReconstructOptions,
) -> Result<ReconstructReport, MeshReplicaError> {
    validate_levels(levels)?;
    let mut report = ReconstructReport::default();

    // 1) ghost priorities
    let plan = ghost_plan(dm, levels);
    for &level in levels {
        dm.begin_transaction()?;
        let mut buffered = Ok(());
        if let Some(decisions) = plan.get(&level) {
            for &(gid, decision) in decisions {
                let r = match decision {
                    Some(p) => dm.xfer_set_priority(gid, p),
                    None => dm.xfer_delete(gid),
                };
                if r.is_err() {
                    buffered = r;
                    break;
                }
                match decision {
                    Some(_) => report.priorities_changed += 1,
                    None => report.deleted += 1,
                }
            }
        }
        let committed = dm.end_transaction(comm);
        buffered?;
        committed?;
    }

    // 2) border priorities
    for &level in levels {
        let decisions = border_plan(dm, level);
        dm.begin_transaction()?;
        let mut buffered = Ok(());
        for &(gid, p) in &decisions {
            if let Err(e) = dm.xfer_set_priority(gid, p) {
                buffered = Err(e);
                break;
            }
            report.priorities_changed += 1;
        }
        let committed = dm.end_transaction(comm);
        buffered?;
        committed?;
    }

    // 3) local repair
    repair(dm.mesh_mut(), levels, options, &mut report);

    log::info!("rank {}: reconstruction {:?}", dm.rank(), report);
    Ok(report)
}

/// Per level: `(gid, Some(new priority))` or `(gid, None)` for deletion.
fn ghost_plan(dm: &DistMesh, levels: &[u8]) -> BTreeMap<u8, Vec<(Gid, Option<Priority>)>> {
    let mesh = dm.mesh();
    let dir = dm.directory();
    let adj = mesh.adjacency();
    let is_local_master = |g: Gid| dir.local_priority(g) == Some(Priority::Master);

    // element survival, finest level first
    let mut element_prio: BTreeMap<Gid, Option<Priority>> = BTreeMap::new();
    for &level in levels.iter().rev() {
        for el in mesh.elements_on_level(level) {
            let Some(current) = dir.local_priority(el.gid) else {
                continue;
            };
            if current.is_master() {
                element_prio.insert(el.gid, Some(current));
                continue;
            }
            let mut flags = GhostFlags::NONE;
            if adj.neighbors(mesh, el).into_iter().any(is_local_master) {
                flags = flags | GhostFlags::HORIZONTAL;
            }
            // the son must survive here and be mastered somewhere
            let mastered_son = adj.sons_of(el.gid).iter().any(|s| {
                let kept = element_prio
                    .get(s)
                    .copied()
                    .unwrap_or_else(|| dir.local_priority(*s));
                match kept {
                    Some(Priority::Master) => true,
                    Some(_) => dir
                        .entry(*s)
                        .is_some_and(|e| e.couplings().any(|(_, p)| p.is_master())),
                    None => false,
                }
            });
            if mastered_son {
                flags = flags | GhostFlags::VERTICAL;
            }
            element_prio.insert(el.gid, Priority::ghost(flags));
        }
    }

    let mut plan: BTreeMap<u8, Vec<(Gid, Option<Priority>)>> = BTreeMap::new();
    for &level in levels {
        let decisions = plan.entry(level).or_default();
        for el in mesh.elements_on_level(level) {
            let new = element_prio.get(&el.gid).copied().flatten();
            if new != dir.local_priority(el.gid) {
                decisions.push((el.gid, new));
            }
        }
        for (gid, _) in mesh.lower_dim_on_level(level) {
            let Some(current) = dir.local_priority(gid) else {
                continue;
            };
            let incident = adj.elements_of(gid);
            // nothing beside it: element adjacency has no say
            if incident.is_empty() && current.is_border_or_master() {
                continue;
            }
            let mut beside_master = false;
            let mut flags = GhostFlags::NONE;
            for e in incident {
                let prio = element_prio
                    .get(e)
                    .copied()
                    .unwrap_or_else(|| dir.local_priority(*e));
                match prio {
                    Some(Priority::Master) => beside_master = true,
                    Some(p) => flags = flags | p.ghost_flags(),
                    None => {}
                }
            }
            let new = if beside_master {
                if current.is_ghost() {
                    Some(Priority::Border)
                } else {
                    Some(current)
                }
            } else {
                Priority::ghost(flags)
            };
            if new != Some(current) {
                decisions.push((gid, new));
            }
        }
    }
    plan
}

/// Border/master election among the border-or-master replicas on `level`:
/// the lowest rank becomes `Master`, the others `Border`.
fn border_plan(dm: &DistMesh, level: u8) -> Vec<(Gid, Priority)> {
    let rank = dm.rank();
    let mut out = Vec::new();
    for (gid, _) in dm.mesh().lower_dim_on_level(level) {
        let Ok(replicas) = dm.list_replicas(gid) else {
            continue;
        };
        let Some(&(_, current)) = replicas.iter().find(|(r, _)| *r == rank) else {
            continue;
        };
        if !current.is_border_or_master() {
            continue;
        }
        let elected = replicas
            .iter()
            .find(|(_, p)| p.is_border_or_master())
            .map(|&(r, _)| r);
        let new = if elected == Some(rank) {
            Priority::Master
        } else {
            Priority::Border
        };
        if new != current {
            out.push((gid, new));
        }
    }
    out
}

/// Father and local coordinates a node should have, from its origin.
fn classify(mesh: &LocalMesh, adj: &Adjacency, node: &Node) -> Option<(Gid, [f64; 3])> {
    match &node.origin {
        NodeOrigin::Root | NodeOrigin::Corner(_) => None,
        NodeOrigin::Interior(f) => mesh.element(*f).map(|_| (*f, node.local)),
        NodeOrigin::EdgeMidpoint(edge_gid) => {
            let ends = mesh.edge(*edge_gid).map(|e| e.nodes);
            let mut candidates: Vec<Gid> = adj.elements_of(*edge_gid).to_vec();
            if let Some([a, _]) = ends {
                candidates.extend_from_slice(adj.elements_of(a));
            }
            candidates.sort_unstable();
            candidates.dedup();
            candidates.into_iter().find_map(|g| {
                let el = mesh.element(g)?;
                let pair = match el.edges.iter().position(|e| e == edge_gid) {
                    Some(i) => el.cell_type.edge_corners().get(i).copied(),
                    None => {
                        let [a, b] = ends?;
                        let ia = el.corners.iter().position(|&c| c == a)?;
                        let ib = el.corners.iter().position(|&c| c == b)?;
                        el.cell_type
                            .edge_corners()
                            .iter()
                            .copied()
                            .find(|&[x, y]| (x, y) == (ia, ib) || (x, y) == (ib, ia))
                    }
                }?;
                Some((g, el.cell_type.average_reference(&pair)))
            })
        }
        NodeOrigin::SideCenter(corners) => {
            let first = corners.first()?;
            adj.elements_of(*first).iter().find_map(|&g| {
                let el = mesh.element(g)?;
                el.cell_type.side_corners().into_iter().find_map(|side| {
                    let mut gids: Vec<Gid> = side
                        .iter()
                        .map(|&i| el.corners.get(i).copied())
                        .collect::<Option<Vec<Gid>>>()?;
                    gids.sort_unstable();
                    (gids == *corners).then(|| (g, el.cell_type.average_reference(side)))
                })
            })
        }
    }
}

fn repair(
    mesh: &mut LocalMesh,
    levels: &[u8],
    options: &ReconstructOptions,
    report: &mut ReconstructReport,
) {
    let adj = mesh.adjacency();

    // vertex fathers and local coordinates
    let mut updates: Vec<(Gid, Option<Gid>, [f64; 3], bool)> = Vec::new();
    for node in mesh.nodes().filter(|n| levels.contains(&n.level)) {
        if matches!(node.origin, NodeOrigin::Root | NodeOrigin::Corner(_)) {
            continue;
        }
        match classify(mesh, &adj, node) {
            Some((father, local)) => {
                let father_changed = node.father != Some(father);
                // a boundary vertex keeps its frame only while its father does
                let mut target = if node.boundary && !father_changed {
                    node.local
                } else {
                    local
                };
                let mut clear_moved = false;
                if node.boundary && node.moved && options.reproject_moved_boundary {
                    let projected = mesh
                        .element(father)
                        .and_then(|el| Some((el.cell_type, mesh.corner_positions(el)?)))
                        .ok_or_else(|| {
                            MeshReplicaError::InvalidGeometry("father corners not local".into())
                        })
                        .and_then(|(ct, corners)| {
                            physical_to_reference(
                                ct,
                                &corners,
                                &node.position,
                                options.newton_tolerance,
                            )
                        });
                    match projected {
                        Ok(xi) => {
                            target = xi;
                            clear_moved = true;
                            report.reprojected += 1;
                        }
                        Err(e) => {
                            log::warn!("vertex {}: re-projection failed: {e}", node.gid);
                            report.reprojection_failures += 1;
                        }
                    }
                }
                updates.push((node.gid, Some(father), target, clear_moved));
            }
            None => {
                if node.father.is_some() {
                    log::warn!(
                        "vertex {}: father {:?} cannot be classified, resetting",
                        node.gid,
                        node.father
                    );
                }
                updates.push((node.gid, None, node.local, false));
            }
        }
    }
    for (gid, father, local, clear_moved) in updates {
        let Some(node) = mesh.node_mut(gid) else {
            continue;
        };
        match (node.father, father) {
            (old, new) if old == new => {}
            (_, None) => report.fathers_reset += 1,
            (_, Some(_)) => report.fathers_set += 1,
        }
        node.father = father;
        if differs(node.local, local) {
            node.local = local;
            report.coordinates_updated += 1;
        }
        if clear_moved {
            node.moved = false;
        }
    }

    // reference counts
    let edge_counts: Vec<(Gid, u32)> = mesh
        .edges()
        .map(|e| (e.gid, adj.elements_of(e.gid).len() as u32))
        .collect();
    for (gid, n) in edge_counts {
        if let Some(e) = mesh.edge_mut(gid).filter(|e| e.elem_count != n) {
            e.elem_count = n;
            report.counts_updated += 1;
        }
    }
    let side_counts: Vec<(Gid, u32)> = mesh
        .sides()
        .map(|s| (s.gid, adj.elements_of(s.gid).len() as u32))
        .collect();
    for (gid, n) in side_counts {
        if let Some(s) = mesh.side_mut(gid).filter(|s| s.elem_count != n) {
            s.elem_count = n;
            report.counts_updated += 1;
        }
    }
    let son_counts: Vec<(Gid, u32)> = mesh
        .elements()
        .map(|e| (e.gid, adj.sons_of(e.gid).len() as u32))
        .collect();
    for (gid, n) in son_counts {
        if let Some(e) = mesh.element_mut(gid).filter(|e| e.son_count != n) {
            e.son_count = n;
            report.counts_updated += 1;
        }
    }

    // no father may point outside the local arena
    let stale: Vec<Gid> = mesh
        .nodes()
        .filter(|n| n.father.is_some_and(|f| mesh.element(f).is_none()))
        .map(|n| n.gid)
        .collect();
    for gid in stale {
        if let Some(node) = mesh.node_mut(gid) {
            node.father = None;
            report.fathers_reset += 1;
        }
    }
}

fn differs(a: [f64; 3], b: [f64; 3]) -> bool {
    a.iter().zip(b.iter()).any(|(x, y)| (x - y).abs() > COORD_EPS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;
    use crate::algs::consistency_check::CheckOptions;
    use crate::topology::cell_type::CellType;
    use crate::topology::mesh::{Edge, Element, Entity};

    fn gid(v: u64) -> Gid {
        Gid::new(v).unwrap()
    }

    /// One level-0 quad (corners 1..4, edge 20 between 2 and 3) refined by a
    /// level-1 triangle 40 whose corner 30 is the midpoint of edge 20.
    fn refined_quad() -> DistMesh {
        let mut dm = DistMesh::new(0, 1, 2);
        let pos = [[0.0, 0.0, 0.0], [2.0, 0.0, 0.0], [2.0, 2.0, 0.0], [0.0, 2.0, 0.0]];
        for (i, p) in pos.iter().enumerate() {
            dm.insert_master(Entity::Node(Node::new(gid(1 + i as u64), 0, *p)));
        }
        dm.insert_master(Entity::Edge(Edge::new(gid(20), 0, [gid(2), gid(3)])));
        let mut quad = Element::new(
            gid(10),
            0,
            CellType::Quadrilateral,
            vec![gid(1), gid(2), gid(3), gid(4)],
        );
        quad.edges = vec![gid(90), gid(20), gid(91), gid(92)];
        dm.insert_master(Entity::Element(quad));

        let mut mid = Node::new(gid(30), 1, [2.0, 1.0, 0.0]);
        mid.origin = NodeOrigin::EdgeMidpoint(gid(20));
        mid.father = Some(gid(99));
        dm.insert_master(Entity::Node(mid));
        for (g, corner, p) in [(31, 2, [2.0, 0.0, 0.0]), (33, 1, [0.0, 0.0, 0.0])] {
            let mut n = Node::new(gid(g), 1, p);
            n.origin = NodeOrigin::Corner(gid(corner));
            dm.insert_master(Entity::Node(n));
        }
        let mut son = Element::new(
            gid(40),
            1,
            CellType::Triangle,
            vec![gid(31), gid(30), gid(33)],
        );
        son.father = Some(gid(10));
        dm.insert_master(Entity::Element(son));
        dm
    }

    #[test]
    fn levels_must_start_at_zero_and_be_contiguous() {
        assert!(validate_levels(&[0, 1, 2]).is_ok());
        let cases: [&[u8]; 4] = [&[], &[1, 2], &[0, 2], &[1, 0]];
        for bad in cases {
            assert_eq!(
                validate_levels(bad),
                Err(MeshReplicaError::InvalidLevels(bad.to_vec()))
            );
        }
    }

    #[test]
    fn midpoint_gets_father_and_edge_average() {
        let mut dm = refined_quad();
        let report = dm.reconstruct_consistency(&NoComm, &[0, 1]).unwrap();
        let mid = dm.mesh().node(gid(30)).unwrap();
        assert_eq!(mid.father, Some(gid(10)));
        assert_eq!(mid.local, [1.0, 0.5, 0.0]);
        assert_eq!(report.fathers_set, 1);
        assert_eq!(dm.mesh().edge(gid(20)).unwrap().elem_count, 1);
        assert_eq!(dm.mesh().element(gid(10)).unwrap().son_count, 1);

        let again = dm.reconstruct_consistency(&NoComm, &[0, 1]).unwrap();
        assert!(again.is_empty(), "{again:?}");
    }

    #[test]
    fn unclassifiable_midpoint_loses_father() {
        let mut dm = refined_quad();
        dm.mesh_mut().node_mut(gid(30)).unwrap().origin = NodeOrigin::EdgeMidpoint(gid(77));
        let report = dm.reconstruct_consistency(&NoComm, &[0, 1]).unwrap();
        assert_eq!(dm.mesh().node(gid(30)).unwrap().father, None);
        assert_eq!(report.fathers_reset, 1);
    }

    #[test]
    fn moved_boundary_vertex_is_reprojected() {
        let mut dm = refined_quad();
        {
            let mid = dm.mesh_mut().node_mut(gid(30)).unwrap();
            mid.boundary = true;
            mid.moved = true;
            mid.position = [2.0, 1.5, 0.0];
        }
        let report = dm.reconstruct_consistency(&NoComm, &[0, 1]).unwrap();
        let mid = dm.mesh().node(gid(30)).unwrap();
        assert_eq!(report.reprojected, 1);
        assert!(!mid.moved);
        assert!((mid.local[0] - 1.0).abs() < 1e-9 && (mid.local[1] - 0.75).abs() < 1e-9);
        assert!(dm.reconstruct_consistency(&NoComm, &[0, 1]).unwrap().is_empty());
    }

    #[test]
    fn boundary_vertex_follows_new_father_without_reprojection() {
        let mut dm = refined_quad();
        {
            let mid = dm.mesh_mut().node_mut(gid(30)).unwrap();
            mid.boundary = true;
            mid.local = [0.25, 0.25, 0.0];
        }
        let options = ReconstructOptions {
            reproject_moved_boundary: false,
            ..ReconstructOptions::default()
        };
        let report = dm
            .reconstruct_consistency_with(&NoComm, &[0, 1], &options)
            .unwrap();
        let mid = dm.mesh().node(gid(30)).unwrap();
        assert_eq!(mid.father, Some(gid(10)));
        assert_eq!(mid.local, [1.0, 0.5, 0.0]);
        assert_eq!(report.reprojected, 0);

        // same father: the boundary frame is left alone
        dm.mesh_mut().node_mut(gid(30)).unwrap().local = [1.0, 0.6, 0.0];
        dm.reconstruct_consistency_with(&NoComm, &[0, 1], &options)
            .unwrap();
        assert_eq!(dm.mesh().node(gid(30)).unwrap().local, [1.0, 0.6, 0.0]);
    }

    #[test]
    fn short_corner_list_leaves_side_point_unclassified() {
        let mut dm = refined_quad();
        dm.mesh_mut().element_mut(gid(10)).unwrap().corners.truncate(2);
        dm.mesh_mut().node_mut(gid(30)).unwrap().origin =
            NodeOrigin::SideCenter(vec![gid(2), gid(3)]);
        let report = dm.reconstruct_consistency(&NoComm, &[0, 1]).unwrap();
        assert_eq!(dm.mesh().node(gid(30)).unwrap().father, None);
        assert_eq!(report.fathers_reset, 1);
    }

    #[test]
    fn edges_without_listing_elements_survive() {
        let mut dm = refined_quad();
        // 21 lies along a quad side, 22 across its diagonal
        dm.insert_master(Entity::Edge(Edge::new(gid(21), 0, [gid(1), gid(2)])));
        dm.insert_master(Entity::Edge(Edge::new(gid(22), 0, [gid(1), gid(3)])));
        let report = dm.reconstruct_consistency(&NoComm, &[0, 1]).unwrap();
        assert_eq!(report.deleted, 0);
        assert_eq!(dm.directory().local_priority(gid(21)), Some(Priority::Master));
        assert_eq!(dm.directory().local_priority(gid(22)), Some(Priority::Master));
        assert_eq!(dm.mesh().edge(gid(21)).unwrap().elem_count, 1);
        assert_eq!(dm.mesh().edge(gid(22)).unwrap().elem_count, 0);
        let check = dm
            .check_consistency(&NoComm, &[0, 1], &CheckOptions::default())
            .unwrap();
        assert!(check.is_consistent(), "{:?}", check.divergences);
    }

    #[test]
    fn ghost_son_does_not_keep_its_father() {
        let mut dm = refined_quad();
        dm.insert_master(Entity::Node(Node::new(gid(34), 1, [1.0, 1.0, 0.0])));
        dm.insert_master(Entity::Element(Element::new(
            gid(41),
            1,
            CellType::Triangle,
            vec![gid(31), gid(30), gid(34)],
        )));
        dm.begin_transaction().unwrap();
        dm.xfer_set_priority(gid(10), Priority::HGHOST).unwrap();
        dm.xfer_set_priority(gid(40), Priority::HGHOST).unwrap();
        dm.end_transaction(&NoComm).unwrap();
        dm.reconstruct_consistency(&NoComm, &[0, 1]).unwrap();
        // 40 stays as a horizontal ghost of 41 but is mastered nowhere
        assert_eq!(dm.directory().local_priority(gid(40)), Some(Priority::HGHOST));
        assert!(dm.mesh().element(gid(10)).is_none());
        assert_eq!(dm.directory().local_priority(gid(10)), None);
    }

    #[test]
    fn ghost_with_master_son_becomes_vertical() {
        let mut dm = refined_quad();
        dm.begin_transaction().unwrap();
        dm.xfer_set_priority(gid(10), Priority::HGHOST).unwrap();
        dm.end_transaction(&NoComm).unwrap();
        dm.reconstruct_consistency(&NoComm, &[0, 1]).unwrap();
        assert_eq!(dm.directory().local_priority(gid(10)), Some(Priority::VGHOST));
        assert_eq!(dm.directory().local_priority(gid(1)), Some(Priority::VGHOST));
        assert_eq!(dm.directory().local_priority(gid(30)), Some(Priority::Master));
    }

    #[test]
    fn orphan_ghosts_are_deleted() {
        let mut dm = refined_quad();
        dm.begin_transaction().unwrap();
        dm.xfer_set_priority(gid(10), Priority::HGHOST).unwrap();
        dm.xfer_set_priority(gid(40), Priority::HGHOST).unwrap();
        dm.end_transaction(&NoComm).unwrap();
        let report = dm.reconstruct_consistency(&NoComm, &[0, 1]).unwrap();
        assert!(dm.mesh().element(gid(10)).is_none());
        assert!(dm.directory().is_empty());
        // two elements, five level-0 and three level-1 lower-dimensional entities
        assert_eq!(report.deleted, 10);
    }
}
