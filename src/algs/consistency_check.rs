//! Distributed invariant checker.
//!
//! Pure verification over the entities on the given levels. Every detected
//! problem becomes one [`Divergence`] record, is logged with `log::warn!`
//! and counts as one error; nothing is repaired.
//!
//! Passes, selected by [`CheckOptions`]:
//! 1. local audit of priorities against ownership and adjacency;
//! 2. master uniqueness per directory entry, reported by the lowest-ranked
//!    holder only;
//! 3. cross-process identity of element corners (and, in 3-D, edges and
//!    edge midpoints) over [`ELEMENT_SYMMETRIC`];
//! 4. coupling consistency over [`ALL_SYMMETRIC`]: every replica's own
//!    priority and replica count against its partners' records.

use crate::algs::communicator::{CommTag, Communicator, ExchangeTags};
use crate::algs::exchange::all_reduce_sum;
use crate::algs::gather_scatter::{GatherScatter, gather_scatter};
use crate::algs::reconstruct::validate_levels;
use crate::algs::wire::{get_u64s, put_u64s};
use crate::mesh_error::MeshReplicaError;
use crate::overlap::directory::ReplicaDirectory;
use crate::overlap::interface::{
    ALL_SYMMETRIC, Direction, ELEMENT_SYMMETRIC, InterfaceItem, InterfaceRegistry,
};
use crate::topology::cell_type::{MAX_CORNERS, MAX_EDGES};
use crate::topology::mesh::{EntityKind, LocalMesh};
use crate::topology::point::Gid;
use crate::topology::priority::Priority;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::fmt;

const IDENTITY_TAGS: ExchangeTags = ExchangeTags::from_base(CommTag::new(0x6100));
const COUPLING_TAGS: ExchangeTags = ExchangeTags::from_base(CommTag::new(0x6102));
const REDUCE_TAGS: ExchangeTags = ExchangeTags::from_base(CommTag::new(0x6104));

/// Which checker passes to run. Must be identical on every rank.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckOptions {
    pub local_audit: bool,
    pub uniqueness: bool,
    pub identity: bool,
    pub coupling_consistency: bool,
}

impl Default for CheckOptions {
    fn default() -> Self {
        Self {
            local_audit: true,
            uniqueness: true,
            identity: true,
            coupling_consistency: false,
        }
    }
}

impl CheckOptions {
    /// Every pass, including the coupling pass.
    pub fn all() -> Self {
        Self {
            coupling_consistency: true,
            ..Self::default()
        }
    }

    /// Only the cross-process identity pass.
    pub fn identity_only() -> Self {
        Self {
            local_audit: false,
            uniqueness: false,
            identity: true,
            coupling_consistency: false,
        }
    }
}

/// Position inside the identity payload of an element.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdentitySlot {
    CornerCount,
    Corner(usize),
    Edge(usize),
    Midpoint(usize),
}

impl IdentitySlot {
    fn of_word(i: usize) -> Self {
        match i {
            0 => IdentitySlot::CornerCount,
            i if i <= MAX_CORNERS => IdentitySlot::Corner(i - 1),
            i if (i - 1 - MAX_CORNERS) % 2 == 0 => IdentitySlot::Edge((i - 1 - MAX_CORNERS) / 2),
            i => IdentitySlot::Midpoint((i - 1 - MAX_CORNERS) / 2),
        }
    }
}

/// One detected inconsistency.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Divergence {
    /// Element priority disagrees with its recorded partition.
    PriorityOwnership {
        element: Gid,
        priority: Priority,
        partition: usize,
    },
    /// `Master`/`Border` node, edge or side vector whose incident local
    /// elements include no master.
    UnsupportedBorder {
        gid: Gid,
        kind: EntityKind,
        priority: Priority,
    },
    /// Ghost node, edge or side vector next to a local master element.
    GhostBesideMaster {
        gid: Gid,
        kind: EntityKind,
        priority: Priority,
    },
    /// Horizontal ghost element without a same-level local master neighbour.
    OrphanHorizontalGhost { element: Gid },
    /// Vertical ghost element without a local son that is mastered somewhere.
    OrphanVerticalGhost { element: Gid },
    /// Vertex father that is not a local element.
    StaleFather { node: Gid, father: Gid },
    /// Local master replica while the directory records other masters.
    ConflictingMaster {
        gid: Gid,
        kind: EntityKind,
        others: Vec<usize>,
    },
    /// Number of master replicas violates uniqueness.
    MasterCount {
        gid: Gid,
        kind: EntityKind,
        count: usize,
        processes: Vec<usize>,
    },
    /// Two replicas of an element disagree on a corner, edge or midpoint.
    IdentityMismatch {
        element: Gid,
        peer: usize,
        slot: IdentitySlot,
        expected: u64,
        observed: u64,
    },
    /// A peer's own priority differs from the coupling recorded here.
    CouplingMismatch {
        gid: Gid,
        peer: usize,
        recorded: Priority,
        claimed: Priority,
    },
    /// Two holders disagree on the number of replicas.
    ReplicaCountMismatch {
        gid: Gid,
        peer: usize,
        ours: usize,
        theirs: usize,
    },
    /// Records for entities this process does not couple with the sender.
    UnmatchedRecords { interface: String, count: usize },
}

impl fmt::Display for Divergence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Divergence::PriorityOwnership {
                element,
                priority,
                partition,
            } => write!(
                f,
                "element {element} has priority {priority} but partition {partition}"
            ),
            Divergence::UnsupportedBorder { gid, kind, priority } => write!(
                f,
                "{kind:?} {gid} is {priority} without an adjacent local master element"
            ),
            Divergence::GhostBesideMaster { gid, kind, priority } => write!(
                f,
                "{kind:?} {gid} is {priority} next to a local master element"
            ),
            Divergence::OrphanHorizontalGhost { element } => write!(
                f,
                "horizontal ghost element {element} has no local master neighbour"
            ),
            Divergence::OrphanVerticalGhost { element } => {
                write!(f, "vertical ghost element {element} has no son with a master replica")
            }
            Divergence::StaleFather { node, father } => {
                write!(f, "vertex {node} has father {father}, which is not local")
            }
            Divergence::ConflictingMaster { gid, kind, others } => write!(
                f,
                "{kind:?} {gid} is master here and on processes {others:?}"
            ),
            Divergence::MasterCount {
                gid,
                kind,
                count,
                processes,
            } => write!(
                f,
                "{kind:?} {gid} has {count} master replicas on processes {processes:?}"
            ),
            Divergence::IdentityMismatch {
                element,
                peer,
                slot,
                expected,
                observed,
            } => write!(
                f,
                "element {element} {slot:?}: rank {peer} has {expected}, local replica has {observed}"
            ),
            Divergence::CouplingMismatch {
                gid,
                peer,
                recorded,
                claimed,
            } => write!(
                f,
                "{gid}: rank {peer} holds {claimed}, recorded here as {recorded}"
            ),
            Divergence::ReplicaCountMismatch {
                gid,
                peer,
                ours,
                theirs,
            } => write!(
                f,
                "{gid}: {ours} replicas known here, {theirs} on rank {peer}"
            ),
            Divergence::UnmatchedRecords { interface, count } => {
                write!(f, "{count} unmatched records on interface {interface}")
            }
        }
    }
}

/// Outcome of one checker run on this process.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ConsistencyReport {
    pub rank: usize,
    /// Errors detected by this process.
    pub errors: usize,
    /// Sum of `errors` over all processes.
    pub global_errors: u64,
    pub divergences: Vec<Divergence>,
}

impl ConsistencyReport {
    /// True if no process found an error.
    pub fn is_consistent(&self) -> bool {
        self.global_errors == 0
    }

    fn push(&mut self, d: Divergence) {
        log::warn!("rank {}: {d}", self.rank);
        self.errors += 1;
        self.divergences.push(d);
    }
}

pub(crate) fn check<C: Communicator>(
    comm: &C,
    mesh: &LocalMesh,
    directory: &ReplicaDirectory,
    registry: &mut InterfaceRegistry,
    levels: &[u8],
    options: &CheckOptions,
) -> Result<ConsistencyReport, MeshReplicaError> {
    validate_levels(levels)?;
    let mut report = ConsistencyReport {
        rank: comm.rank(),
        ..ConsistencyReport::default()
    };

    if options.local_audit {
        local_audit(mesh, directory, levels, &mut report);
    }
    if options.uniqueness {
        uniqueness_audit(mesh, directory, levels, &mut report);
    }
    if options.identity {
        let iface = registry.interface(directory, &ELEMENT_SYMMETRIC);
        let mut round = IdentityRound {
            mesh,
            levels,
            rank: comm.rank(),
            found: BTreeMap::new(),
        };
        let stats = gather_scatter(
            comm,
            iface,
            Direction::ExchangeSymmetric,
            &mut round,
            IDENTITY_TAGS,
        )?;
        for d in round.found.into_values() {
            report.push(d);
        }
        if stats.unmatched > 0 {
            report.push(Divergence::UnmatchedRecords {
                interface: ELEMENT_SYMMETRIC.name.into(),
                count: stats.unmatched,
            });
        }
    }
    if options.coupling_consistency {
        let iface = registry.interface(directory, &ALL_SYMMETRIC);
        let mut round = CouplingRound {
            directory,
            rank: comm.rank(),
            found: Vec::new(),
        };
        let stats = gather_scatter(
            comm,
            iface,
            Direction::ExchangeSymmetric,
            &mut round,
            COUPLING_TAGS,
        )?;
        for d in round.found {
            report.push(d);
        }
        if stats.unmatched > 0 {
            report.push(Divergence::UnmatchedRecords {
                interface: ALL_SYMMETRIC.name.into(),
                count: stats.unmatched,
            });
        }
    }

    report.global_errors = all_reduce_sum(comm, REDUCE_TAGS, report.errors as u64)?;
    log::info!(
        "rank {}: consistency check found {} local / {} global errors",
        report.rank,
        report.errors,
        report.global_errors
    );
    Ok(report)
}

fn local_audit(
    mesh: &LocalMesh,
    directory: &ReplicaDirectory,
    levels: &[u8],
    report: &mut ConsistencyReport,
) {
    let rank = directory.rank();
    let adj = mesh.adjacency();
    let is_local_master = |g: Gid| directory.local_priority(g) == Some(Priority::Master);

    for el in mesh.elements().filter(|e| levels.contains(&e.level)) {
        let Some(priority) = directory.local_priority(el.gid) else {
            continue;
        };
        if priority.is_master() != (el.partition == rank) {
            report.push(Divergence::PriorityOwnership {
                element: el.gid,
                priority,
                partition: el.partition,
            });
        }
        let flags = priority.ghost_flags();
        if flags.horizontal() && !adj.neighbors(mesh, el).into_iter().any(is_local_master) {
            report.push(Divergence::OrphanHorizontalGhost { element: el.gid });
        }
        let mastered_son = adj
            .sons_of(el.gid)
            .iter()
            .any(|&s| directory.entry(s).is_some_and(|e| e.has_master()));
        if flags.vertical() && !mastered_son {
            report.push(Divergence::OrphanVerticalGhost { element: el.gid });
        }
    }

    for level in levels {
        for (gid, kind) in mesh.lower_dim_on_level(*level) {
            let Some(priority) = directory.local_priority(gid) else {
                continue;
            };
            let incident = adj.elements_of(gid);
            let beside_master = incident.iter().any(|&e| is_local_master(e));
            if priority.is_border_or_master() && !beside_master && !incident.is_empty() {
                report.push(Divergence::UnsupportedBorder {
                    gid,
                    kind,
                    priority,
                });
            }
            if priority.is_ghost() && beside_master {
                report.push(Divergence::GhostBesideMaster {
                    gid,
                    kind,
                    priority,
                });
            }
        }
    }

    for node in mesh.nodes().filter(|n| levels.contains(&n.level)) {
        if let Some(father) = node.father.filter(|&f| mesh.element(f).is_none()) {
            report.push(Divergence::StaleFather {
                node: node.gid,
                father,
            });
        }
    }

    for (gid, entry) in directory.iter() {
        if !entry.local_priority().is_master() || !on_levels(mesh, gid, levels) {
            continue;
        }
        let others: Vec<usize> = entry
            .couplings()
            .filter(|(_, p)| p.is_master())
            .map(|(r, _)| r)
            .collect();
        if !others.is_empty() {
            report.push(Divergence::ConflictingMaster {
                gid,
                kind: entry.kind(),
                others,
            });
        }
    }
}

fn uniqueness_audit(
    mesh: &LocalMesh,
    directory: &ReplicaDirectory,
    levels: &[u8],
    report: &mut ConsistencyReport,
) {
    let rank = directory.rank();
    for (gid, entry) in directory.iter() {
        if !on_levels(mesh, gid, levels) {
            continue;
        }
        // one report per entity: the lowest-ranked holder speaks
        if entry.couplings().next().is_some_and(|(r, _)| r < rank) {
            continue;
        }
        let masters = entry.master_ranks(rank);
        let violated = match entry.kind() {
            EntityKind::Element => masters.len() != 1,
            _ => masters.len() > 1,
        };
        if violated {
            report.push(Divergence::MasterCount {
                gid,
                kind: entry.kind(),
                count: masters.len(),
                processes: masters,
            });
        }
    }
}

fn on_levels(mesh: &LocalMesh, gid: Gid, levels: &[u8]) -> bool {
    mesh.level_of(gid).is_some_and(|l| levels.contains(&l))
}

/// Number of u64 words in the identity payload of a `dimension`-D mesh.
fn identity_words(dimension: u8) -> usize {
    let edges = if dimension == 3 { 2 * MAX_EDGES } else { 0 };
    1 + MAX_CORNERS + edges
}

/// Corner count, corner GIDs and, in 3-D, (edge, midpoint) GID pairs;
/// 0 marks an absent slot.
fn identity_payload(mesh: &LocalMesh, element: Gid) -> Vec<u64> {
    let mut words = vec![0u64; identity_words(mesh.dimension())];
    let Some(el) = mesh.element(element) else {
        return words;
    };
    words[0] = el.corners.len() as u64;
    for (i, c) in el.corners.iter().take(MAX_CORNERS).enumerate() {
        words[1 + i] = c.get();
    }
    if mesh.dimension() == 3 {
        for (i, e) in el.edges.iter().take(MAX_EDGES).enumerate() {
            let at = 1 + MAX_CORNERS + 2 * i;
            words[at] = e.get();
            words[at + 1] = Gid::to_wire(mesh.edge(*e).and_then(|edge| edge.midpoint));
        }
    }
    words
}

struct IdentityRound<'a> {
    mesh: &'a LocalMesh,
    levels: &'a [u8],
    rank: usize,
    /// Keyed by element and payload word.
    found: BTreeMap<(Gid, usize), Divergence>,
}

impl GatherScatter for IdentityRound<'_> {
    fn payload_size(&self) -> usize {
        identity_words(self.mesh.dimension()) * 8
    }

    fn gather(
        &mut self,
        item: &InterfaceItem,
        _peer: usize,
        out: &mut Vec<u8>,
    ) -> Result<(), MeshReplicaError> {
        put_u64s(out, &identity_payload(self.mesh, item.gid));
        Ok(())
    }

    fn scatter(
        &mut self,
        item: &InterfaceItem,
        peer: usize,
        data: &[u8],
    ) -> Result<(), MeshReplicaError> {
        // the master's view is authoritative; between two non-masters the
        // lower rank is, so every pair is compared once
        let compare = item.remote.is_master() || (!item.local.is_master() && peer < self.rank);
        if !compare || !on_levels(self.mesh, item.gid, self.levels) {
            return Ok(());
        }
        let theirs = get_u64s(data);
        let ours = identity_payload(self.mesh, item.gid);
        for (i, (&expected, &observed)) in theirs.iter().zip(ours.iter()).enumerate() {
            if expected == observed {
                continue;
            }
            let record = Divergence::IdentityMismatch {
                element: item.gid,
                peer,
                slot: IdentitySlot::of_word(i),
                expected,
                observed,
            };
            // one record per slot; the master's view replaces a ghost's
            match self.found.entry((item.gid, i)) {
                Entry::Vacant(v) => {
                    v.insert(record);
                }
                Entry::Occupied(mut o) if item.remote.is_master() => {
                    o.insert(record);
                }
                Entry::Occupied(_) => {}
            }
        }
        Ok(())
    }
}

struct CouplingRound<'a> {
    directory: &'a ReplicaDirectory,
    rank: usize,
    found: Vec<Divergence>,
}

impl CouplingRound<'_> {
    fn replica_count(&self, gid: Gid) -> usize {
        self.directory
            .entry(gid)
            .map_or(0, |e| e.couplings().count() + 1)
    }
}

impl GatherScatter for CouplingRound<'_> {
    fn payload_size(&self) -> usize {
        16
    }

    fn gather(
        &mut self,
        item: &InterfaceItem,
        _peer: usize,
        out: &mut Vec<u8>,
    ) -> Result<(), MeshReplicaError> {
        put_u64s(
            out,
            &[
                u64::from(item.local.to_wire()),
                self.replica_count(item.gid) as u64,
            ],
        );
        Ok(())
    }

    fn scatter(
        &mut self,
        item: &InterfaceItem,
        peer: usize,
        data: &[u8],
    ) -> Result<(), MeshReplicaError> {
        let words = get_u64s(data);
        let code = u8::try_from(words[0]).map_err(|_| MeshReplicaError::Decode {
            peer,
            reason: format!("priority code {} out of range", words[0]),
        })?;
        let claimed = Priority::from_wire(code)?;
        if claimed != item.remote {
            self.found.push(Divergence::CouplingMismatch {
                gid: item.gid,
                peer,
                recorded: item.remote,
                claimed,
            });
        }
        let theirs = words[1] as usize;
        let ours = self.replica_count(item.gid);
        if theirs != ours && self.rank < peer {
            self.found.push(Divergence::ReplicaCountMismatch {
                gid: item.gid,
                peer,
                ours,
                theirs,
            });
        }
        Ok(())
    }
}
