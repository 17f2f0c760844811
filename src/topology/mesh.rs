//! Process-local mesh arena.
//!
//! Entities live in GID-keyed maps; every cross-entity relationship (corners,
//! edges, father element, vertex father) is a [`Gid`] looked up through the
//! arena. A relationship whose target is not held locally is therefore a
//! representable "stale" state rather than a dangling reference.
//!
//! `BTreeMap` storage keeps iteration deterministic, which interface
//! construction and the checker's diagnostics rely on.

use crate::debug_invariants::DebugInvariants;
use crate::mesh_error::MeshReplicaError;
use crate::topology::cell_type::CellType;
use crate::topology::point::Gid;
use std::collections::{BTreeMap, BTreeSet};

/// Kind of a distributed entity.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub enum EntityKind {
    Node,
    Edge,
    SideVector,
    Element,
}

/// How a node came into existence relative to the coarser level.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum NodeOrigin {
    /// Level-0 node built by the mesh builder.
    Root,
    /// Copy of a coarser node at the same position.
    Corner(Gid),
    /// Midpoint of a father edge.
    EdgeMidpoint(Gid),
    /// Center of a father side, identified by its sorted corner GIDs.
    SideCenter(Vec<Gid>),
    /// Interior point of a father element.
    Interior(Gid),
}

/// A mesh node together with its vertex data.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Node {
    pub gid: Gid,
    pub level: u8,
    pub position: [f64; 3],
    pub origin: NodeOrigin,
    /// Derived: element whose local frame `local` is expressed in.
    pub father: Option<Gid>,
    /// Derived: local coordinates inside `father`.
    pub local: [f64; 3],
    pub boundary: bool,
    /// Set when a boundary vertex was moved and needs re-projection.
    pub moved: bool,
    /// Field value carried by the node.
    pub value: f64,
}

impl Node {
    pub fn new(gid: Gid, level: u8, position: [f64; 3]) -> Self {
        Self {
            gid,
            level,
            position,
            origin: NodeOrigin::Root,
            father: None,
            local: [0.0; 3],
            boundary: false,
            moved: false,
            value: 0.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Edge {
    pub gid: Gid,
    pub level: u8,
    pub nodes: [Gid; 2],
    pub midpoint: Option<Gid>,
    /// Derived: number of local elements referencing this edge.
    pub elem_count: u32,
}

impl Edge {
    pub fn new(gid: Gid, level: u8, nodes: [Gid; 2]) -> Self {
        Self {
            gid,
            level,
            nodes,
            midpoint: None,
            elem_count: 0,
        }
    }
}

/// Degree-of-freedom carrier attached to an element side.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SideVector {
    pub gid: Gid,
    pub level: u8,
    /// Sorted corner GIDs of the side.
    pub corners: Vec<Gid>,
    /// Derived: number of local elements referencing this side vector.
    pub elem_count: u32,
    pub value: f64,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Element {
    pub gid: Gid,
    pub level: u8,
    pub cell_type: CellType,
    pub corners: Vec<Gid>,
    /// Edge GIDs ordered like [`CellType::edge_corners`], possibly empty.
    pub edges: Vec<Gid>,
    /// Side vector GIDs ordered like [`CellType::side_corners`], possibly empty.
    pub sides: Vec<Gid>,
    pub father: Option<Gid>,
    /// Rank holding the master copy.
    pub partition: usize,
    /// Derived: number of local son elements.
    pub son_count: u32,
}

impl Element {
    pub fn new(gid: Gid, level: u8, cell_type: CellType, corners: Vec<Gid>) -> Self {
        Self {
            gid,
            level,
            cell_type,
            corners,
            edges: Vec::new(),
            sides: Vec::new(),
            father: None,
            partition: 0,
            son_count: 0,
        }
    }

    /// Lower-dimensional entities this element depends on.
    pub fn dependents(&self) -> impl Iterator<Item = Gid> + '_ {
        self.corners
            .iter()
            .chain(self.edges.iter())
            .chain(self.sides.iter())
            .copied()
    }

    /// True if nodes `a` and `b` are the ends of one of this element's edges,
    /// judged by corner position alone.
    pub fn has_edge_between(&self, a: Gid, b: Gid) -> bool {
        let position = |g: Gid| self.corners.iter().position(|&c| c == g);
        let (Some(ia), Some(ib)) = (position(a), position(b)) else {
            return false;
        };
        self.cell_type
            .edge_corners()
            .iter()
            .any(|&[x, y]| (x, y) == (ia, ib) || (x, y) == (ib, ia))
    }
}

/// Owned snapshot of any entity, used for transfer.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Entity {
    Node(Node),
    Edge(Edge),
    SideVector(SideVector),
    Element(Element),
}

impl Entity {
    pub fn gid(&self) -> Gid {
        match self {
            Entity::Node(n) => n.gid,
            Entity::Edge(e) => e.gid,
            Entity::SideVector(s) => s.gid,
            Entity::Element(e) => e.gid,
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::Node(_) => EntityKind::Node,
            Entity::Edge(_) => EntityKind::Edge,
            Entity::SideVector(_) => EntityKind::SideVector,
            Entity::Element(_) => EntityKind::Element,
        }
    }

    pub fn level(&self) -> u8 {
        match self {
            Entity::Node(n) => n.level,
            Entity::Edge(e) => e.level,
            Entity::SideVector(s) => s.level,
            Entity::Element(e) => e.level,
        }
    }
}

/// All entities held by one process.
#[derive(Clone, Debug, Default)]
pub struct LocalMesh {
    dimension: u8,
    nodes: BTreeMap<Gid, Node>,
    edges: BTreeMap<Gid, Edge>,
    sides: BTreeMap<Gid, SideVector>,
    elements: BTreeMap<Gid, Element>,
}

impl LocalMesh {
    pub fn new(dimension: u8) -> Self {
        Self {
            dimension,
            ..Self::default()
        }
    }

    /// Spatial dimension (2 or 3).
    pub fn dimension(&self) -> u8 {
        self.dimension
    }

    /// Insert or replace an entity.
    pub fn upsert(&mut self, entity: Entity) {
        match entity {
            Entity::Node(n) => {
                self.nodes.insert(n.gid, n);
            }
            Entity::Edge(e) => {
                self.edges.insert(e.gid, e);
            }
            Entity::SideVector(s) => {
                self.sides.insert(s.gid, s);
            }
            Entity::Element(e) => {
                self.elements.insert(e.gid, e);
            }
        }
    }

    /// Remove an entity, returning its last state.
    pub fn remove(&mut self, gid: Gid) -> Option<Entity> {
        if let Some(n) = self.nodes.remove(&gid) {
            return Some(Entity::Node(n));
        }
        if let Some(e) = self.edges.remove(&gid) {
            return Some(Entity::Edge(e));
        }
        if let Some(s) = self.sides.remove(&gid) {
            return Some(Entity::SideVector(s));
        }
        self.elements.remove(&gid).map(Entity::Element)
    }

    pub fn contains(&self, gid: Gid) -> bool {
        self.kind_of(gid).is_some()
    }

    pub fn kind_of(&self, gid: Gid) -> Option<EntityKind> {
        if self.nodes.contains_key(&gid) {
            Some(EntityKind::Node)
        } else if self.edges.contains_key(&gid) {
            Some(EntityKind::Edge)
        } else if self.sides.contains_key(&gid) {
            Some(EntityKind::SideVector)
        } else if self.elements.contains_key(&gid) {
            Some(EntityKind::Element)
        } else {
            None
        }
    }

    /// Owned snapshot of an entity.
    pub fn entity(&self, gid: Gid) -> Result<Entity, MeshReplicaError> {
        if let Some(n) = self.nodes.get(&gid) {
            return Ok(Entity::Node(n.clone()));
        }
        if let Some(e) = self.edges.get(&gid) {
            return Ok(Entity::Edge(e.clone()));
        }
        if let Some(s) = self.sides.get(&gid) {
            return Ok(Entity::SideVector(s.clone()));
        }
        self.elements
            .get(&gid)
            .cloned()
            .map(Entity::Element)
            .ok_or(MeshReplicaError::UnknownEntity(gid))
    }

    /// Level of any local entity.
    pub fn level_of(&self, gid: Gid) -> Option<u8> {
        self.nodes
            .get(&gid)
            .map(|n| n.level)
            .or_else(|| self.edges.get(&gid).map(|e| e.level))
            .or_else(|| self.sides.get(&gid).map(|s| s.level))
            .or_else(|| self.elements.get(&gid).map(|e| e.level))
    }

    pub fn node(&self, gid: Gid) -> Option<&Node> {
        self.nodes.get(&gid)
    }

    pub fn node_mut(&mut self, gid: Gid) -> Option<&mut Node> {
        self.nodes.get_mut(&gid)
    }

    pub fn edge(&self, gid: Gid) -> Option<&Edge> {
        self.edges.get(&gid)
    }

    pub fn edge_mut(&mut self, gid: Gid) -> Option<&mut Edge> {
        self.edges.get_mut(&gid)
    }

    pub fn side(&self, gid: Gid) -> Option<&SideVector> {
        self.sides.get(&gid)
    }

    pub fn side_mut(&mut self, gid: Gid) -> Option<&mut SideVector> {
        self.sides.get_mut(&gid)
    }

    pub fn element(&self, gid: Gid) -> Option<&Element> {
        self.elements.get(&gid)
    }

    pub fn element_mut(&mut self, gid: Gid) -> Option<&mut Element> {
        self.elements.get_mut(&gid)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn nodes_mut(&mut self) -> impl Iterator<Item = &mut Node> {
        self.nodes.values_mut()
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.values()
    }

    pub fn sides(&self) -> impl Iterator<Item = &SideVector> {
        self.sides.values()
    }

    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.elements.values()
    }

    pub fn elements_on_level(&self, level: u8) -> impl Iterator<Item = &Element> {
        self.elements.values().filter(move |e| e.level == level)
    }

    /// Non-element entities on `level`, in GID order per kind.
    pub fn lower_dim_on_level(&self, level: u8) -> Vec<(Gid, EntityKind)> {
        let mut out: Vec<(Gid, EntityKind)> = self
            .nodes
            .values()
            .filter(|n| n.level == level)
            .map(|n| (n.gid, EntityKind::Node))
            .collect();
        out.extend(
            self.edges
                .values()
                .filter(|e| e.level == level)
                .map(|e| (e.gid, EntityKind::Edge)),
        );
        out.extend(
            self.sides
                .values()
                .filter(|s| s.level == level)
                .map(|s| (s.gid, EntityKind::SideVector)),
        );
        out
    }

    /// All levels holding at least one entity.
    pub fn levels(&self) -> BTreeSet<u8> {
        self.nodes
            .values()
            .map(|n| n.level)
            .chain(self.elements.values().map(|e| e.level))
            .chain(self.edges.values().map(|e| e.level))
            .chain(self.sides.values().map(|s| s.level))
            .collect()
    }

    /// Positions of an element's corners, `None` if a corner is not local.
    pub fn corner_positions(&self, element: &Element) -> Option<Vec<[f64; 3]>> {
        element
            .corners
            .iter()
            .map(|c| self.nodes.get(c).map(|n| n.position))
            .collect()
    }

    /// Build the element incidence index of the current contents.
    pub fn adjacency(&self) -> Adjacency {
        let mut adj = Adjacency::default();
        for e in self.elements.values() {
            for d in e.dependents() {
                adj.incident.entry(d).or_default().push(e.gid);
            }
            if let Some(f) = e.father {
                adj.sons.entry(f).or_default().push(e.gid);
            }
        }
        // an edge missing from `Element::edges` is still incident through its ends
        for edge in self.edges.values() {
            let [a, b] = edge.nodes;
            let mut through_ends: Vec<Gid> = adj
                .elements_of(a)
                .iter()
                .copied()
                .filter(|g| self.elements.get(g).is_some_and(|el| el.has_edge_between(a, b)))
                .collect();
            if through_ends.is_empty() {
                continue;
            }
            let list = adj.incident.entry(edge.gid).or_default();
            list.append(&mut through_ends);
            list.sort_unstable();
            list.dedup();
        }
        adj
    }
}

impl DebugInvariants for LocalMesh {
    const NAME: &'static str = "LocalMesh";

    /// A local father element lies exactly one level above its son.
    fn validate_invariants(&self) -> Result<(), MeshReplicaError> {
        for el in self.elements.values() {
            let Some(father) = el.father.and_then(|f| self.elements.get(&f)) else {
                continue;
            };
            if el.level.checked_sub(1) != Some(father.level) {
                return Err(MeshReplicaError::InvalidHierarchy {
                    element: el.gid,
                    father: father.gid,
                });
            }
        }
        Ok(())
    }
}

/// Element incidence of nodes, edges and side vectors, plus father → sons.
///
/// Element lists are in ascending GID order because elements are visited in
/// arena order.
#[derive(Clone, Debug, Default)]
pub struct Adjacency {
    incident: BTreeMap<Gid, Vec<Gid>>,
    sons: BTreeMap<Gid, Vec<Gid>>,
}

impl Adjacency {
    /// Local elements referencing a node, edge or side vector.
    pub fn elements_of(&self, gid: Gid) -> &[Gid] {
        self.incident.get(&gid).map_or(&[], Vec::as_slice)
    }

    /// Local elements whose father is `gid`.
    pub fn sons_of(&self, gid: Gid) -> &[Gid] {
        self.sons.get(&gid).map_or(&[], Vec::as_slice)
    }

    /// Same-level local neighbours of `element`: elements sharing a full side.
    pub fn neighbors(&self, mesh: &LocalMesh, element: &Element) -> Vec<Gid> {
        let shared_needed = element.cell_type.dimension() as usize;
        let mut counts: BTreeMap<Gid, usize> = BTreeMap::new();
        for c in &element.corners {
            for &other in self.elements_of(*c) {
                if other != element.gid {
                    *counts.entry(other).or_default() += 1;
                }
            }
        }
        counts
            .into_iter()
            .filter(|(gid, n)| {
                *n >= shared_needed
                    && mesh
                        .element(*gid)
                        .is_some_and(|o| o.level == element.level)
            })
            .map(|(gid, _)| gid)
            .collect()
    }
}
