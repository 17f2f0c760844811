#![allow(dead_code)]
use mesh_replica::{
    algs::communicator::{Communicator, LocalComm},
    dist_mesh::DistMesh,
    topology::cell_type::CellType,
    topology::mesh::{Edge, Element, Entity, Node, NodeOrigin},
    topology::point::Gid,
    topology::priority::Priority,
};

pub fn gid(u: u64) -> Gid {
    Gid::new(u).unwrap()
}

/// Run `f` once per rank of an `n`-rank in-process world, each on its own
/// thread; results come back in rank order.
pub fn run_ranks<T, F>(n: usize, f: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(LocalComm) -> T + Send + Sync + Clone + 'static,
{
    let handles: Vec<_> = LocalComm::world(n)
        .into_iter()
        .map(|comm| {
            let f = f.clone();
            std::thread::spawn(move || f(comm))
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

pub const E: u64 = 10;
pub const F: u64 = 11;
/// Level-1 son of `F`.
pub const S: u64 = 12;
pub const T1: u64 = 50;
pub const T2: u64 = 51;

/// Two unit quads sharing the side 101–102, all mastered by the caller:
///
/// ```text
/// 103 ── 102 ── 105
///  │  E   │  F   │
/// 100 ── 101 ── 104
/// ```
pub fn seed_two_quads(dm: &mut DistMesh) {
    let nodes = [
        (100, [0.0, 0.0, 0.0]),
        (101, [1.0, 0.0, 0.0]),
        (102, [1.0, 1.0, 0.0]),
        (103, [0.0, 1.0, 0.0]),
        (104, [2.0, 0.0, 0.0]),
        (105, [2.0, 1.0, 0.0]),
    ];
    for (g, p) in nodes {
        dm.insert_master(Entity::Node(Node::new(gid(g), 0, p)));
    }
    for (g, corners) in [(E, [100, 101, 102, 103]), (F, [101, 104, 105, 102])] {
        dm.insert_master(Entity::Element(Element::new(
            gid(g),
            0,
            CellType::Quadrilateral,
            corners.iter().map(|&c| gid(c)).collect(),
        )));
    }
}

/// Refine `F` by one level-1 quad `S` on copies of its corners
/// (201, 204, 205, 202).
pub fn refine_f(dm: &mut DistMesh) {
    for (g, corner, p) in [
        (201, 101, [1.0, 0.0, 0.0]),
        (204, 104, [2.0, 0.0, 0.0]),
        (205, 105, [2.0, 1.0, 0.0]),
        (202, 102, [1.0, 1.0, 0.0]),
    ] {
        let mut n = Node::new(gid(g), 1, p);
        n.origin = NodeOrigin::Corner(gid(corner));
        dm.insert_master(Entity::Node(n));
    }
    let mut son = Element::new(
        gid(S),
        1,
        CellType::Quadrilateral,
        [201, 204, 205, 202].iter().map(|&c| gid(c)).collect(),
    );
    son.father = Some(gid(F));
    dm.insert_master(Entity::Element(son));
}

/// Two tetrahedra sharing the face 2–3–4, with every edge listed and a
/// midpoint GID on edge 20 (1–2), which only `T1` has.
pub fn seed_two_tets(dm: &mut DistMesh) {
    let nodes = [
        (1, [0.0, 0.0, 0.0]),
        (2, [1.0, 0.0, 0.0]),
        (3, [0.0, 1.0, 0.0]),
        (4, [0.0, 0.0, 1.0]),
        (5, [1.0, 1.0, 1.0]),
    ];
    for (g, p) in nodes {
        dm.insert_master(Entity::Node(Node::new(gid(g), 0, p)));
    }
    let edges = [
        (20, [1, 2]),
        (21, [2, 3]),
        (22, [1, 3]),
        (23, [1, 4]),
        (24, [2, 4]),
        (25, [3, 4]),
        (26, [2, 5]),
        (27, [3, 5]),
        (28, [4, 5]),
    ];
    for (g, [a, b]) in edges {
        let mut e = Edge::new(gid(g), 0, [gid(a), gid(b)]);
        if g == 20 {
            e.midpoint = Some(gid(60));
        }
        dm.insert_master(Entity::Edge(e));
    }
    for (g, corners, edges) in [
        (T1, [1, 2, 3, 4], [20, 21, 22, 23, 24, 25]),
        (T2, [2, 3, 4, 5], [21, 25, 24, 26, 27, 28]),
    ] {
        let mut tet = Element::new(
            gid(g),
            0,
            CellType::Tetrahedron,
            corners.iter().map(|&c| gid(c)).collect(),
        );
        tet.edges = edges.iter().map(|&e| gid(e)).collect();
        dm.insert_master(Entity::Element(tet));
    }
}

/// Rank 0 seeds the two quads; every rank returns its share.
pub fn seeded(comm: &LocalComm) -> DistMesh {
    let mut dm = DistMesh::for_comm(comm, 2);
    if comm.rank() == 0 {
        seed_two_quads(&mut dm);
    }
    dm
}

/// Hand `F` to rank 1 as master and `E` as a horizontal ghost, in one
/// explicit envelope.
pub fn hand_over(dm: &mut DistMesh, comm: &LocalComm) {
    hand_over_pair(dm, comm, E, F);
}

/// Hand `moving` to rank 1 as master and `staying` as a horizontal ghost.
pub fn hand_over_pair(dm: &mut DistMesh, comm: &LocalComm, staying: u64, moving: u64) {
    dm.begin_transaction().unwrap();
    if comm.rank() == 0 {
        dm.xfer_copy(gid(moving), 1, Priority::Master).unwrap();
        dm.xfer_copy(gid(staying), 1, Priority::HGHOST).unwrap();
        dm.xfer_set_priority(gid(moving), Priority::HGHOST).unwrap();
    }
    dm.end_transaction(comm).unwrap();
}
