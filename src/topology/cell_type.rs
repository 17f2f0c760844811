//! Element shapes and their reference-element tables.
//!
//! Corner numbering follows the reference elements used by
//! [`crate::geometry::metrics`]; edge and side tables index into that
//! numbering. Refinement relies on these tables being identical on every
//! process, since father-relative positions are classified through them.

/// Element shapes supported by the replica layer.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum CellType {
    /// 2D simplex (triangle).
    Triangle,
    /// 2D tensor-product cell (quad).
    Quadrilateral,
    /// 3D simplex (tet).
    Tetrahedron,
    /// 3D tensor-product cell (hex).
    Hexahedron,
}

const TRIANGLE_CORNERS: [[f64; 3]; 3] = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]];
const QUAD_CORNERS: [[f64; 3]; 4] = [
    [0.0, 0.0, 0.0],
    [1.0, 0.0, 0.0],
    [1.0, 1.0, 0.0],
    [0.0, 1.0, 0.0],
];
const TET_CORNERS: [[f64; 3]; 4] = [
    [0.0, 0.0, 0.0],
    [1.0, 0.0, 0.0],
    [0.0, 1.0, 0.0],
    [0.0, 0.0, 1.0],
];
const HEX_CORNERS: [[f64; 3]; 8] = [
    [0.0, 0.0, 0.0],
    [1.0, 0.0, 0.0],
    [1.0, 1.0, 0.0],
    [0.0, 1.0, 0.0],
    [0.0, 0.0, 1.0],
    [1.0, 0.0, 1.0],
    [1.0, 1.0, 1.0],
    [0.0, 1.0, 1.0],
];

const TRIANGLE_EDGES: [[usize; 2]; 3] = [[0, 1], [1, 2], [2, 0]];
const QUAD_EDGES: [[usize; 2]; 4] = [[0, 1], [1, 2], [2, 3], [3, 0]];
const TET_EDGES: [[usize; 2]; 6] = [[0, 1], [1, 2], [0, 2], [0, 3], [1, 3], [2, 3]];
const HEX_EDGES: [[usize; 2]; 12] = [
    [0, 1],
    [1, 2],
    [2, 3],
    [3, 0],
    [0, 4],
    [1, 5],
    [2, 6],
    [3, 7],
    [4, 5],
    [5, 6],
    [6, 7],
    [7, 4],
];

const TET_SIDES: [&[usize]; 4] = [&[0, 2, 1], &[1, 2, 3], &[0, 3, 2], &[0, 1, 3]];
const HEX_SIDES: [&[usize]; 6] = [
    &[0, 3, 2, 1],
    &[0, 1, 5, 4],
    &[1, 2, 6, 5],
    &[2, 3, 7, 6],
    &[3, 0, 4, 7],
    &[4, 5, 6, 7],
];

/// Largest corner count of any supported shape.
pub const MAX_CORNERS: usize = 8;
/// Largest edge count of any supported shape.
pub const MAX_EDGES: usize = 12;

impl CellType {
    /// Topological dimension of the cell.
    pub fn dimension(self) -> u8 {
        match self {
            CellType::Triangle | CellType::Quadrilateral => 2,
            CellType::Tetrahedron | CellType::Hexahedron => 3,
        }
    }

    pub fn corner_count(self) -> usize {
        self.reference_corners().len()
    }

    /// Reference coordinates of the corners (unused components are 0).
    pub fn reference_corners(self) -> &'static [[f64; 3]] {
        match self {
            CellType::Triangle => &TRIANGLE_CORNERS,
            CellType::Quadrilateral => &QUAD_CORNERS,
            CellType::Tetrahedron => &TET_CORNERS,
            CellType::Hexahedron => &HEX_CORNERS,
        }
    }

    /// Corner index pairs of every edge.
    pub fn edge_corners(self) -> &'static [[usize; 2]] {
        match self {
            CellType::Triangle => &TRIANGLE_EDGES,
            CellType::Quadrilateral => &QUAD_EDGES,
            CellType::Tetrahedron => &TET_EDGES,
            CellType::Hexahedron => &HEX_EDGES,
        }
    }

    /// Corner index lists of every side. In 2D the sides are the edges.
    pub fn side_corners(self) -> Vec<&'static [usize]> {
        match self {
            CellType::Triangle => TRIANGLE_EDGES.iter().map(|e| e.as_slice()).collect(),
            CellType::Quadrilateral => QUAD_EDGES.iter().map(|e| e.as_slice()).collect(),
            CellType::Tetrahedron => TET_SIDES.to_vec(),
            CellType::Hexahedron => HEX_SIDES.to_vec(),
        }
    }

    /// Equal-weight average of the reference coordinates of `corners`.
    pub fn average_reference(self, corners: &[usize]) -> [f64; 3] {
        let reference = self.reference_corners();
        let mut out = [0.0; 3];
        if corners.is_empty() {
            return out;
        }
        for &c in corners {
            for (o, r) in out.iter_mut().zip(reference[c].iter()) {
                *o += r;
            }
        }
        let n = corners.len() as f64;
        out.map(|v| v / n)
    }
}
