//! Reference-element mappings used to express vertices in father-local frames.
//!
//! The reference elements use the vertex ordering of
//! [`CellType::reference_corners`]:
//! - Triangle: `(r, s)` in the unit right triangle.
//! - Quadrilateral: `(r, s)` in `[0, 1]^2`.
//! - Tetrahedron: `(r, s, t)` in the unit tetrahedron.
//! - Hexahedron: `(r, s, t)` in `[0, 1]^3`.
//!
//! Local coordinates are always returned as `[f64; 3]` with unused
//! components set to zero, matching how [`crate::topology::mesh::Node`]
//! stores them.

use crate::mesh_error::MeshReplicaError;
use crate::topology::cell_type::CellType;

const EPS: f64 = 1e-12;

/// Map a point in reference coordinates to physical coordinates.
pub fn reference_to_physical(
    cell_type: CellType,
    vertices: &[[f64; 3]],
    reference_point: &[f64; 3],
) -> Result<[f64; 3], MeshReplicaError> {
    let (weights, _) = shape_functions(cell_type, reference_point);
    check_vertex_count(weights.len(), vertices.len())?;
    let mut out = [0.0; 3];
    for (weight, vertex) in weights.iter().zip(vertices.iter()) {
        out[0] += weight * vertex[0];
        out[1] += weight * vertex[1];
        out[2] += weight * vertex[2];
    }
    Ok(out)
}

/// Jacobian columns `d x / d xi_k` at a reference point.
pub fn jacobian_columns(
    cell_type: CellType,
    vertices: &[[f64; 3]],
    reference_point: &[f64; 3],
) -> Result<Vec<[f64; 3]>, MeshReplicaError> {
    let (_, grads) = shape_functions(cell_type, reference_point);
    check_vertex_count(grads.len(), vertices.len())?;
    let dim = cell_type.dimension() as usize;
    let mut cols = vec![[0.0; 3]; dim];
    for (vertex, grad) in vertices.iter().zip(grads.iter()) {
        for (k, col) in cols.iter_mut().enumerate() {
            col[0] += vertex[0] * grad[k];
            col[1] += vertex[1] * grad[k];
            col[2] += vertex[2] * grad[k];
        }
    }
    Ok(cols)
}

/// Pull a physical vector back into reference space using a least-squares solve.
pub fn pull_back_vector(
    cell_type: CellType,
    vertices: &[[f64; 3]],
    reference_point: &[f64; 3],
    physical_vector: &[f64; 3],
) -> Result<[f64; 3], MeshReplicaError> {
    let cols = jacobian_columns(cell_type, vertices, reference_point)?;
    match cols.len() {
        2 => {
            let a = dot(cols[0], cols[0]);
            let b = dot(cols[0], cols[1]);
            let c = dot(cols[1], cols[1]);
            let det = a * c - b * b;
            if det.abs() <= EPS {
                return Err(MeshReplicaError::InvalidGeometry("degenerate jacobian".into()));
            }
            let rhs0 = dot(cols[0], *physical_vector);
            let rhs1 = dot(cols[1], *physical_vector);
            let inv_det = 1.0 / det;
            Ok([
                (c * rhs0 - b * rhs1) * inv_det,
                (-b * rhs0 + a * rhs1) * inv_det,
                0.0,
            ])
        }
        3 => {
            let mut mat = [0.0; 9];
            for i in 0..3 {
                for j in 0..3 {
                    mat[i * 3 + j] = dot(cols[i], cols[j]);
                }
            }
            let rhs = [
                dot(cols[0], *physical_vector),
                dot(cols[1], *physical_vector),
                dot(cols[2], *physical_vector),
            ];
            let inv = invert_3x3(mat)?;
            Ok([
                inv[0] * rhs[0] + inv[1] * rhs[1] + inv[2] * rhs[2],
                inv[3] * rhs[0] + inv[4] * rhs[1] + inv[5] * rhs[2],
                inv[6] * rhs[0] + inv[7] * rhs[1] + inv[8] * rhs[2],
            ])
        }
        dim => Err(MeshReplicaError::InvalidGeometry(format!(
            "unsupported reference dimension: {dim}"
        ))),
    }
}

/// Map a physical point back to reference coordinates using Newton iteration.
///
/// Exact after one step for simplices; multilinear shapes converge in a few
/// iterations for non-degenerate cells.
pub fn physical_to_reference(
    cell_type: CellType,
    vertices: &[[f64; 3]],
    physical_point: &[f64; 3],
    tolerance: f64,
) -> Result<[f64; 3], MeshReplicaError> {
    let dim = cell_type.dimension() as usize;
    let mut ref_point = [0.0; 3];
    for r in ref_point.iter_mut().take(dim) {
        *r = 0.25;
    }
    for _ in 0..30 {
        let mapped = reference_to_physical(cell_type, vertices, &ref_point)?;
        let residual = sub(mapped, *physical_point);
        if norm(residual) <= tolerance {
            return Ok(ref_point);
        }
        let correction = pull_back_vector(cell_type, vertices, &ref_point, &residual)?;
        for (r, c) in ref_point.iter_mut().zip(correction.iter()) {
            *r -= c;
        }
    }
    Err(MeshReplicaError::InvalidGeometry(format!(
        "newton inversion did not converge for {cell_type:?}"
    )))
}

fn check_vertex_count(expected: usize, found: usize) -> Result<(), MeshReplicaError> {
    if expected == found {
        Ok(())
    } else {
        Err(MeshReplicaError::InvalidGeometry(format!(
            "vertex count mismatch: expected {expected}, got {found}"
        )))
    }
}

fn shape_functions(cell_type: CellType, reference_point: &[f64; 3]) -> (Vec<f64>, Vec<[f64; 3]>) {
    let [r, s, t] = *reference_point;
    match cell_type {
        CellType::Triangle => (
            vec![1.0 - r - s, r, s],
            vec![[-1.0, -1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
        ),
        CellType::Quadrilateral => (
            vec![(1.0 - r) * (1.0 - s), r * (1.0 - s), r * s, (1.0 - r) * s],
            vec![
                [-(1.0 - s), -(1.0 - r), 0.0],
                [1.0 - s, -r, 0.0],
                [s, r, 0.0],
                [-s, 1.0 - r, 0.0],
            ],
        ),
        CellType::Tetrahedron => (
            vec![1.0 - r - s - t, r, s, t],
            vec![
                [-1.0, -1.0, -1.0],
                [1.0, 0.0, 0.0],
                [0.0, 1.0, 0.0],
                [0.0, 0.0, 1.0],
            ],
        ),
        CellType::Hexahedron => {
            let rm = 1.0 - r;
            let sm = 1.0 - s;
            let tm = 1.0 - t;
            (
                vec![
                    rm * sm * tm,
                    r * sm * tm,
                    r * s * tm,
                    rm * s * tm,
                    rm * sm * t,
                    r * sm * t,
                    r * s * t,
                    rm * s * t,
                ],
                vec![
                    [-sm * tm, -rm * tm, -rm * sm],
                    [sm * tm, -r * tm, -r * sm],
                    [s * tm, r * tm, -r * s],
                    [-s * tm, rm * tm, -rm * s],
                    [-sm * t, -rm * t, rm * sm],
                    [sm * t, -r * t, r * sm],
                    [s * t, r * t, r * s],
                    [-s * t, rm * t, rm * s],
                ],
            )
        }
    }
}

fn sub(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn norm(a: [f64; 3]) -> f64 {
    dot(a, a).sqrt()
}

fn invert_3x3(mat: [f64; 9]) -> Result<[f64; 9], MeshReplicaError> {
    let det = mat[0] * (mat[4] * mat[8] - mat[5] * mat[7])
        - mat[1] * (mat[3] * mat[8] - mat[5] * mat[6])
        + mat[2] * (mat[3] * mat[7] - mat[4] * mat[6]);
    if det.abs() <= EPS {
        return Err(MeshReplicaError::InvalidGeometry("degenerate jacobian".into()));
    }
    let inv_det = 1.0 / det;
    Ok([
        (mat[4] * mat[8] - mat[5] * mat[7]) * inv_det,
        (mat[2] * mat[7] - mat[1] * mat[8]) * inv_det,
        (mat[1] * mat[5] - mat[2] * mat[4]) * inv_det,
        (mat[5] * mat[6] - mat[3] * mat[8]) * inv_det,
        (mat[0] * mat[8] - mat[2] * mat[6]) * inv_det,
        (mat[2] * mat[3] - mat[0] * mat[5]) * inv_det,
        (mat[3] * mat[7] - mat[4] * mat[6]) * inv_det,
        (mat[1] * mat[6] - mat[0] * mat[7]) * inv_det,
        (mat[0] * mat[4] - mat[1] * mat[3]) * inv_det,
    ])
}
