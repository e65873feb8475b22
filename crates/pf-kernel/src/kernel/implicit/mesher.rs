//! Surface extraction for implicit shapes
//!
//! Classifies a regular grid of cells as inside/outside, emits the boundary
//! faces between them with shared corner vertices, then snaps each vertex
//! onto the zero level set. The result is closed by construction.

use std::collections::HashMap;

use glam::DVec3;

use super::shape::Shape;
use crate::kernel::{KernelError, KernelResult, TessellatedMesh, TessellationParams};

/// Hard cap on the sampling grid size
const MAX_GRID_CELLS: usize = 8_000_000;

/// Newton steps used to snap vertices onto the surface
const SNAP_ITERATIONS: usize = 2;

/// Neighbor offsets and outward quad corners for the six cell faces.
/// Corner order is counter-clockwise seen from outside.
const FACES: [([i64; 3], [[usize; 3]; 4]); 6] = [
    ([1, 0, 0], [[1, 0, 0], [1, 1, 0], [1, 1, 1], [1, 0, 1]]),
    ([-1, 0, 0], [[0, 1, 0], [0, 0, 0], [0, 0, 1], [0, 1, 1]]),
    ([0, 1, 0], [[1, 1, 0], [0, 1, 0], [0, 1, 1], [1, 1, 1]]),
    ([0, -1, 0], [[0, 0, 0], [1, 0, 0], [1, 0, 1], [0, 0, 1]]),
    ([0, 0, 1], [[0, 0, 1], [1, 0, 1], [1, 1, 1], [0, 1, 1]]),
    ([0, 0, -1], [[0, 1, 0], [1, 1, 0], [1, 0, 0], [0, 0, 0]]),
];

struct Grid {
    origin: DVec3,
    cell: f64,
    dims: [usize; 3],
    inside: Vec<bool>,
}

impl Grid {
    fn index(&self, i: usize, j: usize, k: usize) -> usize {
        (k * self.dims[1] + j) * self.dims[0] + i
    }

    fn is_inside(&self, i: i64, j: i64, k: i64) -> bool {
        if i < 0 || j < 0 || k < 0 {
            return false;
        }
        let (i, j, k) = (i as usize, j as usize, k as usize);
        if i >= self.dims[0] || j >= self.dims[1] || k >= self.dims[2] {
            return false;
        }
        self.inside[self.index(i, j, k)]
    }

    fn corner(&self, key: [usize; 3]) -> DVec3 {
        self.origin + DVec3::new(key[0] as f64, key[1] as f64, key[2] as f64) * self.cell
    }
}

fn sample(shape: &Shape, params: &TessellationParams) -> KernelResult<Option<Grid>> {
    let bounds = shape.bounds();
    if bounds.is_empty() {
        return Ok(None);
    }

    let extent = bounds.extent();
    let longest = extent.max_element();
    if !longest.is_finite() || longest <= 0.0 {
        return Ok(None);
    }

    let max_cells = params.max_cells.max(1) as f64;
    let cell = (longest / max_cells).max(params.linear_tolerance);
    // One empty cell of margin on every side
    let dims = [
        (extent.x / cell).ceil() as usize + 2,
        (extent.y / cell).ceil() as usize + 2,
        (extent.z / cell).ceil() as usize + 2,
    ];
    let total = dims[0] * dims[1] * dims[2];
    if total > MAX_GRID_CELLS {
        return Err(KernelError::TessellationFailed(format!(
            "sampling grid of {} cells exceeds the limit of {}",
            total, MAX_GRID_CELLS
        )));
    }

    let origin = bounds.min - DVec3::splat(cell);
    let mut inside = Vec::with_capacity(total);
    for k in 0..dims[2] {
        for j in 0..dims[1] {
            for i in 0..dims[0] {
                let center = origin + DVec3::new(i as f64 + 0.5, j as f64 + 0.5, k as f64 + 0.5) * cell;
                inside.push(shape.distance(center) < 0.0);
            }
        }
    }

    Ok(Some(Grid {
        origin,
        cell,
        dims,
        inside,
    }))
}

fn gradient(shape: &Shape, p: DVec3, h: f64) -> DVec3 {
    let dx = DVec3::new(h, 0.0, 0.0);
    let dy = DVec3::new(0.0, h, 0.0);
    let dz = DVec3::new(0.0, 0.0, h);
    DVec3::new(
        shape.distance(p + dx) - shape.distance(p - dx),
        shape.distance(p + dy) - shape.distance(p - dy),
        shape.distance(p + dz) - shape.distance(p - dz),
    ) / (2.0 * h)
}

fn snap(shape: &Shape, start: DVec3, cell: f64) -> (DVec3, DVec3) {
    let h = cell * 1e-3;
    let mut p = start;
    for _ in 0..SNAP_ITERATIONS {
        let d = shape.distance(p);
        let g = gradient(shape, p, h);
        let len2 = g.length_squared();
        if !d.is_finite() || len2 < 1e-18 {
            break;
        }
        p -= g * (d / len2);
    }

    // Never move a vertex further than one cell from its grid corner
    let offset = p - start;
    if !offset.is_finite() {
        p = start;
    } else if offset.length() > cell {
        p = start + offset.normalize() * cell;
    }

    let normal = gradient(shape, p, h).normalize_or_zero();
    let normal = if normal == DVec3::ZERO { DVec3::Z } else { normal };
    (p, normal)
}

/// Tessellate an implicit shape into a closed triangle mesh
pub(crate) fn tessellate(shape: &Shape, params: &TessellationParams) -> KernelResult<TessellatedMesh> {
    let Some(grid) = sample(shape, params)? else {
        return Ok(TessellatedMesh::new());
    };

    let mut corner_ids: HashMap<[usize; 3], u32> = HashMap::new();
    let mut corners: Vec<[usize; 3]> = Vec::new();
    let mut indices: Vec<u32> = Vec::new();

    let mut vertex = |key: [usize; 3]| -> u32 {
        *corner_ids.entry(key).or_insert_with(|| {
            corners.push(key);
            (corners.len() - 1) as u32
        })
    };

    for k in 0..grid.dims[2] {
        for j in 0..grid.dims[1] {
            for i in 0..grid.dims[0] {
                if !grid.inside[grid.index(i, j, k)] {
                    continue;
                }
                for (offset, quad) in FACES.iter() {
                    let (ni, nj, nk) = (i as i64 + offset[0], j as i64 + offset[1], k as i64 + offset[2]);
                    if grid.is_inside(ni, nj, nk) {
                        continue;
                    }
                    let ids = quad.map(|c| vertex([i + c[0], j + c[1], k + c[2]]));
                    indices.extend_from_slice(&[ids[0], ids[1], ids[2], ids[0], ids[2], ids[3]]);
                }
            }
        }
    }

    let mut vertices = Vec::with_capacity(corners.len());
    let mut normals = Vec::with_capacity(corners.len());
    for key in &corners {
        let (p, n) = snap(shape, grid.corner(*key), grid.cell);
        vertices.push([p.x as f32, p.y as f32, p.z as f32]);
        normals.push([n.x as f32, n.y as f32, n.z as f32]);
    }

    tracing::debug!(
        cells = grid.inside.len(),
        vertices = vertices.len(),
        triangles = indices.len() / 3,
        "tessellated implicit shape"
    );

    Ok(TessellatedMesh {
        vertices,
        normals,
        indices,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::Primitive;
    use glam::DAffine3;

    fn params(max_cells: u32) -> TessellationParams {
        TessellationParams {
            max_cells,
            ..TessellationParams::default()
        }
    }

    #[test]
    fn test_box_mesh_is_closed_and_sized() {
        let shape = Shape::primitive(
            Primitive::Box {
                size: DVec3::new(2.0, 4.0, 6.0),
            },
            DAffine3::IDENTITY,
        )
        .unwrap();
        let mesh = tessellate(&shape, &params(12)).unwrap();

        assert!(!mesh.is_empty());
        assert!(mesh.is_watertight());

        let (min, max) = mesh.bounds().unwrap();
        assert!((max[0] - min[0] - 2.0).abs() < 0.01);
        assert!((max[1] - min[1] - 4.0).abs() < 0.01);
        assert!((max[2] - min[2] - 6.0).abs() < 0.01);
    }

    #[test]
    fn test_sphere_vertices_lie_on_surface() {
        let shape = Shape::primitive(Primitive::Sphere { radius: 3.0 }, DAffine3::IDENTITY).unwrap();
        let mesh = tessellate(&shape, &params(16)).unwrap();

        assert!(mesh.is_watertight());
        for v in &mesh.vertices {
            let r = (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt();
            assert!((r - 3.0).abs() < 0.05, "vertex radius {}", r);
        }
    }

    #[test]
    fn test_output_is_deterministic() {
        let shape = Shape::primitive(
            Primitive::Cylinder {
                radius: 1.0,
                height: 2.0,
            },
            DAffine3::IDENTITY,
        )
        .unwrap();
        let a = tessellate(&shape, &params(10)).unwrap();
        let b = tessellate(&shape, &params(10)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_angular_tolerance_does_not_change_grid_mesh() {
        let shape = Shape::primitive(Primitive::Sphere { radius: 1.0 }, DAffine3::IDENTITY).unwrap();
        let coarse = TessellationParams {
            angular_tolerance: 0.5,
            ..params(10)
        };
        let fine = TessellationParams {
            angular_tolerance: 0.01,
            ..params(10)
        };
        assert_eq!(tessellate(&shape, &coarse).unwrap(), tessellate(&shape, &fine).unwrap());
    }

    #[test]
    fn test_oversized_grid_is_rejected() {
        let shape = Shape::primitive(Primitive::Sphere { radius: 1.0 }, DAffine3::IDENTITY).unwrap();
        let result = tessellate(&shape, &params(10_000));
        assert!(matches!(result, Err(KernelError::TessellationFailed(_))));
    }
}
