use pf_kernel::TessellatedMesh;

use super::ExportError;

fn face_normal(v0: [f32; 3], v1: [f32; 3], v2: [f32; 3]) -> [f32; 3] {
    let e1 = [v1[0] - v0[0], v1[1] - v0[1], v1[2] - v0[2]];
    let e2 = [v2[0] - v0[0], v2[1] - v0[1], v2[2] - v0[2]];
    let cross = [
        e1[1] * e2[2] - e1[2] * e2[1],
        e1[2] * e2[0] - e1[0] * e2[2],
        e1[0] * e2[1] - e1[1] * e2[0],
    ];
    let len = (cross[0] * cross[0] + cross[1] * cross[1] + cross[2] * cross[2]).sqrt();
    if len > 0.0 {
        [cross[0] / len, cross[1] / len, cross[2] / len]
    } else {
        [0.0, 0.0, 1.0]
    }
}

/// Encode a mesh as binary STL with per-facet normals
pub fn encode_stl(mesh: &TessellatedMesh) -> Result<Vec<u8>, ExportError> {
    let triangles: Vec<stl_io::Triangle> = mesh
        .triangles()
        .map(|[v0, v1, v2]| stl_io::Triangle {
            normal: stl_io::Normal::new(face_normal(v0, v1, v2)),
            vertices: [
                stl_io::Vertex::new(v0),
                stl_io::Vertex::new(v1),
                stl_io::Vertex::new(v2),
            ],
        })
        .collect();

    let mut out = Vec::with_capacity(84 + triangles.len() * 50);
    stl_io::write_stl(&mut out, triangles.iter()).map_err(|e| ExportError::Encode(e.to_string()))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn tetrahedron() -> TessellatedMesh {
        TessellatedMesh {
            vertices: vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            normals: vec![[0.0, 0.0, 1.0]; 4],
            indices: vec![0, 2, 1, 0, 1, 3, 1, 2, 3, 0, 3, 2],
        }
    }

    #[test]
    fn test_binary_layout_and_read_back() {
        let bytes = encode_stl(&tetrahedron()).unwrap();
        assert_eq!(bytes.len(), 84 + 4 * 50);
        assert_eq!(u32::from_le_bytes([bytes[80], bytes[81], bytes[82], bytes[83]]), 4);

        let mesh = stl_io::read_stl(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(mesh.faces.len(), 4);
        assert_eq!(mesh.vertices.len(), 4);
        assert!(mesh.validate().is_ok());
    }

    #[test]
    fn test_face_normal_points_outward() {
        // Bottom face wound clockwise from above faces -Z
        let n = face_normal([0.0, 0.0, 0.0], [0.0, 1.0, 0.0], [1.0, 0.0, 0.0]);
        assert_eq!(n, [0.0, 0.0, -1.0]);
        assert_eq!(face_normal([0.0; 3], [0.0; 3], [0.0; 3]), [0.0, 0.0, 1.0]);
    }
}
