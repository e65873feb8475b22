use std::fmt::Write as _;

use pf_kernel::TessellatedMesh;

/// Encode a mesh as Wavefront OBJ text with vertex normals
pub fn encode_obj(mesh: &TessellatedMesh) -> Vec<u8> {
    let mut out = String::with_capacity(mesh.vertices.len() * 64 + mesh.indices.len() * 8);
    out.push_str("# partforge\no part\n");
    // Writing into a String cannot fail
    for v in &mesh.vertices {
        let _ = writeln!(out, "v {:.6} {:.6} {:.6}", v[0], v[1], v[2]);
    }
    let has_normals = mesh.normals.len() == mesh.vertices.len();
    if has_normals {
        for n in &mesh.normals {
            let _ = writeln!(out, "vn {:.6} {:.6} {:.6}", n[0], n[1], n[2]);
        }
    }
    for tri in mesh.indices.chunks_exact(3) {
        let (a, b, c) = (tri[0] + 1, tri[1] + 1, tri[2] + 1);
        if has_normals {
            let _ = writeln!(out, "f {a}//{a} {b}//{b} {c}//{c}");
        } else {
            let _ = writeln!(out, "f {a} {b} {c}");
        }
    }
    out.into_bytes()
}
