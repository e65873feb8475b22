//! Binary glTF 2.0 (GLB) encoder
//!
//! One mesh, one node, one scene. The binary chunk holds positions, then
//! normals (when present), then `u32` indices.

use pf_kernel::TessellatedMesh;
use serde_json::{Value, json};

use super::ExportError;

const GLB_MAGIC: u32 = 0x4654_6C67;
const GLB_VERSION: u32 = 2;
const CHUNK_JSON: u32 = 0x4E4F_534A;
const CHUNK_BIN: u32 = 0x004E_4942;

const ARRAY_BUFFER: u32 = 34962;
const ELEMENT_ARRAY_BUFFER: u32 = 34963;
const COMPONENT_FLOAT: u32 = 5126;
const COMPONENT_UNSIGNED_INT: u32 = 5125;
const MODE_TRIANGLES: u32 = 4;

fn pad_to_four(data: &mut Vec<u8>, fill: u8) {
    while data.len() % 4 != 0 {
        data.push(fill);
    }
}

/// Append 4-byte components in glTF's little-endian order
fn extend_le<T: bytemuck::Pod>(bin: &mut Vec<u8>, values: &[T]) {
    bin.extend_from_slice(bytemuck::cast_slice(values));
    #[cfg(target_endian = "big")]
    {
        let start = bin.len() - std::mem::size_of_val(values);
        for word in bin[start..].chunks_exact_mut(4) {
            word.reverse();
        }
    }
}

fn position_bounds(mesh: &TessellatedMesh) -> (Value, Value) {
    match mesh.bounds() {
        Some((min, max)) => (json!(min), json!(max)),
        None => (json!([0.0, 0.0, 0.0]), json!([0.0, 0.0, 0.0])),
    }
}

/// Encode a mesh as a GLB container
pub fn encode_glb(mesh: &TessellatedMesh) -> Result<Vec<u8>, ExportError> {
    let vertex_count = mesh.vertices.len();
    let has_normals = mesh.normals.len() == vertex_count;

    let mut bin: Vec<u8> = Vec::new();
    let mut views = Vec::new();
    let mut accessors = Vec::new();

    let (min, max) = position_bounds(mesh);
    views.push(json!({
        "buffer": 0,
        "byteOffset": bin.len(),
        "byteLength": vertex_count * 12,
        "target": ARRAY_BUFFER,
    }));
    extend_le(&mut bin, &mesh.vertices);
    accessors.push(json!({
        "bufferView": 0,
        "componentType": COMPONENT_FLOAT,
        "count": vertex_count,
        "type": "VEC3",
        "min": min,
        "max": max,
    }));

    let mut attributes = json!({ "POSITION": 0 });
    if has_normals {
        views.push(json!({
            "buffer": 0,
            "byteOffset": bin.len(),
            "byteLength": vertex_count * 12,
            "target": ARRAY_BUFFER,
        }));
        extend_le(&mut bin, &mesh.normals);
        accessors.push(json!({
            "bufferView": views.len() - 1,
            "componentType": COMPONENT_FLOAT,
            "count": vertex_count,
            "type": "VEC3",
        }));
        attributes["NORMAL"] = json!(accessors.len() - 1);
    }

    views.push(json!({
        "buffer": 0,
        "byteOffset": bin.len(),
        "byteLength": mesh.indices.len() * 4,
        "target": ELEMENT_ARRAY_BUFFER,
    }));
    extend_le(&mut bin, &mesh.indices);
    accessors.push(json!({
        "bufferView": views.len() - 1,
        "componentType": COMPONENT_UNSIGNED_INT,
        "count": mesh.indices.len(),
        "type": "SCALAR",
    }));
    let index_accessor = accessors.len() - 1;
    pad_to_four(&mut bin, 0);

    let document = json!({
        "asset": { "version": "2.0", "generator": "partforge" },
        "scene": 0,
        "scenes": [{ "nodes": [0] }],
        "nodes": [{ "mesh": 0, "name": "part" }],
        "meshes": [{
            "primitives": [{
                "attributes": attributes,
                "indices": index_accessor,
                "mode": MODE_TRIANGLES,
            }]
        }],
        "buffers": [{ "byteLength": bin.len() }],
        "bufferViews": views,
        "accessors": accessors,
    });
    let mut json_chunk = serde_json::to_vec(&document).map_err(|e| ExportError::Encode(e.to_string()))?;
    pad_to_four(&mut json_chunk, b' ');

    let total = 12 + 8 + json_chunk.len() + 8 + bin.len();
    let total = u32::try_from(total).map_err(|_| ExportError::Encode("GLB larger than 4 GiB".into()))?;

    let mut out = Vec::with_capacity(total as usize);
    out.extend_from_slice(&GLB_MAGIC.to_le_bytes());
    out.extend_from_slice(&GLB_VERSION.to_le_bytes());
    out.extend_from_slice(&total.to_le_bytes());
    out.extend_from_slice(&(json_chunk.len() as u32).to_le_bytes());
    out.extend_from_slice(&CHUNK_JSON.to_le_bytes());
    out.extend_from_slice(&json_chunk);
    out.extend_from_slice(&(bin.len() as u32).to_le_bytes());
    out.extend_from_slice(&CHUNK_BIN.to_le_bytes());
    out.extend_from_slice(&bin);
    Ok(out)
}
