//! Headless export stage
//!
//! Serializes the terminal solids of a [`FinishedBuild`] to an interchange
//! format. STEP goes straight through the kernel's B-rep writer; the mesh
//! formats tessellate through the kernel and encode here. Payloads carry no
//! timestamps or random ids, so identical builds export identical bytes.

mod gltf;
mod obj;
mod stl;

use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use pf_kernel::{GeometryKernel, StepExportOptions, TessellatedMesh, TessellationParams};
use serde::{Deserialize, Serialize};

use crate::engine::FinishedBuild;
use crate::request::ArtifactKey;

pub use gltf::encode_glb;
pub use obj::encode_obj;
pub use stl::encode_stl;

/// Supported interchange formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Step,
    Stl,
    /// Binary glTF 2.0 (GLB)
    Gltf,
    Obj,
}

impl ExportFormat {
    pub const ALL: [ExportFormat; 4] = [
        ExportFormat::Step,
        ExportFormat::Stl,
        ExportFormat::Gltf,
        ExportFormat::Obj,
    ];

    pub fn mime_type(&self) -> &'static str {
        match self {
            ExportFormat::Step => "application/step",
            ExportFormat::Stl => "model/stl",
            ExportFormat::Gltf => "model/gltf-binary",
            ExportFormat::Obj => "model/obj",
        }
    }

    /// File extension without the leading dot
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Step => "step",
            ExportFormat::Stl => "stl",
            ExportFormat::Gltf => "glb",
            ExportFormat::Obj => "obj",
        }
    }

    /// Whether the format needs a closed, consistently oriented surface
    pub fn requires_watertight(&self) -> bool {
        matches!(self, ExportFormat::Step | ExportFormat::Stl)
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExportFormat::Step => "step",
            ExportFormat::Stl => "stl",
            ExportFormat::Gltf => "gltf",
            ExportFormat::Obj => "obj",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for ExportFormat {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "step" | "stp" => Ok(ExportFormat::Step),
            "stl" => Ok(ExportFormat::Stl),
            "gltf" | "glb" => Ok(ExportFormat::Gltf),
            "obj" => Ok(ExportFormat::Obj),
            other => Err(ExportError::UnknownFormat(other.to_string())),
        }
    }
}

/// Tessellation and STEP header settings applied to every export
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExportOptions {
    pub tessellation: TessellationParams,
    pub step: StepExportOptions,
}

/// An immutable exported payload
#[derive(Debug, Clone, PartialEq)]
pub struct ExportArtifact {
    pub key: ArtifactKey,
    pub format: ExportFormat,
    bytes: Vec<u8>,
}

impl ExportArtifact {
    pub fn new(key: ArtifactKey, bytes: Vec<u8>) -> Self {
        Self {
            format: key.format,
            key,
            bytes,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Suggested file name: `<stem>.<ext>`
    pub fn file_name(&self, stem: &str) -> String {
        format!("{}.{}", stem, self.format.extension())
    }
}

/// Export-related errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExportError {
    #[error("Unknown export format: {0}")]
    UnknownFormat(String),
    #[error("Tessellation of output '{0}' is empty")]
    EmptyMesh(String),
    #[error("Tessellation of output '{0}' is not a closed manifold")]
    NotWatertight(String),
    #[error("Kernel failed during export: {0}")]
    Kernel(String),
    #[error("Encoding failed: {0}")]
    Encode(String),
}

/// Serializes finished builds
#[derive(Debug, Clone, Default)]
pub struct Exporter {
    options: ExportOptions,
}

impl Exporter {
    pub fn new(options: ExportOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ExportOptions {
        &self.options
    }

    /// Cache key of `format` for a build with this fingerprint
    pub fn key_for(&self, build_fingerprint: &crate::request::Fingerprint, format: ExportFormat) -> ArtifactKey {
        ArtifactKey::new(build_fingerprint, format, &self.options)
    }

    /// Export every output of `build` into one artifact
    pub fn export<K: GeometryKernel>(
        &self,
        build: &FinishedBuild<K>,
        format: ExportFormat,
    ) -> Result<ExportArtifact, ExportError> {
        let started = Instant::now();
        let key = self.key_for(build.fingerprint(), format);

        let bytes = match format {
            ExportFormat::Step => {
                for output in build.outputs() {
                    let mesh = self.tessellate(build, &output.name, output.handle, &self.options.tessellation)?;
                    check_closed(&output.name, &mesh)?;
                }
                build
                    .kernel()
                    .serialize_step(&build.handles(), &self.options.step, &self.options.tessellation)
                    .map_err(|e| ExportError::Kernel(e.to_string()))?
            }
            ExportFormat::Stl | ExportFormat::Gltf | ExportFormat::Obj => {
                let mut merged = TessellatedMesh::new();
                for output in build.outputs() {
                    let mesh = self.tessellate(build, &output.name, output.handle, &self.options.tessellation)?;
                    if format.requires_watertight() {
                        check_closed(&output.name, &mesh)?;
                    }
                    merged.append(&mesh);
                }
                match format {
                    ExportFormat::Stl => encode_stl(&merged)?,
                    ExportFormat::Gltf => encode_glb(&merged)?,
                    _ => encode_obj(&merged),
                }
            }
        };

        tracing::info!(
            format = %format,
            bytes = bytes.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            fingerprint = %build.fingerprint(),
            "exported artifact"
        );
        Ok(ExportArtifact::new(key, bytes))
    }

    fn tessellate<K: GeometryKernel>(
        &self,
        build: &FinishedBuild<K>,
        name: &str,
        handle: pf_kernel::SolidHandle,
        params: &TessellationParams,
    ) -> Result<TessellatedMesh, ExportError> {
        let mesh = build
            .kernel()
            .tessellate(handle, params)
            .map_err(|e| ExportError::Kernel(e.to_string()))?;
        if mesh.is_empty() {
            return Err(ExportError::EmptyMesh(name.to_string()));
        }
        Ok(mesh)
    }
}

fn check_closed(name: &str, mesh: &TessellatedMesh) -> Result<(), ExportError> {
    if !mesh.is_watertight() {
        return Err(ExportError::NotWatertight(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{CancelToken, Engine, EngineConfig};
    use crate::graph::BuildGraph;
    use crate::request::parse_value;
    use pf_kernel::kernel::fake::FakeKernel;
    use pf_kernel::ImplicitKernel;
    use serde_json::json;

    fn build<K: GeometryKernel>(kernel: K, request: serde_json::Value) -> FinishedBuild<K> {
        let spec = parse_value(&request).unwrap();
        let graph = BuildGraph::from_spec(&spec).unwrap();
        Engine::new(EngineConfig::default())
            .evaluate(kernel, &spec, &graph, &CancelToken::new())
            .unwrap()
    }

    fn cube() -> serde_json::Value {
        json!({"operations": [{"id": "body", "op": "box", "size": [10, 10, 10]}]})
    }

    fn coarse() -> Exporter {
        Exporter::new(ExportOptions {
            tessellation: TessellationParams {
                max_cells: 12,
                ..TessellationParams::default()
            },
            ..ExportOptions::default()
        })
    }

    #[test]
    fn test_format_names() {
        assert_eq!("STEP".parse::<ExportFormat>().unwrap(), ExportFormat::Step);
        assert_eq!("glb".parse::<ExportFormat>().unwrap(), ExportFormat::Gltf);
        assert!("dxf".parse::<ExportFormat>().is_err());
        for format in ExportFormat::ALL {
            assert_eq!(format.to_string().parse::<ExportFormat>().unwrap(), format);
            assert!(!format.mime_type().is_empty());
        }
        assert_eq!(ExportFormat::Gltf.extension(), "glb");
    }

    #[test]
    fn test_filleted_cube_to_step() {
        let finished = build(
            ImplicitKernel::new(),
            json!({"operations": [
                {"id": "body", "op": "box", "size": [10, 10, 10]},
                {"id": "round", "op": "fillet", "input": "body", "edges": "all", "radius": 1}
            ]}),
        );
        let artifact = coarse().export(&finished, ExportFormat::Step).unwrap();
        assert_eq!(artifact.format, ExportFormat::Step);
        assert!(!artifact.is_empty());
        assert!(artifact.bytes().starts_with(b"ISO-10303-21;"));
        assert_eq!(artifact.file_name("part"), "part.step");
    }

    #[test]
    fn test_exports_are_deterministic() {
        for format in ExportFormat::ALL {
            let a = coarse().export(&build(ImplicitKernel::new(), cube()), format).unwrap();
            let b = coarse().export(&build(ImplicitKernel::new(), cube()), format).unwrap();
            assert_eq!(a, b, "{} export differs between runs", format);
        }
    }

    #[test]
    fn test_open_shell_rejected_for_closed_formats() {
        let finished = build(FakeKernel::new().with_open_shells(), cube());
        let exporter = Exporter::default();

        assert!(matches!(
            exporter.export(&finished, ExportFormat::Stl),
            Err(ExportError::NotWatertight(_))
        ));
        assert!(matches!(
            exporter.export(&finished, ExportFormat::Step),
            Err(ExportError::NotWatertight(_))
        ));
        // Mesh viewers accept open surfaces
        assert!(exporter.export(&finished, ExportFormat::Obj).is_ok());
        assert!(exporter.export(&finished, ExportFormat::Gltf).is_ok());
    }

    #[test]
    fn test_multiple_outputs_are_merged() {
        let finished = build(
            FakeKernel::new(),
            json!({
                "operations": [
                    {"id": "a", "op": "box", "size": [1, 1, 1]},
                    {"id": "b", "op": "box", "size": [1, 1, 1], "center": [5, 0, 0]}
                ],
                "outputs": ["a", "b"]
            }),
        );
        let artifact = Exporter::default().export(&finished, ExportFormat::Stl).unwrap();
        // 80 byte header, count, 50 bytes per triangle
        assert_eq!(artifact.len(), 84 + 24 * 50);
    }
}
