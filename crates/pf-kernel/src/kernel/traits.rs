//! Geometry kernel trait definitions
//!
//! These types define the narrow capability interface every kernel backend
//! implements: construct, transform, combine, feature, tessellate, serialize.

use std::collections::HashMap;
use std::fmt;

use glam::{DAffine3, DQuat, DVec3};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Opaque handle to a solid stored inside a kernel instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SolidHandle(Uuid);

impl SolidHandle {
    /// Allocate a fresh handle
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Underlying identifier
    pub fn id(&self) -> Uuid {
        self.0
    }
}

impl Default for SolidHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SolidHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "solid:{}", self.0)
    }
}

/// Coordinate axis, used by edge selectors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    /// Unit vector along this axis
    pub fn unit(&self) -> DVec3 {
        match self {
            Axis::X => DVec3::X,
            Axis::Y => DVec3::Y,
            Axis::Z => DVec3::Z,
        }
    }

    /// Parse a single axis letter (case-insensitive)
    pub fn from_letter(c: char) -> Option<Self> {
        match c.to_ascii_uppercase() {
            'X' => Some(Axis::X),
            'Y' => Some(Axis::Y),
            'Z' => Some(Axis::Z),
            _ => None,
        }
    }

    pub fn letter(&self) -> char {
        match self {
            Axis::X => 'X',
            Axis::Y => 'Y',
            Axis::Z => 'Z',
        }
    }
}

/// Axis definition for rotations and polar patterns
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Axis3D {
    /// Origin point of the axis
    pub origin: DVec3,
    /// Direction of the axis (normalized)
    pub direction: DVec3,
}

impl Axis3D {
    /// Create an axis from origin and direction
    pub fn new(origin: DVec3, direction: DVec3) -> Self {
        Self {
            origin,
            direction: direction.normalize(),
        }
    }

    /// X axis at origin
    pub fn x() -> Self {
        Self::new(DVec3::ZERO, DVec3::X)
    }

    /// Y axis at origin
    pub fn y() -> Self {
        Self::new(DVec3::ZERO, DVec3::Y)
    }

    /// Z axis at origin
    pub fn z() -> Self {
        Self::new(DVec3::ZERO, DVec3::Z)
    }

    /// Rigid rotation about this axis by `angle` radians
    pub fn rotation(&self, angle: f64) -> DAffine3 {
        DAffine3::from_translation(self.origin)
            * DAffine3::from_quat(DQuat::from_axis_angle(self.direction, angle))
            * DAffine3::from_translation(-self.origin)
    }
}

/// Primitive solids, centered on the origin before placement
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Primitive {
    /// Axis-aligned box with full edge lengths
    Box { size: DVec3 },
    /// Cylinder along local +Z
    Cylinder { radius: f64, height: f64 },
    Sphere { radius: f64 },
}

impl Primitive {
    pub fn type_name(&self) -> &'static str {
        match self {
            Primitive::Box { .. } => "box",
            Primitive::Cylinder { .. } => "cylinder",
            Primitive::Sphere { .. } => "sphere",
        }
    }
}

/// Boolean operation type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BooleanType {
    /// Union (fuse)
    Union,
    /// Subtraction (cut)
    Subtract,
    /// Intersection (common)
    Intersect,
}

impl BooleanType {
    pub fn name(&self) -> &'static str {
        match self {
            BooleanType::Union => "union",
            BooleanType::Subtract => "subtract",
            BooleanType::Intersect => "intersect",
        }
    }
}

/// Selects edges of a solid for fillet/chamfer, CadQuery style
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EdgeSelector {
    /// Every edge
    All,
    /// Linear edges parallel to an axis (`|Z`)
    Parallel(Axis),
    /// Edges whose center is maximal along an axis (`>Z`)
    Max(Axis),
    /// Edges whose center is minimal along an axis (`<Z`)
    Min(Axis),
    /// Union of selections (`>Z or <Z`)
    Any(Vec<EdgeSelector>),
}

impl EdgeSelector {
    /// Parse a selector string such as `all`, `|Z` or `>Z or <Z`
    pub fn parse(input: &str) -> Result<Self, String> {
        let terms: Vec<&str> = input.split(" or ").map(str::trim).collect();
        if terms.len() > 1 {
            let parsed = terms
                .into_iter()
                .map(Self::parse_term)
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(EdgeSelector::Any(parsed));
        }
        Self::parse_term(input.trim())
    }

    fn parse_term(term: &str) -> Result<Self, String> {
        if term.eq_ignore_ascii_case("all") || term == "*" {
            return Ok(EdgeSelector::All);
        }

        let mut chars = term.chars();
        let (Some(prefix), Some(letter), None) = (chars.next(), chars.next(), chars.next()) else {
            return Err(format!("invalid edge selector '{}'", term));
        };
        let axis =
            Axis::from_letter(letter).ok_or_else(|| format!("unknown axis '{}' in '{}'", letter, term))?;

        match prefix {
            '|' => Ok(EdgeSelector::Parallel(axis)),
            '>' => Ok(EdgeSelector::Max(axis)),
            '<' => Ok(EdgeSelector::Min(axis)),
            _ => Err(format!("invalid edge selector '{}'", term)),
        }
    }
}

impl fmt::Display for EdgeSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EdgeSelector::All => write!(f, "all"),
            EdgeSelector::Parallel(axis) => write!(f, "|{}", axis.letter()),
            EdgeSelector::Max(axis) => write!(f, ">{}", axis.letter()),
            EdgeSelector::Min(axis) => write!(f, "<{}", axis.letter()),
            EdgeSelector::Any(terms) => {
                for (i, term) in terms.iter().enumerate() {
                    if i > 0 {
                        write!(f, " or ")?;
                    }
                    write!(f, "{}", term)?;
                }
                Ok(())
            }
        }
    }
}

/// Error type for kernel operations
#[derive(Debug, Clone, PartialEq, Error)]
pub enum KernelError {
    #[error("Degenerate geometry: {0}")]
    Degenerate(String),

    #[error("Non-manifold result: {0}")]
    NonManifold(String),

    #[error("Boolean {0} produced empty geometry")]
    EmptyResult(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Unknown solid handle: {0}")]
    InvalidHandle(SolidHandle),

    #[error("Tessellation failed: {0}")]
    TessellationFailed(String),

    #[error("STEP export failed: {0}")]
    StepExport(String),

    #[error("Kernel not available: {0}")]
    NotAvailable(String),
}

/// Result type for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

/// Tessellation controls
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TessellationParams {
    /// Maximum deviation from the true surface
    pub linear_tolerance: f64,
    /// Maximum angular deviation between adjacent facets, radians.
    /// Only B-rep backends read it; grid-based meshing ignores it.
    pub angular_tolerance: f64,
    /// Upper bound on sampling cells along the longest axis
    pub max_cells: u32,
}

impl Default for TessellationParams {
    fn default() -> Self {
        // Same tolerances the service used for web STL output
        Self {
            linear_tolerance: 0.001,
            angular_tolerance: 0.1,
            max_cells: 48,
        }
    }
}

/// A tessellated mesh output from the kernel
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TessellatedMesh {
    /// Vertex positions (3 floats per vertex)
    pub vertices: Vec<[f32; 3]>,
    /// Vertex normals (3 floats per vertex)
    pub normals: Vec<[f32; 3]>,
    /// Triangle indices (3 indices per triangle)
    pub indices: Vec<u32>,
}

impl TessellatedMesh {
    /// Create an empty tessellated mesh
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if the mesh is empty
    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty() || self.indices.is_empty()
    }

    /// Get the number of triangles
    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Iterate over triangles as vertex position triples
    pub fn triangles(&self) -> impl Iterator<Item = [[f32; 3]; 3]> + '_ {
        self.indices.chunks_exact(3).map(|tri| {
            [
                self.vertices[tri[0] as usize],
                self.vertices[tri[1] as usize],
                self.vertices[tri[2] as usize],
            ]
        })
    }

    /// Whether the surface is closed and consistently oriented
    ///
    /// Every directed edge must be matched by its reverse.
    pub fn is_watertight(&self) -> bool {
        if self.is_empty() {
            return false;
        }

        let mut balance: HashMap<(u32, u32), i32> = HashMap::new();
        for tri in self.indices.chunks_exact(3) {
            for (a, b) in [(tri[0], tri[1]), (tri[1], tri[2]), (tri[2], tri[0])] {
                if a < b {
                    *balance.entry((a, b)).or_insert(0) += 1;
                } else {
                    *balance.entry((b, a)).or_insert(0) -= 1;
                }
            }
        }

        balance.values().all(|count| *count == 0)
    }

    /// Axis-aligned bounds, or `None` for an empty mesh
    pub fn bounds(&self) -> Option<([f32; 3], [f32; 3])> {
        let first = *self.vertices.first()?;
        let mut min = first;
        let mut max = first;
        for v in &self.vertices {
            for i in 0..3 {
                min[i] = min[i].min(v[i]);
                max[i] = max[i].max(v[i]);
            }
        }
        Some((min, max))
    }

    /// Append another mesh, re-basing its indices
    pub fn append(&mut self, other: &TessellatedMesh) {
        let base = self.vertices.len() as u32;
        self.vertices.extend_from_slice(&other.vertices);
        self.normals.extend_from_slice(&other.normals);
        self.indices.extend(other.indices.iter().map(|i| i + base));
    }
}

/// Options for STEP file export
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepExportOptions {
    /// Product name written to the STEP data section
    pub product_name: String,
    /// Author name in STEP header
    pub author: Option<String>,
    /// Organization name in STEP header
    pub organization: Option<String>,
}

impl Default for StepExportOptions {
    fn default() -> Self {
        Self {
            product_name: "part".into(),
            author: None,
            organization: None,
        }
    }
}

/// The geometry kernel capability interface
///
/// A kernel instance is owned by exactly one build at a time, so every
/// mutating operation takes `&mut self`. Implementations only need to be
/// `Send` so a fresh instance can be moved onto a worker thread.
pub trait GeometryKernel: Send {
    /// Get the name of this kernel
    fn name(&self) -> &str;

    /// Check if the kernel is available (initialized without a display)
    fn is_available(&self) -> bool;

    /// Create a primitive and place it with `placement`
    fn construct(&mut self, primitive: &Primitive, placement: DAffine3) -> KernelResult<SolidHandle>;

    /// Apply an affine transform, producing a new solid
    fn transform(&mut self, solid: SolidHandle, transform: DAffine3) -> KernelResult<SolidHandle>;

    /// Perform a boolean operation on two solids
    fn combine(&mut self, a: SolidHandle, b: SolidHandle, op: BooleanType) -> KernelResult<SolidHandle>;

    /// Apply fillet (rounded edge) to the selected edges
    fn fillet(&mut self, solid: SolidHandle, edges: &EdgeSelector, radius: f64) -> KernelResult<SolidHandle>;

    /// Apply chamfer (beveled edge) to the selected edges
    fn chamfer(&mut self, solid: SolidHandle, edges: &EdgeSelector, distance: f64) -> KernelResult<SolidHandle>;

    /// Tessellate a solid into triangles
    fn tessellate(&self, solid: SolidHandle, params: &TessellationParams) -> KernelResult<TessellatedMesh>;

    /// Serialize one or more solids as a STEP document
    fn serialize_step(
        &self,
        solids: &[SolidHandle],
        options: &StepExportOptions,
        params: &TessellationParams,
    ) -> KernelResult<Vec<u8>>;

    /// Free a solid; unknown handles are ignored
    fn release(&mut self, solid: SolidHandle);

    /// Number of solids currently held by this instance
    fn live_solids(&self) -> usize;
}

/// Creates one kernel instance per build
pub trait KernelFactory: Send + Sync {
    type Kernel: GeometryKernel;

    fn create(&self) -> KernelResult<Self::Kernel>;
}

impl<K, F> KernelFactory for F
where
    K: GeometryKernel,
    F: Fn() -> KernelResult<K> + Send + Sync,
{
    type Kernel = K;

    fn create(&self) -> KernelResult<K> {
        self()
    }
}

/// A null kernel that always returns errors (used when no kernel is available)
#[derive(Debug, Default)]
pub struct NullKernel;

impl NullKernel {
    fn unavailable<T>() -> KernelResult<T> {
        Err(KernelError::NotAvailable("No geometry kernel available".into()))
    }
}

impl GeometryKernel for NullKernel {
    fn name(&self) -> &str {
        "null"
    }

    fn is_available(&self) -> bool {
        false
    }

    fn construct(&mut self, _primitive: &Primitive, _placement: DAffine3) -> KernelResult<SolidHandle> {
        Self::unavailable()
    }

    fn transform(&mut self, _solid: SolidHandle, _transform: DAffine3) -> KernelResult<SolidHandle> {
        Self::unavailable()
    }

    fn combine(&mut self, _a: SolidHandle, _b: SolidHandle, _op: BooleanType) -> KernelResult<SolidHandle> {
        Self::unavailable()
    }

    fn fillet(&mut self, _solid: SolidHandle, _edges: &EdgeSelector, _radius: f64) -> KernelResult<SolidHandle> {
        Self::unavailable()
    }

    fn chamfer(&mut self, _solid: SolidHandle, _edges: &EdgeSelector, _distance: f64) -> KernelResult<SolidHandle> {
        Self::unavailable()
    }

    fn tessellate(&self, _solid: SolidHandle, _params: &TessellationParams) -> KernelResult<TessellatedMesh> {
        Self::unavailable()
    }

    fn serialize_step(
        &self,
        _solids: &[SolidHandle],
        _options: &StepExportOptions,
        _params: &TessellationParams,
    ) -> KernelResult<Vec<u8>> {
        Err(KernelError::NotAvailable(
            "No geometry kernel available for STEP export".into(),
        ))
    }

    fn release(&mut self, _solid: SolidHandle) {}

    fn live_solids(&self) -> usize {
        0
    }
}
