//! Implicit (signed-distance) reference kernel
//!
//! Pure Rust backend used when no native B-rep kernel is linked. Solids are
//! signed-distance trees; tessellation extracts a closed surface and STEP
//! output is a faceted B-rep of that surface.

mod mesher;
mod shape;

use std::collections::HashMap;
use std::sync::Arc;

use glam::DAffine3;

use self::shape::{BlendKind, MAX_TREE_DEPTH, Shape};
use super::step::write_faceted_step;
use super::{
    BooleanType, EdgeSelector, GeometryKernel, KernelError, KernelResult, Primitive, SolidHandle,
    StepExportOptions, TessellatedMesh, TessellationParams,
};

/// Signed-distance kernel
#[derive(Debug, Default)]
pub struct ImplicitKernel {
    solids: HashMap<SolidHandle, Arc<Shape>>,
}

impl ImplicitKernel {
    /// Create a new, empty kernel instance
    pub fn new() -> Self {
        Self::default()
    }

    fn store(&mut self, shape: Shape) -> SolidHandle {
        let handle = SolidHandle::new();
        self.solids.insert(handle, Arc::new(shape));
        handle
    }

    fn get(&self, handle: SolidHandle) -> KernelResult<Arc<Shape>> {
        self.solids
            .get(&handle)
            .cloned()
            .ok_or(KernelError::InvalidHandle(handle))
    }

    fn blend(
        &mut self,
        solid: SolidHandle,
        kind: BlendKind,
        amount: f64,
        edges: &EdgeSelector,
    ) -> KernelResult<SolidHandle> {
        if !amount.is_finite() || amount <= 0.0 {
            return Err(KernelError::Degenerate(format!(
                "edge blend size must be positive, got {}",
                amount
            )));
        }
        let shape = self.get(solid)?.with_blend(kind, amount, edges)?;
        Ok(self.store(shape))
    }
}

impl GeometryKernel for ImplicitKernel {
    fn name(&self) -> &str {
        "implicit"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn construct(&mut self, primitive: &Primitive, placement: DAffine3) -> KernelResult<SolidHandle> {
        let shape = Shape::primitive(*primitive, placement)?;
        Ok(self.store(shape))
    }

    fn transform(&mut self, solid: SolidHandle, transform: DAffine3) -> KernelResult<SolidHandle> {
        let shape = self.get(solid)?.transformed(&transform)?;
        Ok(self.store(shape))
    }

    fn combine(&mut self, a: SolidHandle, b: SolidHandle, op: BooleanType) -> KernelResult<SolidHandle> {
        let shape = Shape::boolean(op, self.get(a)?, self.get(b)?);
        if shape.depth() > MAX_TREE_DEPTH {
            return Err(KernelError::Unsupported(format!(
                "{} would nest {} booleans, the implicit kernel allows {}",
                op.name(),
                shape.depth(),
                MAX_TREE_DEPTH
            )));
        }
        if shape.is_empty() {
            return Err(KernelError::EmptyResult(op.name().into()));
        }
        Ok(self.store(shape))
    }

    fn fillet(&mut self, solid: SolidHandle, edges: &EdgeSelector, radius: f64) -> KernelResult<SolidHandle> {
        self.blend(solid, BlendKind::Round, radius, edges)
    }

    fn chamfer(&mut self, solid: SolidHandle, edges: &EdgeSelector, distance: f64) -> KernelResult<SolidHandle> {
        self.blend(solid, BlendKind::Bevel, distance, edges)
    }

    fn tessellate(&self, solid: SolidHandle, params: &TessellationParams) -> KernelResult<TessellatedMesh> {
        let shape = self.get(solid)?;
        mesher::tessellate(&shape, params)
    }

    fn serialize_step(
        &self,
        solids: &[SolidHandle],
        options: &StepExportOptions,
        params: &TessellationParams,
    ) -> KernelResult<Vec<u8>> {
        let meshes = solids
            .iter()
            .map(|&solid| self.tessellate(solid, params))
            .collect::<KernelResult<Vec<_>>>()?;
        write_faceted_step(&meshes, options)
    }

    fn release(&mut self, solid: SolidHandle) {
        self.solids.remove(&solid);
    }

    fn live_solids(&self) -> usize {
        self.solids.len()
    }
}
