//! Instrumented stand-in kernel
//!
//! Solids are plain bounding boxes. Every call is counted and live handles
//! are tracked through a shared [`FakeStats`], so a test can still inspect
//! them after the kernel has been moved into (and dropped by) a build.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use glam::{DAffine3, DVec3};

use super::step::write_faceted_step;
use super::{
    BooleanType, EdgeSelector, GeometryKernel, KernelError, KernelResult, Primitive, SolidHandle,
    StepExportOptions, TessellatedMesh, TessellationParams,
};

/// Kernel operation kinds, used to target injected failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeOp {
    Construct,
    Transform,
    Combine,
    Fillet,
    Chamfer,
    Tessellate,
    SerializeStep,
}

/// Counters shared between a [`FakeKernel`] and the test that created it
#[derive(Debug, Default)]
pub struct FakeStats {
    calls: AtomicUsize,
    live: AtomicUsize,
    created: AtomicUsize,
}

impl FakeStats {
    /// Total kernel calls made so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Solids created and not yet released
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Solids ever created
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy)]
struct FakeSolid {
    min: DVec3,
    max: DVec3,
}

impl FakeSolid {
    fn is_empty(&self) -> bool {
        self.min.cmpge(self.max).any()
    }
}

/// Bounding-box kernel with injectable latency and failures
#[derive(Debug, Default)]
pub struct FakeKernel {
    solids: HashMap<SolidHandle, FakeSolid>,
    stats: Arc<FakeStats>,
    delay: Duration,
    failures: HashMap<FakeOp, KernelError>,
    open_shell: bool,
}

impl FakeKernel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Share counters with an existing stats block
    pub fn with_stats(mut self, stats: Arc<FakeStats>) -> Self {
        self.stats = stats;
        self
    }

    /// Sleep this long inside every call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Make every call of `op` fail with `error`
    pub fn failing(mut self, op: FakeOp, error: KernelError) -> Self {
        self.failures.insert(op, error);
        self
    }

    /// Tessellate with one triangle missing
    pub fn with_open_shells(mut self) -> Self {
        self.open_shell = true;
        self
    }

    pub fn stats(&self) -> Arc<FakeStats> {
        self.stats.clone()
    }

    fn enter(&self, op: FakeOp) -> KernelResult<()> {
        self.stats.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        match self.failures.get(&op) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn get(&self, handle: SolidHandle) -> KernelResult<FakeSolid> {
        self.solids
            .get(&handle)
            .copied()
            .ok_or(KernelError::InvalidHandle(handle))
    }

    fn store(&mut self, solid: FakeSolid) -> SolidHandle {
        let handle = SolidHandle::new();
        self.solids.insert(handle, solid);
        self.stats.live.fetch_add(1, Ordering::SeqCst);
        self.stats.created.fetch_add(1, Ordering::SeqCst);
        handle
    }

    fn box_mesh(&self, solid: &FakeSolid) -> TessellatedMesh {
        let (lo, hi) = (solid.min.as_vec3(), solid.max.as_vec3());
        let vertices: Vec<[f32; 3]> = (0..8)
            .map(|i| {
                [
                    if i & 1 == 0 { lo.x } else { hi.x },
                    if i & 2 == 0 { lo.y } else { hi.y },
                    if i & 4 == 0 { lo.z } else { hi.z },
                ]
            })
            .collect();
        let center = (lo + hi) * 0.5;
        let normals = vertices
            .iter()
            .map(|v| (glam::Vec3::from_array(*v) - center).normalize_or_zero().to_array())
            .collect();
        let mut indices = vec![
            0, 2, 3, 0, 3, 1, // -Z
            4, 5, 7, 4, 7, 6, // +Z
            0, 1, 5, 0, 5, 4, // -Y
            2, 6, 7, 2, 7, 3, // +Y
            0, 4, 6, 0, 6, 2, // -X
            1, 3, 7, 1, 7, 5, // +X
        ];
        if self.open_shell {
            indices.truncate(indices.len() - 3);
        }
        TessellatedMesh {
            vertices,
            normals,
            indices,
        }
    }
}

fn transformed(solid: &FakeSolid, transform: &DAffine3) -> FakeSolid {
    let mut min = DVec3::splat(f64::INFINITY);
    let mut max = DVec3::splat(f64::NEG_INFINITY);
    for i in 0..8 {
        let corner = DVec3::new(
            if i & 1 == 0 { solid.min.x } else { solid.max.x },
            if i & 2 == 0 { solid.min.y } else { solid.max.y },
            if i & 4 == 0 { solid.min.z } else { solid.max.z },
        );
        let p = transform.transform_point3(corner);
        min = min.min(p);
        max = max.max(p);
    }
    FakeSolid { min, max }
}

impl GeometryKernel for FakeKernel {
    fn name(&self) -> &str {
        "fake"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn construct(&mut self, primitive: &Primitive, placement: DAffine3) -> KernelResult<SolidHandle> {
        self.enter(FakeOp::Construct)?;
        let half = match *primitive {
            Primitive::Box { size } => size * 0.5,
            Primitive::Cylinder { radius, height } => DVec3::new(radius, radius, height * 0.5),
            Primitive::Sphere { radius } => DVec3::splat(radius),
        };
        let local = FakeSolid {
            min: -half,
            max: half,
        };
        if local.is_empty() {
            return Err(KernelError::Degenerate(format!(
                "{} has no volume",
                primitive.type_name()
            )));
        }
        Ok(self.store(transformed(&local, &placement)))
    }

    fn transform(&mut self, solid: SolidHandle, transform: DAffine3) -> KernelResult<SolidHandle> {
        self.enter(FakeOp::Transform)?;
        let solid = self.get(solid)?;
        Ok(self.store(transformed(&solid, &transform)))
    }

    fn combine(&mut self, a: SolidHandle, b: SolidHandle, op: BooleanType) -> KernelResult<SolidHandle> {
        self.enter(FakeOp::Combine)?;
        let (a, b) = (self.get(a)?, self.get(b)?);
        let result = match op {
            BooleanType::Union => FakeSolid {
                min: a.min.min(b.min),
                max: a.max.max(b.max),
            },
            BooleanType::Intersect => FakeSolid {
                min: a.min.max(b.min),
                max: a.max.min(b.max),
            },
            BooleanType::Subtract => {
                let covered = b.min.cmple(a.min).all() && b.max.cmpge(a.max).all();
                if covered {
                    return Err(KernelError::EmptyResult(op.name().into()));
                }
                a
            }
        };
        if result.is_empty() {
            return Err(KernelError::EmptyResult(op.name().into()));
        }
        Ok(self.store(result))
    }

    fn fillet(&mut self, solid: SolidHandle, _edges: &EdgeSelector, radius: f64) -> KernelResult<SolidHandle> {
        self.enter(FakeOp::Fillet)?;
        let solid = self.get(solid)?;
        if radius * 2.0 >= (solid.max - solid.min).min_element() {
            return Err(KernelError::Degenerate(format!("fillet radius {} too large", radius)));
        }
        Ok(self.store(solid))
    }

    fn chamfer(&mut self, solid: SolidHandle, _edges: &EdgeSelector, distance: f64) -> KernelResult<SolidHandle> {
        self.enter(FakeOp::Chamfer)?;
        let solid = self.get(solid)?;
        if distance * 2.0 >= (solid.max - solid.min).min_element() {
            return Err(KernelError::Degenerate(format!("chamfer distance {} too large", distance)));
        }
        Ok(self.store(solid))
    }

    fn tessellate(&self, solid: SolidHandle, _params: &TessellationParams) -> KernelResult<TessellatedMesh> {
        self.enter(FakeOp::Tessellate)?;
        let solid = self.get(solid)?;
        Ok(self.box_mesh(&solid))
    }

    fn serialize_step(
        &self,
        solids: &[SolidHandle],
        options: &StepExportOptions,
        _params: &TessellationParams,
    ) -> KernelResult<Vec<u8>> {
        self.enter(FakeOp::SerializeStep)?;
        let meshes = solids
            .iter()
            .map(|&h| self.get(h).map(|s| self.box_mesh(&s)))
            .collect::<KernelResult<Vec<_>>>()?;
        write_faceted_step(&meshes, options)
    }

    fn release(&mut self, solid: SolidHandle) {
        if self.solids.remove(&solid).is_some() {
            self.stats.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn live_solids(&self) -> usize {
        self.solids.len()
    }
}
