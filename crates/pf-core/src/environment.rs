//! Headless runtime check
//!
//! Run once at startup, before any request is accepted. A failure here is
//! fatal: the process has no usable geometry kernel.

use std::time::Instant;

use glam::{DAffine3, DVec3};
use pf_kernel::{GeometryKernel, KernelFactory, Primitive, TessellationParams};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EnvironmentError {
    #[error("EnvironmentFatal: geometry kernel could not be created: {0}")]
    KernelUnavailable(String),
    #[error("EnvironmentFatal: geometry kernel failed its headless probe: {0}")]
    ProbeFailed(String),
}

/// What the startup probe found
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnvironmentReport {
    pub kernel: String,
    /// Whether a display server variable was set (never required)
    pub display_present: bool,
    pub probe_triangles: usize,
    pub probe_ms: u64,
}

fn display_present() -> bool {
    ["DISPLAY", "WAYLAND_DISPLAY"]
        .iter()
        .any(|var| std::env::var_os(var).is_some_and(|v| !v.is_empty()))
}

/// Verify that the kernel initializes and works without a display
///
/// Creates a kernel instance, builds and tessellates a unit cube, and checks
/// that the probe solid is released again.
pub fn check_headless<F: KernelFactory>(factory: &F) -> Result<EnvironmentReport, EnvironmentError> {
    let started = Instant::now();
    let mut kernel = factory
        .create()
        .map_err(|e| EnvironmentError::KernelUnavailable(e.to_string()))?;
    if !kernel.is_available() {
        return Err(EnvironmentError::KernelUnavailable(format!(
            "kernel '{}' reports itself unavailable",
            kernel.name()
        )));
    }

    let probe = kernel
        .construct(
            &Primitive::Box {
                size: DVec3::ONE,
            },
            DAffine3::IDENTITY,
        )
        .map_err(|e| EnvironmentError::ProbeFailed(e.to_string()))?;
    let mesh = kernel.tessellate(
        probe,
        &TessellationParams {
            max_cells: 4,
            ..TessellationParams::default()
        },
    );
    kernel.release(probe);

    let mesh = mesh.map_err(|e| EnvironmentError::ProbeFailed(e.to_string()))?;
    if !mesh.is_watertight() {
        return Err(EnvironmentError::ProbeFailed("probe cube is not watertight".into()));
    }
    if kernel.live_solids() != 0 {
        return Err(EnvironmentError::ProbeFailed(format!(
            "{} solids still live after release",
            kernel.live_solids()
        )));
    }

    let report = EnvironmentReport {
        kernel: kernel.name().to_string(),
        display_present: display_present(),
        probe_triangles: mesh.triangle_count(),
        probe_ms: started.elapsed().as_millis() as u64,
    };
    tracing::info!(
        kernel = %report.kernel,
        display = report.display_present,
        probe_ms = report.probe_ms,
        "headless environment ok"
    );
    Ok(report)
}
