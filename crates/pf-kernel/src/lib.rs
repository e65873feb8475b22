//! Geometry kernel capability interface
//!
//! This crate provides:
//! - The `GeometryKernel` trait every backend implements
//! - An implicit (signed-distance) reference backend that needs no display
//! - A faceted STEP AP203 writer
//! - An instrumented fake kernel for pipeline tests

pub mod kernel;

// Re-exports for convenience
pub use kernel::{
    Axis, Axis3D, BooleanType, EdgeSelector, GeometryKernel, ImplicitKernel, KernelError,
    KernelFactory, KernelResult, NullKernel, Primitive, SolidHandle, StepExportOptions,
    TessellatedMesh, TessellationParams, default_kernel,
};
