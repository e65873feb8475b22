//! Geometry kernel abstraction and backends

pub mod fake;
pub mod implicit;
mod step;
mod traits;

pub use implicit::ImplicitKernel;
pub use step::write_faceted_step;
pub use traits::*;

/// Create the default kernel backend for this build
pub fn default_kernel() -> KernelResult<ImplicitKernel> {
    let kernel = ImplicitKernel::new();
    tracing::debug!(kernel = kernel.name(), "created geometry kernel");
    Ok(kernel)
}
