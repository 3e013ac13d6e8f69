//! Execution engines for the RK4 kernel
//!
//! - `vectorized`: ndarray on the host, always available
//! - `native`: Fortran routine compiled on first use and loaded through the C ABI
//! - `gpu`: WGSL f64 compute shader through wgpu (cargo feature `gpu`)

pub mod gpu;
pub mod native;
pub mod vectorized;

pub use gpu::GpuBackend;
pub use native::{NativeBackend, NativeOptions};
pub use vectorized::{DerivativePath, VectorizedBackend};
