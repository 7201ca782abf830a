//! Canvas Relay Render - Texture-Quad Compositor
//!
//! Turns any pixel source into one textured full-surface quad per frame.
//! The pipeline contract (two vertex attributes, two uniforms, one texture
//! unit, triangle list) is implemented twice: on the GPU through wgpu, and
//! on the CPU for headless hosts and tests.

mod backend;
mod compositor;
mod gpu;
mod gpu_backend;
mod software;

pub use backend::{CompositorBackend, CompositorError, QuadGeometry, Uniforms};
pub use compositor::{Compositor, CompositorStats, TexturePolicy};
pub use gpu::{GpuConfig, GpuContext, GpuError};
pub use gpu_backend::{GpuTexture, WgpuBackend};
pub use software::{SoftwareBackend, SoftwareTexture};
