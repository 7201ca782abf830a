//! The programmed-pipeline contract the compositor drives.

use bytemuck::{Pod, Zeroable};
use cr_surface::{PixelSource, Raster};
use glam::Vec2;
use thiserror::Error;

/// Compositor errors
#[derive(Debug, Error)]
pub enum CompositorError {
    #[error("Pipeline has not been set up")]
    NotSetUp,

    #[error("GPU resources exhausted: {0}")]
    ResourceExhaustion(String),

    #[error("Pixel source is {actual:?}, texture is {expected:?}")]
    SourceMismatch {
        expected: (u32, u32),
        actual: (u32, u32),
    },

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Readback failed: {0}")]
    Readback(String),
}

/// Texture coordinates for the two triangles, matching [`QuadGeometry::rect`].
pub const QUAD_TEXCOORDS: [[f32; 2]; 6] = [
    [0.0, 0.0],
    [1.0, 0.0],
    [0.0, 1.0],
    [0.0, 1.0],
    [1.0, 0.0],
    [1.0, 1.0],
];

/// Two triangles covering a rectangle, in pixel space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuadGeometry {
    pub positions: [Vec2; 6],
    pub texcoords: [Vec2; 6],
}

impl QuadGeometry {
    pub const VERTEX_COUNT: u32 = 6;

    pub fn rect(x: f32, y: f32, width: f32, height: f32) -> Self {
        let (x1, y1) = (x, y);
        let (x2, y2) = (x + width, y + height);
        Self {
            positions: [
                Vec2::new(x1, y1),
                Vec2::new(x2, y1),
                Vec2::new(x1, y2),
                Vec2::new(x1, y2),
                Vec2::new(x2, y1),
                Vec2::new(x2, y2),
            ],
            texcoords: QUAD_TEXCOORDS.map(Vec2::from_array),
        }
    }

    pub fn position_data(&self) -> [[f32; 2]; 6] {
        self.positions.map(|p| p.to_array())
    }

    pub fn texcoord_data(&self) -> [[f32; 2]; 6] {
        self.texcoords.map(|t| t.to_array())
    }
}

/// Per-draw uniforms.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct Uniforms {
    /// Output surface size in pixels
    pub resolution: [f32; 2],
    /// Nominal source image size in pixels
    pub texture_size: [f32; 2],
}

/// A pipeline with position/texcoord attributes, resolution/texture-size
/// uniforms, one texture unit and triangle-list draws.
///
/// Textures are nearest-filtered and edge-clamped with no mipmaps.
pub trait CompositorBackend {
    type Texture;

    fn name(&self) -> &'static str;

    /// Size of the visible surface this backend draws into.
    fn output_size(&self) -> (u32, u32);

    /// One-time setup: pipeline, vertex buffers, viewport.
    fn setup(&mut self, quad: &QuadGeometry) -> Result<(), CompositorError>;

    fn create_texture(&mut self, width: u32, height: u32) -> Result<Self::Texture, CompositorError>;

    /// Upload RGBA8 pixels; the source must match the texture size.
    fn upload(&mut self, texture: &Self::Texture, source: &dyn PixelSource) -> Result<(), CompositorError>;

    /// Clear the visible surface, then draw `vertex_count` vertices.
    fn draw(&mut self, texture: &Self::Texture, uniforms: &Uniforms, vertex_count: u32) -> Result<(), CompositorError>;

    fn release_texture(&mut self, texture: Self::Texture);

    /// Read back the visible surface.
    fn read_pixels(&mut self) -> Result<Raster, CompositorError>;
}
