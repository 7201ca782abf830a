//! Compositor driver.
//!
//! Owns the persistent pipeline state set up once at construction and
//! performs the per-frame texture upload and quad draw.

use crate::backend::{CompositorBackend, CompositorError, QuadGeometry, Uniforms};
use cr_surface::{PixelSource, Raster};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

/// How textures are handled across frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TexturePolicy {
    /// Create and destroy a texture on every draw
    PerFrame,
    /// Keep one texture, exclusively owned by the compositor, and reuse it
    /// while the source size is unchanged
    #[default]
    Pooled,
}

/// Texture and frame counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompositorStats {
    pub frames: u64,
    pub textures_created: u64,
    pub textures_released: u64,
}

struct PooledTexture<T> {
    texture: T,
    size: (u32, u32),
}

/// Draws a pixel source as a single textured quad.
pub struct Compositor<B: CompositorBackend> {
    backend: B,
    policy: TexturePolicy,
    /// Nominal source size, fed to the `texture_size` uniform
    source_size: (u32, u32),
    pooled: Option<PooledTexture<B::Texture>>,
    stats: CompositorStats,
}

impl<B: CompositorBackend> Compositor<B> {
    /// Set up the pipeline for sources of `source_size`.
    ///
    /// The quad covers `(0, 0)` to `source_size` in output pixels.
    pub fn new(mut backend: B, source_size: (u32, u32), policy: TexturePolicy) -> Result<Self, CompositorError> {
        let quad = QuadGeometry::rect(0.0, 0.0, source_size.0 as f32, source_size.1 as f32);
        backend.setup(&quad)?;
        let (w, h) = backend.output_size();
        info!(
            "Compositor ready: {} backend, {}x{} output, {}x{} source, {:?} textures",
            backend.name(),
            w,
            h,
            source_size.0,
            source_size.1,
            policy
        );
        Ok(Self {
            backend,
            policy,
            source_size,
            pooled: None,
            stats: CompositorStats::default(),
        })
    }

    pub fn policy(&self) -> TexturePolicy {
        self.policy
    }

    pub fn stats(&self) -> CompositorStats {
        self.stats
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Upload `source` and draw it over the whole visible surface.
    pub fn draw(&mut self, source: &dyn PixelSource) -> Result<(), CompositorError> {
        let size = source.dimensions();
        let texture = self.acquire(size)?;

        let result = self.upload_and_draw(&texture, source);

        match self.policy {
            TexturePolicy::PerFrame => self.release(texture),
            TexturePolicy::Pooled => self.pooled = Some(PooledTexture { texture, size }),
        }
        result?;

        self.stats.frames += 1;
        trace!("Composited frame {}", self.stats.frames);
        Ok(())
    }

    /// Read back the visible surface.
    pub fn read_pixels(&mut self) -> Result<Raster, CompositorError> {
        self.backend.read_pixels()
    }

    fn upload_and_draw(&mut self, texture: &B::Texture, source: &dyn PixelSource) -> Result<(), CompositorError> {
        self.backend.upload(texture, source)?;
        let (out_w, out_h) = self.backend.output_size();
        let uniforms = Uniforms {
            resolution: [out_w as f32, out_h as f32],
            texture_size: [self.source_size.0 as f32, self.source_size.1 as f32],
        };
        self.backend.draw(texture, &uniforms, QuadGeometry::VERTEX_COUNT)
    }

    fn acquire(&mut self, size: (u32, u32)) -> Result<B::Texture, CompositorError> {
        if let Some(pooled) = self.pooled.take() {
            if pooled.size == size {
                return Ok(pooled.texture);
            }
            debug!("Source resized to {}x{}, replacing pooled texture", size.0, size.1);
            self.release(pooled.texture);
        }
        let texture = self.backend.create_texture(size.0, size.1)?;
        self.stats.textures_created += 1;
        Ok(texture)
    }

    fn release(&mut self, texture: B::Texture) {
        self.backend.release_texture(texture);
        self.stats.textures_released += 1;
    }
}

impl<B: CompositorBackend> Drop for Compositor<B> {
    fn drop(&mut self) {
        if let Some(pooled) = self.pooled.take() {
            self.backend.release_texture(pooled.texture);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::software::SoftwareBackend;
    use cr_surface::Color;

    fn scene(x: f64) -> Raster {
        let mut raster = Raster::new(400, 400);
        raster.fill_rect(x, 150.0, 100.0, 100.0, Color::GREEN);
        raster
    }

    #[test]
    fn test_draw_is_idempotent() {
        let mut compositor =
            Compositor::new(SoftwareBackend::new(400, 400), (400, 400), TexturePolicy::Pooled).unwrap();
        let source = scene(0.0);

        compositor.draw(&source).unwrap();
        let first = compositor.read_pixels().unwrap();
        compositor.draw(&source).unwrap();
        let second = compositor.read_pixels().unwrap();

        assert_eq!(first, second);
        assert_eq!(first, source);
    }

    #[test]
    fn test_no_state_carries_between_frames() {
        let mut compositor =
            Compositor::new(SoftwareBackend::new(400, 400), (400, 400), TexturePolicy::PerFrame).unwrap();
        compositor.draw(&scene(0.0)).unwrap();
        compositor.draw(&scene(300.0)).unwrap();

        let out = compositor.read_pixels().unwrap();
        assert_eq!(out.pixel(0, 150), Some([0, 0, 0, 0]));
        assert_eq!(out.pixel(300, 150), Some([0, 128, 0, 255]));
    }

    #[test]
    fn test_per_frame_policy_releases_every_texture() {
        let mut compositor =
            Compositor::new(SoftwareBackend::new(16, 16), (16, 16), TexturePolicy::PerFrame).unwrap();
        let source = Raster::new(16, 16);
        for _ in 0..3 {
            compositor.draw(&source).unwrap();
        }
        let stats = compositor.stats();
        assert_eq!(stats.frames, 3);
        assert_eq!(stats.textures_created, 3);
        assert_eq!(stats.textures_released, 3);
        assert_eq!(compositor.backend().live_textures(), 0);
    }

    #[test]
    fn test_pooled_policy_reuses_until_resize() {
        let mut compositor =
            Compositor::new(SoftwareBackend::new(16, 16), (16, 16), TexturePolicy::Pooled).unwrap();
        for _ in 0..3 {
            compositor.draw(&Raster::new(16, 16)).unwrap();
        }
        assert_eq!(compositor.stats().textures_created, 1);
        assert_eq!(compositor.backend().live_textures(), 1);

        compositor.draw(&Raster::new(8, 8)).unwrap();
        let stats = compositor.stats();
        assert_eq!(stats.textures_created, 2);
        assert_eq!(stats.textures_released, 1);
        assert_eq!(compositor.backend().live_textures(), 1);
    }

    #[test]
    fn test_exhaustion_fails_the_frame_only() {
        let backend = SoftwareBackend::with_texture_budget(16, 16, 0);
        let mut compositor = Compositor::new(backend, (16, 16), TexturePolicy::PerFrame).unwrap();
        assert!(matches!(
            compositor.draw(&Raster::new(16, 16)),
            Err(CompositorError::ResourceExhaustion(_))
        ));
        assert_eq!(compositor.stats().frames, 0);
        assert!(compositor.read_pixels().is_ok());
    }
}
