//! CPU implementation of the compositing pipeline.
//!
//! Follows the GPU path stage by stage: pixel positions are mapped to clip
//! space with y flipped, triangles are rasterized at pixel centres, and the
//! fragment stage fetches the nearest texel with edge clamping.

use crate::backend::{CompositorBackend, CompositorError, QuadGeometry, Uniforms};
use cr_surface::{PixelSource, Raster};
use glam::DVec2;
use std::collections::HashMap;
use tracing::debug;

/// Edge-function slack so pixels on the shared diagonal are never dropped.
const EDGE_EPSILON: f64 = 1e-9;

/// A texture living in the backend's texture table.
#[derive(Debug)]
pub struct SoftwareTexture {
    id: u64,
    width: u32,
    height: u32,
}

impl SoftwareTexture {
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

/// Software compositor backend.
pub struct SoftwareBackend {
    target: Raster,
    quad: Option<QuadGeometry>,
    textures: HashMap<u64, Raster>,
    next_texture: u64,
    max_live_textures: usize,
}

impl SoftwareBackend {
    /// Default texture budget
    pub const DEFAULT_MAX_TEXTURES: usize = 4;

    pub fn new(width: u32, height: u32) -> Self {
        Self::with_texture_budget(width, height, Self::DEFAULT_MAX_TEXTURES)
    }

    /// Create a backend that fails texture creation beyond `max_live_textures`.
    pub fn with_texture_budget(width: u32, height: u32, max_live_textures: usize) -> Self {
        Self {
            target: Raster::new(width, height),
            quad: None,
            textures: HashMap::new(),
            next_texture: 1,
            max_live_textures,
        }
    }

    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }
}

impl CompositorBackend for SoftwareBackend {
    type Texture = SoftwareTexture;

    fn name(&self) -> &'static str {
        "software"
    }

    fn output_size(&self) -> (u32, u32) {
        (self.target.width(), self.target.height())
    }

    fn setup(&mut self, quad: &QuadGeometry) -> Result<(), CompositorError> {
        self.quad = Some(*quad);
        self.target.clear();
        debug!(
            "Software pipeline ready ({}x{})",
            self.target.width(),
            self.target.height()
        );
        Ok(())
    }

    fn create_texture(&mut self, width: u32, height: u32) -> Result<SoftwareTexture, CompositorError> {
        if width == 0 || height == 0 {
            return Err(CompositorError::ResourceExhaustion(format!(
                "texture {}x{} is empty",
                width, height
            )));
        }
        if self.textures.len() >= self.max_live_textures {
            return Err(CompositorError::ResourceExhaustion(format!(
                "texture budget of {} exhausted",
                self.max_live_textures
            )));
        }
        let id = self.next_texture;
        self.next_texture += 1;
        self.textures.insert(id, Raster::new(width, height));
        Ok(SoftwareTexture { id, width, height })
    }

    fn upload(&mut self, texture: &SoftwareTexture, source: &dyn PixelSource) -> Result<(), CompositorError> {
        if source.dimensions() != texture.dimensions() {
            return Err(CompositorError::SourceMismatch {
                expected: texture.dimensions(),
                actual: source.dimensions(),
            });
        }
        let storage = Raster::from_rgba(texture.width, texture.height, source.rgba8().to_vec())
            .map_err(|e| CompositorError::Backend(e.to_string()))?;
        self.textures.insert(texture.id, storage);
        Ok(())
    }

    fn draw(&mut self, texture: &SoftwareTexture, uniforms: &Uniforms, vertex_count: u32) -> Result<(), CompositorError> {
        let quad = self.quad.ok_or(CompositorError::NotSetUp)?;
        let image = self
            .textures
            .get(&texture.id)
            .ok_or_else(|| CompositorError::Backend(format!("unknown texture {}", texture.id)))?;

        self.target.clear();
        let viewport = DVec2::new(self.target.width() as f64, self.target.height() as f64);
        let resolution = DVec2::new(uniforms.resolution[0] as f64, uniforms.resolution[1] as f64);
        let texture_size = DVec2::new(uniforms.texture_size[0] as f64, uniforms.texture_size[1] as f64);

        let vertex_count = (vertex_count as usize).min(quad.positions.len());
        for tri in 0..vertex_count / 3 {
            let mut window = [DVec2::ZERO; 3];
            let mut uv = [DVec2::ZERO; 3];
            for k in 0..3 {
                let v = tri * 3 + k;
                window[k] = vertex_stage(quad.positions[v].as_dvec2(), resolution, viewport);
                uv[k] = quad.texcoords[v].as_dvec2();
            }
            rasterize(&mut self.target, window, uv, |coord| {
                fragment_stage(image, coord, texture_size)
            });
        }
        Ok(())
    }

    fn release_texture(&mut self, texture: SoftwareTexture) {
        self.textures.remove(&texture.id);
    }

    fn read_pixels(&mut self) -> Result<Raster, CompositorError> {
        Ok(self.target.clone())
    }
}

/// Pixel position -> clip space (y up) -> window coordinates (row 0 on top).
fn vertex_stage(position: DVec2, resolution: DVec2, viewport: DVec2) -> DVec2 {
    let zero_to_one = position / resolution;
    let clip = (zero_to_one * 2.0 - 1.0) * DVec2::new(1.0, -1.0);
    DVec2::new((clip.x + 1.0) * 0.5 * viewport.x, (1.0 - clip.y) * 0.5 * viewport.y)
}

/// Nearest texel, snapped through the nominal size, clamped to the edge.
fn fragment_stage(image: &Raster, coord: DVec2, texture_size: DVec2) -> [u8; 4] {
    let snapped = ((coord * texture_size).floor() + 0.5) / texture_size;
    let dims = DVec2::new(image.width() as f64, image.height() as f64);
    let texel = (snapped * dims).floor();
    let x = texel.x.clamp(0.0, dims.x - 1.0) as u32;
    let y = texel.y.clamp(0.0, dims.y - 1.0) as u32;
    image.pixel(x, y).unwrap_or([0, 0, 0, 0])
}

fn edge(a: DVec2, b: DVec2, p: DVec2) -> f64 {
    (b.x - a.x) * (p.y - a.y) - (b.y - a.y) * (p.x - a.x)
}

fn rasterize(
    target: &mut Raster,
    window: [DVec2; 3],
    uv: [DVec2; 3],
    shade: impl Fn(DVec2) -> [u8; 4],
) {
    let area = edge(window[0], window[1], window[2]);
    if area == 0.0 {
        return;
    }
    let min = window[0].min(window[1]).min(window[2]);
    let max = window[0].max(window[1]).max(window[2]);
    let x0 = min.x.floor().max(0.0) as u32;
    let y0 = min.y.floor().max(0.0) as u32;
    let x1 = (max.x.ceil().max(0.0) as u32).min(target.width());
    let y1 = (max.y.ceil().max(0.0) as u32).min(target.height());

    for py in y0..y1 {
        for px in x0..x1 {
            let p = DVec2::new(px as f64 + 0.5, py as f64 + 0.5);
            let w0 = edge(window[1], window[2], p) / area;
            let w1 = edge(window[2], window[0], p) / area;
            let w2 = edge(window[0], window[1], p) / area;
            if w0 < -EDGE_EPSILON || w1 < -EDGE_EPSILON || w2 < -EDGE_EPSILON {
                continue;
            }
            let coord = uv[0] * w0 + uv[1] * w1 + uv[2] * w2;
            target.put_pixel(px, py, shade(coord));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cr_surface::Color;

    fn uniforms(w: f32, h: f32) -> Uniforms {
        Uniforms {
            resolution: [w, h],
            texture_size: [w, h],
        }
    }

    #[test]
    fn test_vertex_stage_maps_pixels_to_rows_top_down() {
        let res = DVec2::new(400.0, 400.0);
        assert_eq!(vertex_stage(DVec2::new(0.0, 0.0), res, res), DVec2::new(0.0, 0.0));
        assert_eq!(vertex_stage(DVec2::new(400.0, 400.0), res, res), DVec2::new(400.0, 400.0));
        assert_eq!(vertex_stage(DVec2::new(100.0, 300.0), res, res), DVec2::new(100.0, 300.0));
    }

    #[test]
    fn test_identity_blit() {
        let mut source = Raster::new(8, 8);
        source.fill_rect(2.0, 3.0, 4.0, 2.0, Color::GREEN);
        source.put_pixel(0, 0, [1, 2, 3, 4]);
        source.put_pixel(7, 7, [5, 6, 7, 8]);

        let mut backend = SoftwareBackend::new(8, 8);
        backend.setup(&QuadGeometry::rect(0.0, 0.0, 8.0, 8.0)).unwrap();
        let texture = backend.create_texture(8, 8).unwrap();
        backend.upload(&texture, &source).unwrap();
        backend.draw(&texture, &uniforms(8.0, 8.0), 6).unwrap();
        backend.release_texture(texture);

        assert_eq!(backend.read_pixels().unwrap(), source);
        assert_eq!(backend.live_textures(), 0);
    }

    #[test]
    fn test_draw_requires_setup() {
        let mut backend = SoftwareBackend::new(4, 4);
        let texture = backend.create_texture(4, 4).unwrap();
        assert!(matches!(
            backend.draw(&texture, &uniforms(4.0, 4.0), 6),
            Err(CompositorError::NotSetUp)
        ));
    }

    #[test]
    fn test_texture_budget() {
        let mut backend = SoftwareBackend::with_texture_budget(4, 4, 1);
        let first = backend.create_texture(4, 4).unwrap();
        assert!(matches!(
            backend.create_texture(4, 4),
            Err(CompositorError::ResourceExhaustion(_))
        ));
        backend.release_texture(first);
        assert!(backend.create_texture(4, 4).is_ok());
    }

    #[test]
    fn test_empty_texture_rejected() {
        let mut backend = SoftwareBackend::new(4, 4);
        assert!(matches!(
            backend.create_texture(0, 4),
            Err(CompositorError::ResourceExhaustion(_))
        ));
        assert!(matches!(
            backend.create_texture(4, 0),
            Err(CompositorError::ResourceExhaustion(_))
        ));
        assert_eq!(backend.live_textures(), 0);
    }

    #[test]
    fn test_upload_size_mismatch() {
        let mut backend = SoftwareBackend::new(4, 4);
        let texture = backend.create_texture(4, 4).unwrap();
        let source = Raster::new(2, 2);
        assert!(matches!(
            backend.upload(&texture, &source),
            Err(CompositorError::SourceMismatch { expected: (4, 4), actual: (2, 2) })
        ));
    }

    #[test]
    fn test_upscale_uses_nearest_texel() {
        let mut source = Raster::new(2, 2);
        source.put_pixel(0, 0, [255, 0, 0, 255]);
        source.put_pixel(1, 1, [0, 0, 255, 255]);

        let mut backend = SoftwareBackend::new(4, 4);
        backend.setup(&QuadGeometry::rect(0.0, 0.0, 4.0, 4.0)).unwrap();
        let texture = backend.create_texture(2, 2).unwrap();
        backend.upload(&texture, &source).unwrap();
        let uniforms = Uniforms {
            resolution: [4.0, 4.0],
            texture_size: [2.0, 2.0],
        };
        backend.draw(&texture, &uniforms, 6).unwrap();

        let out = backend.read_pixels().unwrap();
        assert_eq!(out.pixel(0, 0), Some([255, 0, 0, 255]));
        assert_eq!(out.pixel(1, 1), Some([255, 0, 0, 255]));
        assert_eq!(out.pixel(2, 2), Some([0, 0, 255, 255]));
        assert_eq!(out.pixel(3, 3), Some([0, 0, 255, 255]));
        assert_eq!(out.pixel(3, 0), Some([0, 0, 0, 0]));
    }
}
