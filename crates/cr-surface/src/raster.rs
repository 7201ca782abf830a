//! RGBA8 raster storage and the pixel-source abstraction.

use crate::color::Color;
use crate::surface::SurfaceError;
use std::ops::Range;

/// Anything the compositor can upload as an RGBA8 texture.
pub trait PixelSource {
    /// Width and height in pixels
    fn dimensions(&self) -> (u32, u32);

    /// Tightly packed RGBA8 rows, top row first
    fn rgba8(&self) -> &[u8];
}

/// A width x height RGBA8 pixel buffer, top row first.
#[derive(Clone, PartialEq, Eq)]
pub struct Raster {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl Raster {
    /// Create a fully transparent raster.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0; width as usize * height as usize * 4],
        }
    }

    /// Wrap an existing RGBA8 buffer.
    pub fn from_rgba(width: u32, height: u32, data: Vec<u8>) -> Result<Self, SurfaceError> {
        let expected = width as usize * height as usize * 4;
        if data.len() != expected {
            return Err(SurfaceError::InvalidBuffer {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { width, height, data })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Read one pixel, `None` outside the raster.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = self.offset(x, y);
        Some([self.data[i], self.data[i + 1], self.data[i + 2], self.data[i + 3]])
    }

    /// Write one pixel; writes outside the raster are dropped.
    pub fn put_pixel(&mut self, x: u32, y: u32, px: [u8; 4]) {
        if x >= self.width || y >= self.height {
            return;
        }
        let i = self.offset(x, y);
        self.data[i..i + 4].copy_from_slice(&px);
    }

    /// Reset every pixel to transparent black.
    pub fn clear(&mut self) {
        self.data.fill(0);
    }

    /// Reset a region to transparent black.
    pub fn clear_rect(&mut self, x: f64, y: f64, w: f64, h: f64) {
        self.write_rect(x, y, w, h, [0, 0, 0, 0]);
    }

    /// Fill a region with an opaque-replace color.
    ///
    /// A pixel is covered when its centre lies inside the rectangle, so
    /// integer-aligned rectangles cover exactly `w * h` pixels. Negative
    /// extents are normalized and the result is clipped to the raster.
    pub fn fill_rect(&mut self, x: f64, y: f64, w: f64, h: f64, color: Color) {
        self.write_rect(x, y, w, h, color.to_rgba8());
    }

    fn write_rect(&mut self, x: f64, y: f64, w: f64, h: f64, px: [u8; 4]) {
        let cols = covered_span(x, w, self.width);
        let rows = covered_span(y, h, self.height);
        if cols.is_empty() {
            return;
        }
        for row in rows {
            let start = self.offset(cols.start, row);
            let end = self.offset(cols.end - 1, row) + 4;
            for chunk in self.data[start..end].chunks_exact_mut(4) {
                chunk.copy_from_slice(&px);
            }
        }
    }

    fn offset(&self, x: u32, y: u32) -> usize {
        (y as usize * self.width as usize + x as usize) * 4
    }
}

impl PixelSource for Raster {
    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn rgba8(&self) -> &[u8] {
        &self.data
    }
}

impl std::fmt::Debug for Raster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Raster")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

/// Pixel indices whose centres fall inside `[start, start + len)`.
fn covered_span(start: f64, len: f64, limit: u32) -> Range<u32> {
    if !start.is_finite() || !len.is_finite() {
        return 0..0;
    }
    let (lo, hi) = if len < 0.0 {
        (start + len, start)
    } else {
        (start, start + len)
    };
    let first = (lo - 0.5).ceil().clamp(0.0, limit as f64) as u32;
    let last = (hi - 0.5).ceil().clamp(0.0, limit as f64) as u32;
    first..last.max(first)
}
