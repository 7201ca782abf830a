//! Canvas Relay Surfaces
//!
//! The platform side of the relay: pixel rasters, 2D drawing contexts,
//! hidden surfaces that can be detached into a transferable offscreen
//! handle, and the display clock that presents submitted drawings into
//! the linked views the host reads back.

mod color;
mod display;
mod raster;
mod surface;

pub use color::Color;
pub use display::Display;
pub use raster::{PixelSource, Raster};
pub use surface::{Context2d, HiddenSurface, LinkedView, OffscreenSurface, SurfaceError, SurfaceId};
