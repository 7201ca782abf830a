//! Hidden surfaces, transferable offscreen handles and linked views.
//!
//! A [`HiddenSurface`] starts out owned by the host. Detaching it with
//! [`HiddenSurface::transfer_control_to_offscreen`] yields the single
//! [`OffscreenSurface`] capability that can be moved to another context;
//! from then on the host keeps only a read-only [`LinkedView`], which the
//! [`Display`](crate::Display) refreshes on every tick.

use crate::color::Color;
use crate::display::Display;
use crate::raster::Raster;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::debug;

/// Global surface ID counter
static NEXT_SURFACE_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceId(pub u64);

impl fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Surface({})", self.0)
    }
}

/// Surface errors
#[derive(Debug, Error)]
pub enum SurfaceError {
    #[error("Surface control has already been transferred")]
    AlreadyTransferred,

    #[error("Surface is detached from this context")]
    Detached,

    #[error("Invalid surface dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("Pixel buffer has {actual} bytes, expected {expected}")]
    InvalidBuffer { expected: usize, actual: usize },

    #[error("Display has stopped")]
    DisplayStopped,

    #[error("Failed to start display: {0}")]
    Spawn(String),
}

struct SurfaceState {
    /// Backing store the current owner draws into
    working: Raster,
    /// Last drawing handed to the platform
    submitted: Raster,
    submitted_gen: u64,
    /// What the linked view currently shows
    presented: Raster,
    presented_gen: u64,
}

/// Storage shared between the owning context and the platform presenter.
pub(crate) struct SurfaceShared {
    id: SurfaceId,
    width: u32,
    height: u32,
    /// Which capability may draw; bumped on transfer
    owner_epoch: AtomicU64,
    state: Mutex<SurfaceState>,
}

impl SurfaceShared {
    fn lock(&self) -> MutexGuard<'_, SurfaceState> {
        // A panicking drawer cannot leave the raster structurally invalid.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Present the latest submission. Returns true if anything changed.
    pub(crate) fn present(&self) -> bool {
        let mut state = self.lock();
        if state.presented_gen == state.submitted_gen {
            return false;
        }
        let SurfaceState { submitted, presented, .. } = &mut *state;
        presented.clone_from(submitted);
        state.presented_gen = state.submitted_gen;
        true
    }

    pub(crate) fn id(&self) -> SurfaceId {
        self.id
    }
}

/// A host-owned surface that can be detached exactly once.
pub struct HiddenSurface {
    shared: Arc<SurfaceShared>,
    transferred: bool,
}

impl HiddenSurface {
    /// Create a transparent surface registered with `display`.
    pub fn new(width: u32, height: u32, display: &Display) -> Result<Self, SurfaceError> {
        if width == 0 || height == 0 {
            return Err(SurfaceError::InvalidDimensions { width, height });
        }
        let shared = Arc::new(SurfaceShared {
            id: SurfaceId(NEXT_SURFACE_ID.fetch_add(1, Ordering::Relaxed)),
            width,
            height,
            owner_epoch: AtomicU64::new(0),
            state: Mutex::new(SurfaceState {
                working: Raster::new(width, height),
                submitted: Raster::new(width, height),
                submitted_gen: 0,
                presented: Raster::new(width, height),
                presented_gen: 0,
            }),
        });
        display.register(&shared);
        debug!("Created hidden surface {} ({}x{})", shared.id, width, height);
        Ok(Self {
            shared,
            transferred: false,
        })
    }

    pub fn id(&self) -> SurfaceId {
        self.shared.id
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.shared.width, self.shared.height)
    }

    pub fn is_transferred(&self) -> bool {
        self.transferred
    }

    /// Drawing context for the host, only while it still owns the surface.
    pub fn context_2d(&self) -> Result<Context2d, SurfaceError> {
        if self.transferred {
            return Err(SurfaceError::Detached);
        }
        Ok(Context2d::new(self.shared.clone()))
    }

    /// Detach the surface into its transferable handle.
    ///
    /// Contexts handed out earlier by [`context_2d`](Self::context_2d) stop
    /// working: every draw through them fails with [`SurfaceError::Detached`].
    pub fn transfer_control_to_offscreen(&mut self) -> Result<OffscreenSurface, SurfaceError> {
        if self.transferred {
            return Err(SurfaceError::AlreadyTransferred);
        }
        self.transferred = true;
        self.shared.owner_epoch.fetch_add(1, Ordering::AcqRel);
        debug!("Transferred control of {} to offscreen handle", self.shared.id);
        Ok(OffscreenSurface {
            shared: self.shared.clone(),
        })
    }

    /// Read-only view that follows whatever the owner presents.
    pub fn linked_view(&self) -> LinkedView {
        LinkedView {
            shared: self.shared.clone(),
        }
    }
}

/// The exclusive, non-duplicable drawing capability for a detached surface.
pub struct OffscreenSurface {
    shared: Arc<SurfaceShared>,
}

impl OffscreenSurface {
    pub fn id(&self) -> SurfaceId {
        self.shared.id
    }

    pub fn width(&self) -> u32 {
        self.shared.width
    }

    pub fn height(&self) -> u32 {
        self.shared.height
    }

    /// Bind a 2D drawing context to this surface.
    pub fn context_2d(&self) -> Context2d {
        Context2d::new(self.shared.clone())
    }
}

impl fmt::Debug for OffscreenSurface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OffscreenSurface")
            .field("id", &self.shared.id)
            .field("width", &self.shared.width)
            .field("height", &self.shared.height)
            .finish()
    }
}

/// A 2D raster context bound to one surface and one ownership epoch.
pub struct Context2d {
    shared: Arc<SurfaceShared>,
    epoch: u64,
}

impl Context2d {
    fn new(shared: Arc<SurfaceShared>) -> Self {
        let epoch = shared.owner_epoch.load(Ordering::Acquire);
        Self { shared, epoch }
    }

    pub fn width(&self) -> u32 {
        self.shared.width
    }

    pub fn height(&self) -> u32 {
        self.shared.height
    }

    pub fn clear_rect(&self, x: f64, y: f64, w: f64, h: f64) -> Result<(), SurfaceError> {
        self.with_working(|raster| raster.clear_rect(x, y, w, h))
    }

    pub fn fill_rect(&self, x: f64, y: f64, w: f64, h: f64, color: Color) -> Result<(), SurfaceError> {
        self.with_working(|raster| raster.fill_rect(x, y, w, h, color))
    }

    /// Hand the current drawing to the platform for presentation.
    ///
    /// Returns the submission generation.
    pub fn commit(&self) -> Result<u64, SurfaceError> {
        self.check_owner()?;
        let mut state = self.shared.lock();
        let SurfaceState { working, submitted, .. } = &mut *state;
        submitted.clone_from(working);
        state.submitted_gen += 1;
        Ok(state.submitted_gen)
    }

    fn with_working(&self, draw: impl FnOnce(&mut Raster)) -> Result<(), SurfaceError> {
        self.check_owner()?;
        draw(&mut self.shared.lock().working);
        Ok(())
    }

    fn check_owner(&self) -> Result<(), SurfaceError> {
        if self.shared.owner_epoch.load(Ordering::Acquire) != self.epoch {
            return Err(SurfaceError::Detached);
        }
        Ok(())
    }
}

/// Read-capable view of a surface, kept in sync by the display.
#[derive(Clone)]
pub struct LinkedView {
    shared: Arc<SurfaceShared>,
}

impl LinkedView {
    pub fn id(&self) -> SurfaceId {
        self.shared.id
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.shared.width, self.shared.height)
    }

    /// Copy of the most recently presented frame.
    pub fn snapshot(&self) -> Raster {
        self.shared.lock().presented.clone()
    }

    /// Whether a submitted drawing is still waiting for presentation.
    pub fn has_pending(&self) -> bool {
        let state = self.shared.lock();
        state.submitted_gen != state.presented_gen
    }

    pub fn presented_generation(&self) -> u64 {
        self.shared.lock().presented_gen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn display() -> Display {
        Display::start(Duration::from_secs(60)).unwrap()
    }

    #[test]
    fn test_transfer_happens_once() {
        let display = display();
        let mut hidden = HiddenSurface::new(8, 8, &display).unwrap();

        let offscreen = hidden.transfer_control_to_offscreen().unwrap();
        assert_eq!(offscreen.id(), hidden.id());
        assert!(hidden.is_transferred());
        assert!(matches!(
            hidden.transfer_control_to_offscreen(),
            Err(SurfaceError::AlreadyTransferred)
        ));
    }

    #[test]
    fn test_host_loses_write_access_after_transfer() {
        let display = display();
        let mut hidden = HiddenSurface::new(8, 8, &display).unwrap();
        let early = hidden.context_2d().unwrap();
        early.fill_rect(0.0, 0.0, 1.0, 1.0, Color::WHITE).unwrap();

        let _offscreen = hidden.transfer_control_to_offscreen().unwrap();

        assert!(matches!(hidden.context_2d(), Err(SurfaceError::Detached)));
        assert!(matches!(
            early.fill_rect(0.0, 0.0, 8.0, 8.0, Color::WHITE),
            Err(SurfaceError::Detached)
        ));
        assert!(matches!(early.commit(), Err(SurfaceError::Detached)));
    }

    #[test]
    fn test_linked_view_follows_presentation() {
        let display = display();
        let mut hidden = HiddenSurface::new(4, 4, &display).unwrap();
        let view = hidden.linked_view();
        let offscreen = hidden.transfer_control_to_offscreen().unwrap();
        let ctx = offscreen.context_2d();

        ctx.fill_rect(0.0, 0.0, 2.0, 2.0, Color::GREEN).unwrap();
        assert!(!view.has_pending());

        assert_eq!(ctx.commit().unwrap(), 1);
        assert!(view.has_pending());
        assert_eq!(view.snapshot().pixel(0, 0), Some([0, 0, 0, 0]));

        assert!(view.shared.present());
        assert!(!view.has_pending());
        assert_eq!(view.presented_generation(), 1);
        assert_eq!(view.snapshot().pixel(0, 0), Some([0, 128, 0, 255]));
        assert!(!view.shared.present());
    }

    #[test]
    fn test_zero_sized_surface_rejected() {
        let display = display();
        assert!(matches!(
            HiddenSurface::new(0, 4, &display),
            Err(SurfaceError::InvalidDimensions { width: 0, height: 4 })
        ));
    }
}
