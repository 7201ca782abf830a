//! Host-side session aggregate.

use crate::config::{ConfigError, SurfaceConfig};
use crate::error::SessionError;
use cr_channel::{FrameTime, Seq};
use cr_render::{Compositor, CompositorBackend};
use cr_surface::{Display, HiddenSurface, LinkedView, OffscreenSurface};
use std::fmt;
use tracing::info;

/// Where the host is in the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    /// Bootstrapped, `init` not yet acknowledged
    AwaitingHandshake,
    /// Handshake done, no render outstanding
    Ready,
    /// A render is outstanding
    Rendering { seq: Seq },
}

impl fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AwaitingHandshake => write!(f, "awaiting handshake"),
            Self::Ready => write!(f, "ready"),
            Self::Rendering { seq } => write!(f, "rendering {}", seq),
        }
    }
}

/// Per-session counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub frames_rendered: u64,
    /// Frames acknowledged by the sandbox but not composited
    pub frames_skipped: u64,
    pub protocol_violations: u64,
    pub timeouts: u64,
    /// Inputs replaced by a newer one before they were rendered
    pub inputs_coalesced: u64,
}

/// Outcome of one completed render cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameReport {
    pub seq: Seq,
    pub time: FrameTime,
    /// Display ticks waited after the ack
    pub settle_ticks: u32,
    /// Presented generation of the linked view that was composited
    pub generation: u64,
}

pub(crate) struct Session<B: CompositorBackend> {
    pub(crate) display: Display,
    pub(crate) hidden: HiddenSurface,
    pub(crate) view: LinkedView,
    pub(crate) offscreen: Option<OffscreenSurface>,
    pub(crate) compositor: Compositor<B>,
    pub(crate) state: ProtocolState,
    pub(crate) stats: SessionStats,
    last_seq: Seq,
}

impl<B: CompositorBackend> Session<B> {
    /// Create the surfaces and detach the hidden one for transfer.
    pub(crate) fn bootstrap(config: &SurfaceConfig, compositor: Compositor<B>) -> Result<Self, SessionError> {
        let visible = compositor.backend().output_size();
        if visible != config.visible_size() {
            return Err(ConfigError::Invalid(format!(
                "compositor renders {}x{}, configured visible surface is {}x{}",
                visible.0, visible.1, config.width, config.height
            ))
            .into());
        }

        let display = Display::start(config.refresh_interval())?;
        let (width, height) = config.working_size();
        let mut hidden = HiddenSurface::new(width, height, &display)?;
        let view = hidden.linked_view();
        let offscreen = hidden.transfer_control_to_offscreen()?;

        info!(
            "Session bootstrapped: visible {}x{}, hidden {} {}x{}",
            visible.0,
            visible.1,
            hidden.id(),
            width,
            height
        );

        Ok(Self {
            display,
            hidden,
            view,
            offscreen: Some(offscreen),
            compositor,
            state: ProtocolState::AwaitingHandshake,
            stats: SessionStats::default(),
            last_seq: Seq(0),
        })
    }

    pub(crate) fn next_seq(&mut self) -> Seq {
        self.last_seq = self.last_seq.next();
        self.last_seq
    }
}
