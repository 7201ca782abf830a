//! Render proxy state machine.
//!
//! ```text
//! Uninitialized --Init--> Bound --Render--> Bound
//! ```
//!
//! All state lives in a [`ProxySession`] owned by the sandbox's event loop
//! and passed to every handler.

use cr_channel::{FrameTime, Message, Seq};
use cr_surface::{Color, Context2d, OffscreenSurface, SurfaceError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Proxy errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Surface error: {0}")]
    Surface(#[from] SurfaceError),
}

/// What the proxy draws for a frame.
///
/// The reference scene is a square whose left edge sits at
/// `time * scale`, `top` pixels from the top.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneConfig {
    /// Horizontal pixels per unit of frame time
    pub scale: f64,
    /// Square edge length in pixels
    pub size: f64,
    /// Vertical offset in pixels
    pub top: f64,
    /// Fill color as 0xRRGGBB
    pub color: u32,
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            scale: 300.0,
            size: 100.0,
            top: 150.0,
            color: 0x008000,
        }
    }
}

impl SceneConfig {
    /// Left edge of the square for `time`.
    pub fn offset_for(&self, time: FrameTime) -> f64 {
        time * self.scale
    }

    pub fn fill(&self) -> Color {
        Color::from_hex(self.color)
    }

    pub fn validate(&self) -> Result<(), String> {
        if !self.scale.is_finite() {
            return Err(format!("scene scale must be finite, got {}", self.scale));
        }
        if !(self.size.is_finite() && self.size > 0.0) {
            return Err(format!("scene size must be positive, got {}", self.size));
        }
        if !self.top.is_finite() {
            return Err(format!("scene top must be finite, got {}", self.top));
        }
        if self.color > 0xFF_FFFF {
            return Err(format!("scene color {:#x} is not 0xRRGGBB", self.color));
        }
        Ok(())
    }
}

/// Proxy state.
pub enum ProxyState {
    /// Waiting for the surface
    Uninitialized,
    /// Surface received and a drawing context bound
    Bound {
        surface: OffscreenSurface,
        context: Context2d,
    },
}

/// Work left over at the end of a handler, flushed by the event loop once
/// the handler's turn is over: commit the drawing, then send the replies.
#[derive(Debug, Default)]
pub struct Turn {
    pub replies: Vec<Message>,
    pub commit: bool,
}

/// Explicit sandbox session passed to every handler.
pub struct ProxySession {
    state: ProxyState,
    scene: SceneConfig,
    frames_drawn: u64,
}

impl ProxySession {
    pub fn new(scene: SceneConfig) -> Self {
        Self {
            state: ProxyState::Uninitialized,
            scene,
            frames_drawn: 0,
        }
    }

    pub fn state(&self) -> &ProxyState {
        &self.state
    }

    pub fn is_bound(&self) -> bool {
        matches!(self.state, ProxyState::Bound { .. })
    }

    pub fn frames_drawn(&self) -> u64 {
        self.frames_drawn
    }

    /// Handle one inbound message.
    pub fn handle(&mut self, message: Message) -> Result<Turn, ProxyError> {
        match message {
            Message::Init { offscreen } => self.init(offscreen),
            Message::Render { time, seq } => self.render(time, seq),
            other => Err(ProxyError::ProtocolViolation(format!(
                "{} is not addressed to the sandbox",
                other.command()
            ))),
        }
    }

    /// Finish a turn: submit the drawing if one was made.
    pub fn end_turn(&self, turn: &Turn) -> Result<(), ProxyError> {
        if !turn.commit {
            return Ok(());
        }
        match &self.state {
            ProxyState::Bound { context, .. } => {
                context.commit()?;
                Ok(())
            }
            ProxyState::Uninitialized => Err(ProxyError::ProtocolViolation(
                "commit without a bound surface".to_string(),
            )),
        }
    }

    fn init(&mut self, offscreen: OffscreenSurface) -> Result<Turn, ProxyError> {
        if let ProxyState::Bound { surface, .. } = &self.state {
            // The duplicate handle is dropped here; the first binding stays.
            return Err(ProxyError::ProtocolViolation(format!(
                "duplicate init ({} already bound, {} rejected)",
                surface.id(),
                offscreen.id()
            )));
        }
        let context = offscreen.context_2d();
        info!(
            "Bound 2D context to {} ({}x{})",
            offscreen.id(),
            offscreen.width(),
            offscreen.height()
        );
        self.state = ProxyState::Bound {
            surface: offscreen,
            context,
        };
        Ok(Turn {
            replies: vec![Message::InitAck],
            commit: false,
        })
    }

    fn render(&mut self, time: FrameTime, seq: Seq) -> Result<Turn, ProxyError> {
        let ProxyState::Bound { context, .. } = &self.state else {
            return Err(ProxyError::ProtocolViolation(format!(
                "render {} before init",
                seq
            )));
        };

        let (w, h) = (context.width() as f64, context.height() as f64);
        context.clear_rect(0.0, 0.0, w, h)?;
        let x = self.scene.offset_for(time);
        context.fill_rect(x, self.scene.top, self.scene.size, self.scene.size, self.scene.fill())?;
        self.frames_drawn += 1;
        debug!("Drew frame {} at time {} (x = {})", seq, time, x);

        Ok(Turn {
            replies: vec![Message::RenderAck { seq }],
            commit: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cr_surface::{Display, HiddenSurface, LinkedView};
    use std::time::Duration;

    const GREEN: [u8; 4] = [0, 128, 0, 255];
    const CLEAR: [u8; 4] = [0, 0, 0, 0];

    fn bound_session(display: &Display) -> (ProxySession, LinkedView, HiddenSurface) {
        let mut hidden = HiddenSurface::new(400, 400, display).unwrap();
        let view = hidden.linked_view();
        let offscreen = hidden.transfer_control_to_offscreen().unwrap();
        let mut session = ProxySession::new(SceneConfig::default());
        let turn = session.handle(Message::Init { offscreen }).unwrap();
        assert!(matches!(turn.replies.as_slice(), [Message::InitAck]));
        assert!(!turn.commit);
        (session, view, hidden)
    }

    async fn render_and_present(
        session: &mut ProxySession,
        display: &Display,
        view: &LinkedView,
        time: f64,
    ) -> cr_surface::Raster {
        let turn = session.handle(Message::Render { time, seq: Seq(1) }).unwrap();
        session.end_turn(&turn).unwrap();
        while view.has_pending() {
            display.next_frame().await.unwrap();
        }
        view.snapshot()
    }

    #[test]
    fn test_render_before_init_is_violation() {
        let mut session = ProxySession::new(SceneConfig::default());
        let result = session.handle(Message::Render { time: 0.0, seq: Seq(1) });
        assert!(matches!(result, Err(ProxyError::ProtocolViolation(_))));
        assert!(!session.is_bound());
    }

    #[test]
    fn test_duplicate_init_keeps_first_surface() {
        let display = Display::start(Duration::from_secs(60)).unwrap();
        let (mut session, view, _hidden) = bound_session(&display);

        let mut other = HiddenSurface::new(10, 10, &display).unwrap();
        let second = other.transfer_control_to_offscreen().unwrap();
        let result = session.handle(Message::Init { offscreen: second });
        assert!(matches!(result, Err(ProxyError::ProtocolViolation(_))));

        match session.state() {
            ProxyState::Bound { surface, .. } => assert_eq!(surface.id(), view.id()),
            ProxyState::Uninitialized => panic!("session lost its binding"),
        }
    }

    #[test]
    fn test_render_acks_with_seq_and_commits() {
        let display = Display::start(Duration::from_secs(60)).unwrap();
        let (mut session, view, _hidden) = bound_session(&display);

        let turn = session.handle(Message::Render { time: 0.0, seq: Seq(9) }).unwrap();
        assert!(matches!(turn.replies.as_slice(), [Message::RenderAck { seq: Seq(9) }]));
        assert!(turn.commit);
        assert!(!view.has_pending());

        session.end_turn(&turn).unwrap();
        assert!(view.has_pending());
        assert_eq!(session.frames_drawn(), 1);
    }

    #[tokio::test]
    async fn test_square_position_is_a_function_of_time() {
        let display = Display::start(Duration::from_millis(2)).unwrap();
        let (mut session, view, _hidden) = bound_session(&display);

        for time in [0.0, 0.5, 1.0] {
            let frame = render_and_present(&mut session, &display, &view, time).await;
            let left = (time * 300.0) as u32;

            assert_eq!(frame.pixel(left, 150), Some(GREEN), "t = {}", time);
            assert_eq!(frame.pixel(left + 99, 249), Some(GREEN), "t = {}", time);
            if left + 100 < 400 {
                assert_eq!(frame.pixel(left + 100, 150), Some(CLEAR), "t = {}", time);
            }
            assert_eq!(frame.pixel(left, 149), Some(CLEAR), "t = {}", time);
            assert_eq!(frame.pixel(left, 250), Some(CLEAR), "t = {}", time);
            if left > 0 {
                assert_eq!(frame.pixel(left - 1, 150), Some(CLEAR), "t = {}", time);
            }
        }
    }

    #[tokio::test]
    async fn test_each_frame_clears_the_previous_one() {
        let display = Display::start(Duration::from_millis(2)).unwrap();
        let (mut session, view, _hidden) = bound_session(&display);

        render_and_present(&mut session, &display, &view, 0.0).await;
        let frame = render_and_present(&mut session, &display, &view, 1.0).await;
        assert_eq!(frame.pixel(0, 150), Some(CLEAR));
        assert_eq!(frame.pixel(300, 150), Some(GREEN));
    }

    #[test]
    fn test_scene_validation() {
        assert!(SceneConfig::default().validate().is_ok());
        let bad = SceneConfig {
            size: 0.0,
            ..SceneConfig::default()
        };
        assert!(bad.validate().is_err());
        let bad = SceneConfig {
            color: 0x1_000_000,
            ..SceneConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}
