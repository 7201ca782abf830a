//! Host controller: handshake and render cycles.
//!
//! All protocol traffic goes through the [`HostPort`]. Every reply listener
//! is installed before the message it waits on is sent, and every wait is
//! bounded by the reply timeout.

use crate::config::{RelayConfig, SettleStrategy};
use crate::error::SessionError;
use crate::session::{FrameReport, ProtocolState, Session, SessionStats};
use cr_channel::{channel, Command, FrameTime, HostPort, Listener, Message};
use cr_render::{Compositor, CompositorBackend};
use cr_sandbox::{embed_sandbox, SandboxHandle, SandboxId};
use cr_surface::{HiddenSurface, LinkedView, Raster};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Drives one relay session.
pub struct HostController<B: CompositorBackend> {
    // Dropped first so the sandbox sees the disconnect.
    port: HostPort,
    session: Session<B>,
    sandbox: Option<SandboxHandle>,
    reply_timeout: Duration,
    settle: SettleStrategy,
}

impl<B: CompositorBackend> HostController<B> {
    /// Bootstrap the surfaces, embed a sandbox and wait for it to load.
    pub async fn launch(config: &RelayConfig, backend: B) -> Result<Self, SessionError> {
        config.validate()?;
        let (port, sandbox_port) = channel();
        let sandbox = embed_sandbox(sandbox_port, config.sandbox_config()).await?;
        info!("Embedded {}", sandbox.id());
        Self::assemble(config, backend, port, Some(sandbox))
    }

    /// Bootstrap against an already-connected peer.
    pub fn with_port(config: &RelayConfig, backend: B, port: HostPort) -> Result<Self, SessionError> {
        config.validate()?;
        Self::assemble(config, backend, port, None)
    }

    fn assemble(
        config: &RelayConfig,
        backend: B,
        port: HostPort,
        sandbox: Option<SandboxHandle>,
    ) -> Result<Self, SessionError> {
        let compositor = Compositor::new(
            backend,
            config.surface.working_size(),
            config.compositor.texture_policy,
        )?;
        let session = Session::bootstrap(&config.surface, compositor)?;
        Ok(Self {
            port,
            session,
            sandbox,
            reply_timeout: config.host.reply_timeout(),
            settle: config.host.settle,
        })
    }

    pub fn state(&self) -> ProtocolState {
        self.session.state
    }

    pub fn stats(&self) -> SessionStats {
        self.session.stats
    }

    pub fn sandbox_id(&self) -> Option<SandboxId> {
        self.sandbox.as_ref().map(|s| s.id())
    }

    /// The original hidden surface; detached once bootstrapped.
    pub fn hidden_surface(&self) -> &HiddenSurface {
        &self.session.hidden
    }

    pub fn linked_view(&self) -> &LinkedView {
        &self.session.view
    }

    pub fn compositor(&self) -> &Compositor<B> {
        &self.session.compositor
    }

    /// Transfer the offscreen surface to the sandbox and wait for `init-ack`.
    pub async fn handshake(&mut self) -> Result<(), SessionError> {
        if self.session.state != ProtocolState::AwaitingHandshake {
            return Err(self.violation("handshake already completed".to_string()));
        }
        let Some(offscreen) = self.session.offscreen.take() else {
            return Err(self.violation("surface already transferred".to_string()));
        };

        let ack = self.port.listen(Command::InitAck);
        self.port.send(Message::Init { offscreen })?;
        debug!("Sent init");
        self.await_reply(ack, "init-ack").await?;

        self.session.state = ProtocolState::Ready;
        info!("Handshake complete");
        Ok(())
    }

    /// One render cycle: request, await the ack, settle, composite.
    pub async fn render(&mut self, time: FrameTime) -> Result<FrameReport, SessionError> {
        if !time.is_finite() {
            return Err(self.violation(format!("frame time {} is not finite", time)));
        }
        match self.session.state {
            ProtocolState::Ready => {}
            ProtocolState::AwaitingHandshake => {
                return Err(self.violation("render before handshake".to_string()));
            }
            ProtocolState::Rendering { seq } => {
                return Err(self.violation(format!("render {} still outstanding", seq)));
            }
        }

        let seq = self.session.next_seq();
        let ack = self.port.listen_for(Command::RenderAck, seq);
        self.port.send(Message::Render { time, seq })?;
        self.session.state = ProtocolState::Rendering { seq };
        debug!("Sent render {} (t={})", seq, time);

        let result = self.complete_cycle(ack).await;
        self.session.state = ProtocolState::Ready;

        let (settle_ticks, generation) = match result {
            Ok(done) => done,
            Err(e) => {
                if matches!(e, SessionError::ResourceExhaustion(_)) {
                    self.session.stats.frames_skipped += 1;
                }
                return Err(e);
            }
        };

        self.session.stats.frames_rendered += 1;
        debug!("Frame {} composited after {} ticks", seq, settle_ticks);
        Ok(FrameReport {
            seq,
            time,
            settle_ticks,
            generation,
        })
    }

    /// Render one frame per input until the stream closes.
    ///
    /// Inputs that queued up while a cycle was in flight collapse into the
    /// newest one. Recoverable errors are logged and the loop continues.
    pub async fn run(&mut self, mut inputs: mpsc::Receiver<FrameTime>) -> Result<(), SessionError> {
        while let Some(mut time) = inputs.recv().await {
            while let Ok(newer) = inputs.try_recv() {
                time = newer;
                self.session.stats.inputs_coalesced += 1;
            }

            match self.render(time).await {
                Ok(report) => debug!("Rendered {} at t={}", report.seq, report.time),
                Err(e) if e.is_recoverable() => warn!("Frame at t={} dropped: {}", time, e),
                Err(e) => {
                    error!("Session ended: {}", e);
                    return Err(e);
                }
            }
        }
        info!("Input stream closed");
        Ok(())
    }

    /// Current contents of the visible surface.
    pub fn visible_pixels(&mut self) -> Result<Raster, SessionError> {
        Ok(self.session.compositor.read_pixels()?)
    }

    async fn complete_cycle(&mut self, ack: Listener) -> Result<(u32, u64), SessionError> {
        self.await_reply(ack, "render-ack").await?;
        let ticks = self.settle().await?;

        let snapshot = self.session.view.snapshot();
        let generation = self.session.view.presented_generation();
        self.session.compositor.draw(&snapshot)?;
        Ok((ticks, generation))
    }

    /// Wait for the acknowledged drawing to reach the linked view.
    async fn settle(&mut self) -> Result<u32, SessionError> {
        match self.settle {
            SettleStrategy::Fixed { ticks } => {
                for _ in 0..ticks {
                    self.next_tick().await?;
                }
                Ok(ticks)
            }
            SettleStrategy::Verified { max_ticks } => {
                let mut waited = 0;
                while self.session.view.has_pending() {
                    if waited == max_ticks {
                        self.session.stats.timeouts += 1;
                        return Err(SessionError::Timeout {
                            what: "presentation".to_string(),
                            after: self.session.display.refresh_interval() * max_ticks,
                        });
                    }
                    self.next_tick().await?;
                    waited += 1;
                }
                Ok(waited)
            }
        }
    }

    async fn next_tick(&mut self) -> Result<u64, SessionError> {
        match tokio::time::timeout(self.reply_timeout, self.session.display.next_frame()).await {
            Ok(tick) => Ok(tick?),
            Err(_) => {
                self.session.stats.timeouts += 1;
                Err(SessionError::Timeout {
                    what: "display tick".to_string(),
                    after: self.reply_timeout,
                })
            }
        }
    }

    async fn await_reply(&mut self, listener: Listener, what: &str) -> Result<Message, SessionError> {
        match tokio::time::timeout(self.reply_timeout, listener.recv()).await {
            Ok(reply) => Ok(reply?),
            Err(_) => {
                self.session.stats.timeouts += 1;
                warn!("No {} within {:?}", what, self.reply_timeout);
                Err(SessionError::Timeout {
                    what: what.to_string(),
                    after: self.reply_timeout,
                })
            }
        }
    }

    fn violation(&mut self, reason: String) -> SessionError {
        self.session.stats.protocol_violations += 1;
        warn!("Protocol violation: {}", reason);
        SessionError::ProtocolViolation(reason)
    }
}
