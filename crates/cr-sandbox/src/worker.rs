//! Sandbox worker thread with panic isolation.
//!
//! The sandbox is an isolated context: its own thread, its own event loop,
//! reachable only through its [`SandboxPort`]. Handlers run inside a
//! panic boundary so a faulty frame cannot take the loop down.

use crate::proxy::{ProxyError, ProxySession, SceneConfig, Turn};
use cr_channel::{ChannelError, Message, SandboxPort};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Global sandbox ID counter
static NEXT_SANDBOX_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SandboxId(pub u64);

impl SandboxId {
    fn next() -> Self {
        Self(NEXT_SANDBOX_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sandbox({})", self.0)
    }
}

/// Sandbox errors
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Failed to spawn sandbox thread: {0}")]
    Spawn(String),

    #[error("Sandbox failed to load: {0}")]
    Load(String),

    #[error("Sandbox did not load within {0:?}")]
    LoadTimeout(Duration),
}

/// Configuration for the embedded sandbox.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// What the proxy draws
    pub scene: SceneConfig,
    /// How long to wait for the load signal
    pub load_timeout: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            scene: SceneConfig::default(),
            load_timeout: Duration::from_secs(5),
        }
    }
}

/// Handle to a running sandbox.
///
/// The sandbox stops on its own once the host side of its channel is
/// dropped; dropping the handle only detaches from the thread.
pub struct SandboxHandle {
    id: SandboxId,
    thread: Option<thread::JoinHandle<()>>,
}

impl SandboxHandle {
    pub fn id(&self) -> SandboxId {
        self.id
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for SandboxHandle {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.is_finished() {
                let _ = thread.join();
            } else {
                debug!("Detaching from {} (still running)", self.id);
            }
        }
    }
}

/// Embed a sandbox on its own thread and wait until it has loaded.
pub async fn embed_sandbox(
    port: SandboxPort,
    config: SandboxConfig,
) -> Result<SandboxHandle, SandboxError> {
    let id = SandboxId::next();
    let (loaded_tx, loaded_rx) = oneshot::channel::<Result<(), String>>();
    let SandboxConfig { scene, load_timeout } = config;

    let thread = thread::Builder::new()
        .name(format!("sandbox-{}", id.0))
        .spawn(move || {
            info!("{} started", id);
            if let Err(reason) = scene.validate() {
                let _ = loaded_tx.send(Err(reason));
                return;
            }
            let session = ProxySession::new(scene);
            let _ = loaded_tx.send(Ok(()));
            run_event_loop(id, &port, session);
            info!("{} stopped", id);
        })
        .map_err(|e| SandboxError::Spawn(e.to_string()))?;

    let handle = SandboxHandle {
        id,
        thread: Some(thread),
    };

    match tokio::time::timeout(load_timeout, loaded_rx).await {
        Ok(Ok(Ok(()))) => {
            debug!("{} loaded", id);
            Ok(handle)
        }
        Ok(Ok(Err(reason))) => Err(SandboxError::Load(reason)),
        Ok(Err(_)) => Err(SandboxError::Load("sandbox exited before loading".to_string())),
        Err(_) => Err(SandboxError::LoadTimeout(load_timeout)),
    }
}

/// The sandbox event loop: one message per turn.
fn run_event_loop(id: SandboxId, port: &SandboxPort, mut session: ProxySession) {
    loop {
        let message = match port.recv() {
            Ok(Some(message)) => message,
            Ok(None) => {
                debug!("{} ignoring unknown command", id);
                continue;
            }
            Err(ChannelError::Disconnected) => {
                debug!("{} channel closed, shutting down", id);
                break;
            }
            Err(e) => {
                warn!("{} dropping message: {}", id, e);
                continue;
            }
        };

        let command = message.command();
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            process_message(&mut session, message)
        }));

        match result {
            Ok(Ok(turn)) => {
                if flush(port, turn).is_err() {
                    debug!("{} host gone while replying", id);
                    break;
                }
            }
            Ok(Err(e)) => {
                warn!("{} rejected {}: {}", id, command, e);
            }
            Err(panic_info) => {
                let error_msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_info.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic".to_string()
                };
                error!("{} panicked handling {}: {}", id, command, error_msg);
            }
        }
    }
}

/// Run the handler, then end its turn by submitting the drawing.
fn process_message(session: &mut ProxySession, message: Message) -> Result<Turn, ProxyError> {
    let turn = session.handle(message)?;
    session.end_turn(&turn)?;
    Ok(turn)
}

/// Replies go out only after the turn's drawing has been submitted.
fn flush(port: &SandboxPort, turn: Turn) -> Result<(), ChannelError> {
    for reply in turn.replies {
        port.send(reply)?;
    }
    Ok(())
}
