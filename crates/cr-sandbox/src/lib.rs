//! Canvas Relay Sandbox
//!
//! The isolated render context:
//! - A render proxy that owns the transferred surface and draws on request
//! - A dedicated worker thread with panic isolation and its own event loop

mod proxy;
mod worker;

pub use proxy::{ProxyError, ProxySession, ProxyState, SceneConfig, Turn};
pub use worker::{embed_sandbox, SandboxConfig, SandboxError, SandboxHandle, SandboxId};
