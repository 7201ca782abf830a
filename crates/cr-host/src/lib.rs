//! Canvas Relay Host
//!
//! The host side of a relay session: bootstraps the surfaces, embeds the
//! sandbox, performs the one-time handshake, and drives render cycles whose
//! output is pulled from the linked view through the compositor.

mod config;
mod controller;
mod error;
mod session;

pub use config::{
    BackendKind, CompositorConfig, ConfigError, HostConfig, RelayConfig, SettleStrategy,
    SurfaceConfig,
};
pub use controller::HostController;
pub use error::SessionError;
pub use session::{FrameReport, ProtocolState, SessionStats};
