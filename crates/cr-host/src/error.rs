use crate::config::ConfigError;
use cr_channel::ChannelError;
use cr_render::CompositorError;
use cr_sandbox::SandboxError;
use cr_surface::SurfaceError;
use std::time::Duration;
use thiserror::Error;

/// Session errors
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Transfer failed: {0}")]
    TransferFailure(String),

    #[error("Resource exhaustion: {0}")]
    ResourceExhaustion(String),

    #[error("Timed out waiting for {what} after {after:?}")]
    Timeout { what: String, after: Duration },

    #[error("Sandbox disconnected")]
    Disconnected,

    #[error("Compositor error: {0}")]
    Compositor(CompositorError),

    #[error("Surface error: {0}")]
    Surface(SurfaceError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl SessionError {
    /// Whether the session stays usable after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ProtocolViolation(_) | Self::Timeout { .. } | Self::ResourceExhaustion(_)
        )
    }
}

impl From<ChannelError> for SessionError {
    fn from(e: ChannelError) -> Self {
        match e {
            ChannelError::Disconnected => Self::Disconnected,
            other => Self::ProtocolViolation(other.to_string()),
        }
    }
}

impl From<CompositorError> for SessionError {
    fn from(e: CompositorError) -> Self {
        match e {
            CompositorError::ResourceExhaustion(reason) => Self::ResourceExhaustion(reason),
            other => Self::Compositor(other),
        }
    }
}

impl From<SandboxError> for SessionError {
    fn from(e: SandboxError) -> Self {
        Self::TransferFailure(e.to_string())
    }
}

impl From<SurfaceError> for SessionError {
    fn from(e: SurfaceError) -> Self {
        match e {
            SurfaceError::AlreadyTransferred | SurfaceError::Detached => {
                Self::ProtocolViolation(e.to_string())
            }
            other => Self::Surface(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_mapping() {
        assert!(matches!(
            SessionError::from(ChannelError::Disconnected),
            SessionError::Disconnected
        ));
        assert!(matches!(
            SessionError::from(CompositorError::ResourceExhaustion("budget".into())),
            SessionError::ResourceExhaustion(_)
        ));
        assert!(matches!(
            SessionError::from(SandboxError::Load("bad scene".into())),
            SessionError::TransferFailure(_)
        ));
        assert!(matches!(
            SessionError::from(SurfaceError::AlreadyTransferred),
            SessionError::ProtocolViolation(_)
        ));
    }

    #[test]
    fn test_recoverable_kinds() {
        assert!(SessionError::ProtocolViolation("x".into()).is_recoverable());
        assert!(SessionError::ResourceExhaustion("x".into()).is_recoverable());
        assert!(SessionError::Timeout {
            what: "render-ack".into(),
            after: Duration::from_millis(1)
        }
        .is_recoverable());
        assert!(!SessionError::Disconnected.is_recoverable());
        assert!(!SessionError::TransferFailure("x".into()).is_recoverable());
    }
}
