//! Relay configuration, loaded from TOML.

use cr_render::{SoftwareBackend, TexturePolicy};
use cr_sandbox::{SandboxConfig, SceneConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Write the final visible surface here as PNG
    pub output_png: Option<PathBuf>,
    pub surface: SurfaceConfig,
    pub host: HostConfig,
    pub scene: SceneConfig,
    pub compositor: CompositorConfig,
}

/// Visible and working surface geometry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SurfaceConfig {
    /// Visible surface width
    pub width: u32,
    /// Visible surface height
    pub height: u32,
    /// Hidden surface width, defaults to `width`
    pub working_width: Option<u32>,
    /// Hidden surface height, defaults to `height`
    pub working_height: Option<u32>,
    /// Display refresh interval
    pub refresh_interval_ms: u64,
}

impl Default for SurfaceConfig {
    fn default() -> Self {
        Self {
            width: 400,
            height: 400,
            working_width: None,
            working_height: None,
            refresh_interval_ms: 16,
        }
    }
}

impl SurfaceConfig {
    pub fn visible_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn working_size(&self) -> (u32, u32) {
        (
            self.working_width.unwrap_or(self.width),
            self.working_height.unwrap_or(self.height),
        )
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }
}

/// How the host decides a submitted frame has been presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "kebab-case")]
pub enum SettleStrategy {
    /// Wait exactly `ticks` display frames after the ack
    Fixed { ticks: u32 },
    /// Wait until the linked view has nothing pending, at most `max_ticks` frames
    Verified { max_ticks: u32 },
}

impl Default for SettleStrategy {
    fn default() -> Self {
        Self::Verified { max_ticks: 8 }
    }
}

/// Host protocol timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Bound on every awaited reply and display tick
    pub reply_timeout_ms: u64,
    /// Bound on the sandbox load signal
    pub load_timeout_ms: u64,
    pub settle: SettleStrategy,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            reply_timeout_ms: 1000,
            load_timeout_ms: 5000,
            settle: SettleStrategy::default(),
        }
    }
}

impl HostConfig {
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }
}

/// Compositor backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Software,
    Gpu,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompositorConfig {
    pub backend: BackendKind,
    pub texture_policy: TexturePolicy,
    /// Live texture budget of the software backend
    pub max_live_textures: usize,
}

impl Default for CompositorConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Software,
            texture_policy: TexturePolicy::Pooled,
            max_live_textures: 4,
        }
    }
}

impl RelayConfig {
    /// Load from TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml(&content)
    }

    /// Load from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        let (w, h) = self.surface.visible_size();
        if w == 0 || h == 0 {
            return invalid(format!("visible surface {}x{} is empty", w, h));
        }
        let (ww, wh) = self.surface.working_size();
        if ww == 0 || wh == 0 {
            return invalid(format!("working surface {}x{} is empty", ww, wh));
        }
        if self.surface.refresh_interval_ms == 0 {
            return invalid("refresh_interval_ms must be positive".to_string());
        }
        if self.host.reply_timeout_ms == 0 {
            return invalid("reply_timeout_ms must be positive".to_string());
        }
        if self.host.load_timeout_ms == 0 {
            return invalid("load_timeout_ms must be positive".to_string());
        }
        if let SettleStrategy::Verified { max_ticks: 0 } = self.host.settle {
            return invalid("verified settle needs max_ticks > 0".to_string());
        }
        // Scene parameters are checked by the sandbox when it loads.
        Ok(())
    }

    /// Sandbox settings derived from this configuration.
    pub fn sandbox_config(&self) -> SandboxConfig {
        SandboxConfig {
            scene: self.scene.clone(),
            load_timeout: self.host.load_timeout(),
        }
    }

    /// CPU compositor backend sized to the visible surface.
    pub fn software_backend(&self) -> SoftwareBackend {
        SoftwareBackend::with_texture_budget(
            self.surface.width,
            self.surface.height,
            self.compositor.max_live_textures,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_reference_scenario() {
        let config = RelayConfig::default();
        assert_eq!(config.surface.visible_size(), (400, 400));
        assert_eq!(config.surface.working_size(), (400, 400));
        assert_eq!(config.host.settle, SettleStrategy::Verified { max_ticks: 8 });
        assert_eq!(config.compositor.texture_policy, TexturePolicy::Pooled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_toml() {
        let config = RelayConfig::from_toml(
            r#"
            output_png = "frame.png"

            [surface]
            width = 800
            working_width = 400
            refresh_interval_ms = 8

            [host.settle]
            strategy = "fixed"
            ticks = 2

            [scene]
            color = 0xff0000

            [compositor]
            backend = "gpu"
            texture_policy = "per-frame"
            "#,
        )
        .unwrap();

        assert_eq!(config.output_png, Some(PathBuf::from("frame.png")));
        assert_eq!(config.surface.visible_size(), (800, 400));
        assert_eq!(config.surface.working_size(), (400, 400));
        assert_eq!(config.surface.refresh_interval(), Duration::from_millis(8));
        assert_eq!(config.host.settle, SettleStrategy::Fixed { ticks: 2 });
        assert_eq!(config.host.reply_timeout(), Duration::from_millis(1000));
        assert_eq!(config.scene.color, 0xff0000);
        assert_eq!(config.scene.scale, 300.0);
        assert_eq!(config.compositor.backend, BackendKind::Gpu);
        assert_eq!(config.compositor.texture_policy, TexturePolicy::PerFrame);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            RelayConfig::from_toml("[surface]\nwidth = \"wide\""),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            RelayConfig::from_toml_file(Path::new("/nonexistent/relay.toml")),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn test_validate_rejects() {
        let mut config = RelayConfig::default();
        config.surface.width = 0;
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.host.settle = SettleStrategy::Verified { max_ticks: 0 };
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.host.reply_timeout_ms = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
