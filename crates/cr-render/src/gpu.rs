//! Headless GPU context.
//!
//! The compositor never presents to a window: the visible surface is an
//! offscreen render target, so no surface is requested from the adapter.

use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use wgpu::{Adapter, Device, Instance, Queue};

/// GPU context errors
#[derive(Debug, Error)]
pub enum GpuError {
    #[error("No suitable GPU adapter found")]
    NoAdapter,

    #[error("Failed to create device: {0}")]
    DeviceCreation(String),
}

/// Adapter and device preferences
#[derive(Debug, Clone)]
pub struct GpuConfig {
    /// Prefer an integrated GPU over a discrete one
    pub low_power: bool,
    /// Upper bound for texture edges; clamped to what the adapter supports
    pub max_texture_dimension: u32,
    /// Fall back to a software adapter when no hardware one is found
    pub allow_fallback_adapter: bool,
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            low_power: true,
            max_texture_dimension: 8192,
            allow_fallback_adapter: false,
        }
    }
}

/// Device and queue shared by the GPU compositor backend.
pub struct GpuContext {
    pub adapter: Adapter,
    pub device: Arc<Device>,
    pub queue: Arc<Queue>,
    pub config: GpuConfig,
}

impl GpuContext {
    pub async fn new(config: GpuConfig) -> Result<Self, GpuError> {
        let instance = Instance::new(&wgpu::InstanceDescriptor::default());
        let adapter = Self::pick_adapter(&instance, &config).await?;

        let info = adapter.get_info();
        info!("Compositing on {} ({:?}, {:?})", info.name, info.backend, info.device_type);
        debug!("Driver: {} {}", info.driver, info.driver_info);

        let supported = adapter.limits();
        let required_limits = wgpu::Limits {
            max_texture_dimension_2d: config
                .max_texture_dimension
                .min(supported.max_texture_dimension_2d),
            ..wgpu::Limits::downlevel_webgl2_defaults().using_resolution(supported)
        };

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("Canvas Relay Compositor"),
                    required_features: wgpu::Features::empty(),
                    required_limits,
                    memory_hints: wgpu::MemoryHints::MemoryUsage,
                },
                None,
            )
            .await
            .map_err(|e| GpuError::DeviceCreation(e.to_string()))?;

        // Errors outside an explicit error scope would otherwise panic.
        device.on_uncaptured_error(Box::new(|error| {
            warn!("Uncaptured wgpu error: {}", error);
        }));

        Ok(Self {
            adapter,
            device: Arc::new(device),
            queue: Arc::new(queue),
            config,
        })
    }

    pub async fn with_defaults() -> Result<Self, GpuError> {
        Self::new(GpuConfig::default()).await
    }

    /// Largest texture edge the device accepts.
    pub fn max_texture_dimension(&self) -> u32 {
        self.device.limits().max_texture_dimension_2d
    }

    async fn pick_adapter(instance: &Instance, config: &GpuConfig) -> Result<Adapter, GpuError> {
        let power_preference = if config.low_power {
            wgpu::PowerPreference::LowPower
        } else {
            wgpu::PowerPreference::HighPerformance
        };
        let request = |force_fallback_adapter| wgpu::RequestAdapterOptions {
            power_preference,
            compatible_surface: None,
            force_fallback_adapter,
        };

        if let Some(adapter) = instance.request_adapter(&request(false)).await {
            return Ok(adapter);
        }
        if !config.allow_fallback_adapter {
            return Err(GpuError::NoAdapter);
        }
        warn!("No hardware adapter, trying the fallback adapter");
        instance
            .request_adapter(&request(true))
            .await
            .ok_or(GpuError::NoAdapter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_prefers_hardware() {
        let config = GpuConfig::default();
        assert!(config.low_power);
        assert!(!config.allow_fallback_adapter);
    }

    #[test]
    #[ignore = "requires GPU"]
    fn test_context_limits_are_clamped() {
        let config = GpuConfig {
            max_texture_dimension: 1024,
            ..GpuConfig::default()
        };
        let gpu = pollster::block_on(GpuContext::new(config)).unwrap();
        assert!(gpu.max_texture_dimension() <= 1024);
    }
}
