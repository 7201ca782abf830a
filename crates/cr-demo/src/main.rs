//! Canvas Relay: sandboxed offscreen rendering demo
//!
//! Main entry point. Initializes the global allocator, sets up logging,
//! loads the configuration and runs one relay session. Each line read from
//! stdin is a frame time; end of input ends the session.

use anyhow::{Context, Result};
use cr_channel::FrameTime;
use cr_host::{BackendKind, HostController, RelayConfig};
use cr_render::{CompositorBackend, GpuConfig, GpuContext, WgpuBackend};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const CONFIG_ENV: &str = "CANVAS_RELAY_CONFIG";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();

    info!("Canvas Relay starting...");

    let config = load_config()?;
    config.validate().context("invalid configuration")?;

    match config.compositor.backend {
        BackendKind::Gpu => match gpu_backend(&config).await {
            Ok(backend) => run_session(&config, backend).await?,
            Err(e) => {
                warn!("GPU compositor unavailable ({:#}), using software", e);
                run_session(&config, config.software_backend()).await?;
            }
        },
        BackendKind::Software => run_session(&config, config.software_backend()).await?,
    }

    info!("Canvas Relay shutting down");
    Ok(())
}

fn load_config() -> Result<RelayConfig> {
    let path = std::env::args_os()
        .nth(1)
        .or_else(|| std::env::var_os(CONFIG_ENV))
        .map(PathBuf::from);

    match path {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            RelayConfig::from_toml_file(&path)
                .with_context(|| format!("failed to load {}", path.display()))
        }
        None => {
            info!("No configuration given, using defaults");
            Ok(RelayConfig::default())
        }
    }
}

async fn gpu_backend(config: &RelayConfig) -> Result<WgpuBackend> {
    let gpu = GpuContext::new(GpuConfig {
        allow_fallback_adapter: true,
        ..GpuConfig::default()
    })
    .await?;
    let backend = WgpuBackend::new(&gpu, config.surface.width, config.surface.height)?;
    Ok(backend)
}

async fn run_session<B: CompositorBackend>(config: &RelayConfig, backend: B) -> Result<()> {
    let mut controller = HostController::launch(config, backend)
        .await
        .context("failed to start session")?;
    if let Some(id) = controller.sandbox_id() {
        info!("Session attached to {}", id);
    }
    controller.handshake().await.context("handshake failed")?;

    // Initial frame
    match controller.render(0.0).await {
        Ok(report) => info!("Initial frame {} composited", report.seq),
        Err(e) if e.is_recoverable() => warn!("Initial frame dropped: {}", e),
        Err(e) => return Err(e).context("initial render failed"),
    }

    let (tx, rx) = mpsc::channel(16);
    let reader = tokio::spawn(read_inputs(tx));
    controller.run(rx).await.context("session ended")?;
    let _ = reader.await;

    if let Some(path) = &config.output_png {
        save_png(&mut controller, path)?;
    }

    let stats = controller.stats();
    info!(
        "Frames: {} rendered, {} skipped, {} coalesced; {} violations, {} timeouts",
        stats.frames_rendered,
        stats.frames_skipped,
        stats.inputs_coalesced,
        stats.protocol_violations,
        stats.timeouts
    );
    Ok(())
}

/// One frame time per stdin line.
async fn read_inputs(tx: mpsc::Sender<FrameTime>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line.parse::<FrameTime>() {
            Ok(time) => {
                if tx.send(time).await.is_err() {
                    break;
                }
            }
            Err(_) => warn!("Ignoring input {:?}: not a number", line),
        }
    }
}

fn save_png<B: CompositorBackend>(controller: &mut HostController<B>, path: &Path) -> Result<()> {
    let pixels = controller.visible_pixels()?;
    image::save_buffer(
        path,
        pixels.as_bytes(),
        pixels.width(),
        pixels.height(),
        image::ExtendedColorType::Rgba8,
    )
    .with_context(|| format!("failed to write {}", path.display()))?;
    info!("Wrote visible surface to {}", path.display());
    Ok(())
}
