use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::Parser;

use cast_capture::cursor::{CursorSampler, FixedCursor};
use cast_capture::frame::ScreenSize;
use cast_capture::source::TestPatternSource;
use cast_capture::stage::ViewerCount;
use cast_encode::KeyframeRequest;
use cast_input::{EnigoBackend, MouseBackend, PointerInjector, ScreenMetrics};

mod audio;
mod config;
mod control;
mod fanout;
mod pipeline;
mod registry;
mod server;

use config::ServerConfig;
use control::{ControlPlane, SharedInjector};
use registry::ClientRegistry;

/// Low-latency desktop streaming server.
///
/// Captures the primary display, encodes H.264 (JPEG fallback), mixes in
/// loopback audio and the cursor position, and streams to WebSocket
/// viewers, which send pointer events back for injection.
#[derive(Parser, Debug)]
#[command(name = "deskcast-server", version, about)]
struct Cli {
    /// Address to bind both listeners to
    #[arg(long)]
    addr: Option<String>,

    /// Primary listener port
    #[arg(long)]
    port: Option<u16>,

    /// Secondary listener port
    #[arg(long)]
    alt_port: Option<u16>,

    /// Path to configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Target frames per second
    #[arg(long)]
    fps: Option<u32>,

    /// Video bitrate in Mbps
    #[arg(long)]
    bitrate: Option<u32>,

    /// Maximum simultaneous viewers
    #[arg(long)]
    max_clients: Option<usize>,

    /// Capture/encode queue depth (3 = tight realtime, 120 = bursty networks)
    #[arg(long)]
    queue_depth: Option<usize>,

    /// Disable loopback audio
    #[arg(long)]
    no_audio: bool,

    /// Skip the H.264 chain and stream JPEG
    #[arg(long)]
    jpeg: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = resolve_config(&cli)?;

    let size = ScreenSize::new(config.capture.width, config.capture.height);
    let viewers = ViewerCount::new();
    let keyframe = KeyframeRequest::new();
    let registry = Arc::new(ClientRegistry::new(
        config.max_clients,
        viewers.clone(),
        keyframe.clone(),
    ));

    // Pointer injection; without an OS input backend the server runs
    // view-only and pointer messages are logged instead.
    let injector: Option<SharedInjector> = match EnigoBackend::new() {
        Ok(backend) => {
            tracing::info!("pointer injection active");
            Some(Arc::new(Mutex::new(PointerInjector::new(
                Box::new(backend) as Box<dyn MouseBackend>,
                ScreenMetrics {
                    width: size.width,
                    height: size.height,
                },
            ))))
        }
        Err(e) => {
            tracing::warn!(error = %e, "no input backend, running view-only");
            None
        }
    };

    let cursor: Box<dyn CursorSampler> = match &injector {
        Some(shared) => Box::new(InjectorCursor {
            injector: Arc::clone(shared),
            fallback: ((size.width / 2) as i32, (size.height / 2) as i32),
        }),
        None => Box::new(FixedCursor::centered(size)),
    };

    // The display-duplication backend is an integration point behind
    // FrameSource; the built-in source keeps the pipeline exercised
    // without one.
    let source = TestPatternSource::new(size);
    tracing::info!(width = size.width, height = size.height, "capture source ready");

    let pipeline = pipeline::Pipeline::start(
        &config,
        source,
        cursor,
        viewers,
        keyframe.clone(),
        Arc::clone(&registry),
    );

    let state = server::AppState {
        registry,
        control: Arc::new(ControlPlane::new(keyframe, injector)),
        encoder_name: pipeline.encoder_name.clone(),
    };
    let app = server::router(state);

    let primary = tokio::net::TcpListener::bind((config.bind_addr.as_str(), config.port))
        .await
        .with_context(|| format!("cannot bind {}:{}", config.bind_addr, config.port))?;
    let secondary = tokio::net::TcpListener::bind((config.bind_addr.as_str(), config.alt_port))
        .await
        .with_context(|| format!("cannot bind {}:{}", config.bind_addr, config.alt_port))?;

    tracing::info!(
        addr = %config.bind_addr,
        port = config.port,
        alt_port = config.alt_port,
        "Starting deskcast-server"
    );

    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("interrupt received, shutting down");
        let _ = stop_tx.send(true);
    });

    let stop = |mut rx: tokio::sync::watch::Receiver<bool>| async move {
        let _ = rx.changed().await;
    };

    let serve_primary =
        axum::serve(primary, app.clone()).with_graceful_shutdown(stop(stop_rx.clone()));
    let serve_secondary = axum::serve(secondary, app).with_graceful_shutdown(stop(stop_rx));

    let (a, b) = tokio::join!(
        async { serve_primary.await },
        async { serve_secondary.await }
    );
    a.context("primary listener failed")?;
    b.context("secondary listener failed")?;

    pipeline.shutdown().await;
    Ok(())
}

/// File config under CLI overrides, defaults underneath both.
fn resolve_config(cli: &Cli) -> Result<ServerConfig> {
    let mut config = match &cli.config {
        Some(path) => ServerConfig::load(path)
            .with_context(|| format!("cannot load config {}", path.display()))?,
        None => ServerConfig::default(),
    };

    if let Some(addr) = &cli.addr {
        config.bind_addr = addr.clone();
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(alt_port) = cli.alt_port {
        config.alt_port = alt_port;
    }
    if let Some(fps) = cli.fps {
        config.capture.fps = fps.clamp(1, 240);
    }
    if let Some(bitrate) = cli.bitrate {
        config.encode.bitrate_mbps = bitrate.max(1);
    }
    if let Some(max_clients) = cli.max_clients {
        config.max_clients = max_clients.max(1);
    }
    if let Some(depth) = cli.queue_depth {
        config.pipeline.queue_depth = depth.max(1);
    }
    if cli.no_audio {
        config.audio.enabled = false;
    }
    if cli.jpeg {
        config.encode.h264 = false;
    }

    Ok(config)
}

/// Cursor sampler backed by the shared pointer injector.
struct InjectorCursor {
    injector: SharedInjector,
    fallback: (i32, i32),
}

impl CursorSampler for InjectorCursor {
    fn position(&mut self) -> (i32, i32) {
        let mut injector = self
            .injector
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        injector.cursor_position().unwrap_or(self.fallback)
    }
}
