//! camstream producer: entry point.
//!
//! ```text
//! camstream-client <port> <frames>               Stream <frames> frames (-1 = until Ctrl-C)
//! camstream-client <port> <frames> --host <h>    Collector host (default from config)
//! camstream-client <port> <frames> --synthetic   Use the in-memory camera
//! camstream-client <port> <frames> --preview     Decode every frame locally as well
//! camstream-client --gen-config                  Write default config to stdout
//! ```

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use camstream_client::config::{ClientConfig, LoggingConfig};
use camstream_client::session::run_session;
use camstream_core::capture::FrameTarget;
use camstream_core::{FrameSink, JpegPreview, SyntheticDevice, TraceRenderer, V4l2Device};

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "camstream-client", about = "Stream webcam frames to a camstream collector")]
struct Cli {
    /// Collector TCP port.
    #[arg(required_unless_present = "gen_config")]
    port: Option<u16>,

    /// Frames to capture; -1 streams until interrupted.
    #[arg(required_unless_present = "gen_config", allow_hyphen_values = true)]
    frame_count: Option<FrameTarget>,

    /// Collector host.
    #[arg(long)]
    host: Option<String>,

    /// Capture device node.
    #[arg(short, long)]
    device: Option<String>,

    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "camstream-client.toml")]
    config: PathBuf,

    /// Capture from the in-memory synthetic camera.
    #[arg(long)]
    synthetic: bool,

    /// Decode each frame as it is sent.
    #[arg(long)]
    preview: bool,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        let text = toml::to_string_pretty(&ClientConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    // Load config; CLI values win.
    let mut config = ClientConfig::load(&cli.config);
    if let Some(port) = cli.port {
        config.network.port = port;
    }
    if let Some(host) = cli.host {
        config.network.host = host;
    }
    if let Some(device) = cli.device {
        config.device.path = device;
    }
    let target = cli.frame_count.unwrap_or(FrameTarget::Finite(0));

    init_tracing(&config.logging)?;

    info!("camstream-client v{}", env!("CARGO_PKG_VERSION"));
    info!("collector: {}", config.collector_addr());
    info!("frames: {target}");

    let options = match config.to_session_options(target) {
        Ok(options) => options,
        Err(e) => fail(e),
    };

    // Ctrl-C handler.
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Ctrl-C received, stopping capture");
            cancel.cancel();
        }
    });

    let preview: Option<Box<dyn FrameSink>> = cli
        .preview
        .then(|| Box::new(JpegPreview::new(TraceRenderer::default())) as Box<dyn FrameSink>);

    let result = if cli.synthetic {
        info!("device: synthetic");
        let device = SyntheticDevice::new()
            .with_payload_len(config.capture.synthetic_payload_len)
            .with_frame_interval(Duration::from_millis(config.capture.synthetic_interval_ms));
        run_session(device, &options, preview, cancel).await
    } else {
        info!("device: {}", config.device.path);
        match V4l2Device::open(&config.device.path) {
            Ok(device) => run_session(device, &options, preview, cancel).await,
            Err(e) => Err(e),
        }
    };

    if let Err(e) = result {
        fail(e);
    }
    Ok(())
}

/// One-line diagnostic and nonzero exit.
fn fail(e: impl std::fmt::Display) -> ! {
    error!("{e}");
    eprintln!("camstream-client: {e}");
    std::process::exit(1);
}

fn init_tracing(logging: &LoggingConfig) -> std::io::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.file.is_empty() {
        builder.init();
    } else {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&logging.file)?;
        builder.with_ansi(false).with_writer(Mutex::new(file)).init();
    }
    Ok(())
}
