//! camstream collector: entry point.
//!
//! ```text
//! camstream-server <port>                     Store sessions in the output directory
//! camstream-server <port> -c                  Also transcode each stored session
//! camstream-server <port> --output-dir <dir>  Store sessions under <dir>
//! camstream-server --gen-config               Write default config to stdout
//! ```

use std::path::PathBuf;
use std::sync::Mutex;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use camstream_server::config::{LoggingConfig, ServerConfig};
use camstream_server::service::CollectorService;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "camstream-server", about = "Collect streamed webcam frames into files")]
struct Cli {
    /// TCP port to listen on.
    #[arg(required_unless_present = "gen_config")]
    port: Option<u16>,

    /// Transcode each stored session after it closes.
    #[arg(short = 'c', long = "convert")]
    convert: bool,

    /// Directory receiving the stored sessions.
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Path to configuration TOML file.
    #[arg(long, default_value = "camstream-server.toml")]
    config: PathBuf,

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
        let text = toml::to_string_pretty(&ServerConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    // Load config; CLI values win.
    let mut config = ServerConfig::load(&cli.config);
    if let Some(port) = cli.port {
        config.network.port = port;
    }
    if let Some(dir) = cli.output_dir {
        config.storage.output_dir = dir;
    }
    if cli.convert {
        config.transcode.enabled = true;
    }

    init_tracing(&config.logging)?;

    info!("camstream-server v{}", env!("CARGO_PKG_VERSION"));
    info!("port: {}", config.network.port);
    info!("output dir: {}", config.storage.output_dir.display());
    info!("transcode: {}", config.transcode.enabled);

    let service = CollectorService::new(config);

    // Ctrl-C handler.
    let stop = service.stop_handle();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        stop.cancel();
    });

    if let Err(e) = service.run().await {
        error!("{e}");
        eprintln!("camstream-server: {e}");
        std::process::exit(1);
    }
    Ok(())
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
