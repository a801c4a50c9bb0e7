//! Collector service: binds the listener and serves producers until
//! stopped.

use std::net::SocketAddr;

use tokio_util::sync::CancellationToken;
use tracing::info;

use camstream_core::{CamError, Collector};

use crate::config::ServerConfig;

// ── CollectorService ─────────────────────────────────────────────

pub struct CollectorService {
    config: ServerConfig,
    stop: CancellationToken,
}

impl CollectorService {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            stop: CancellationToken::new(),
        }
    }

    /// Token that stops the service when cancelled.
    pub fn stop_handle(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Bind the collector described by the config.
    pub async fn bind(&self) -> Result<Collector, CamError> {
        let addr: SocketAddr = self
            .config
            .listen_addr()
            .map_err(|e| CamError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, e)))?;
        let mut collector = Collector::bind(addr, &self.config.storage.output_dir).await?;
        if let Some(transcoder) = self.config.transcoder() {
            info!(
                "transcoding enabled: {} -> .{}",
                self.config.transcode.program, self.config.transcode.extension
            );
            collector = collector.with_transcoder(Box::new(transcoder));
        }
        Ok(collector)
    }

    /// Bind and serve until the stop handle is cancelled.
    pub async fn run(&self) -> Result<(), CamError> {
        let collector = self.bind().await?;
        collector.run(self.stop.clone()).await
    }

    /// Signal the service to stop.
    pub fn stop(&self) {
        self.stop.cancel();
    }
}
