//! Consumer side: accept a producer, store its stream, count frames.
//!
//! ```text
//!   accept ──► read descriptor ──► create <output_dir>/<name>
//!                                         │
//!              ┌──── recv 4096 ◄──────────┘
//!              │        │ n > 0: append + count markers
//!              │        ▼
//!              └────────┘ n == 0 / error: close sink ──► [transcode] ──► accept
//! ```
//!
//! Sessions are served one at a time. A session that fails ends on its
//! own; the accept loop keeps going.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::CamError;
use crate::handshake::read_descriptor;
use crate::transcode::Transcoder;

/// Size of a single receive.
pub const TRANSFER_BUFFER_LEN: usize = 4096;

/// Pending connections the kernel may hold while a session is served.
pub const LISTEN_BACKLOG: u32 = 2;

const SOI: [u8; 2] = [0xFF, 0xD8];

// ── MarkerCounter ────────────────────────────────────────────────

/// Counts JPEG start-of-image markers in a byte stream delivered in
/// arbitrary chunks.
///
/// This is a heuristic. A `FF D8` pair inside entropy-coded data is
/// counted too, and nothing resynchronizes after loss.
#[derive(Debug, Default, Clone)]
pub struct MarkerCounter {
    last: Option<u8>,
    count: u64,
}

impl MarkerCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan `chunk`, returning the markers it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> u64 {
        let mut found = 0;
        let mut prev = self.last;
        for &byte in chunk {
            if prev == Some(SOI[0]) && byte == SOI[1] {
                found += 1;
            }
            prev = Some(byte);
        }
        self.last = prev;
        self.count += found;
        found
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

// ── SessionReport ────────────────────────────────────────────────

/// Outcome of one collector session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub peer: SocketAddr,
    pub name: String,
    pub path: PathBuf,
    pub bytes: u64,
    pub frames: u64,
    /// Artifact produced by the transcoder, if one ran.
    pub transcoded: Option<PathBuf>,
}

// ── Collector ────────────────────────────────────────────────────

pub struct Collector {
    listener: TcpListener,
    output_dir: PathBuf,
    transcoder: Option<Box<dyn Transcoder>>,
}

impl Collector {
    /// Listen on `addr` and store sessions under `output_dir`, which is
    /// created if missing.
    pub async fn bind(addr: SocketAddr, output_dir: impl Into<PathBuf>) -> Result<Self, CamError> {
        let output_dir = output_dir.into();
        tokio::fs::create_dir_all(&output_dir)
            .await
            .map_err(|source| CamError::SinkWrite {
                path: output_dir.clone(),
                source,
            })?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(LISTEN_BACKLOG)?;
        info!(
            "collector listening on {} (storing to {})",
            listener.local_addr()?,
            output_dir.display()
        );

        Ok(Self {
            listener,
            output_dir,
            transcoder: None,
        })
    }

    /// Run `transcoder` on every stored file.
    pub fn with_transcoder(mut self, transcoder: Box<dyn Transcoder>) -> Self {
        self.transcoder = Some(transcoder);
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, CamError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Serve sessions until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), CamError> {
        loop {
            let accepted = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("accept error: {e}");
                    continue;
                }
            };

            match self.serve(stream, peer, &cancel).await {
                Ok(report) => info!(
                    "session from {peer} stored {} ({} bytes, {} frames)",
                    report.path.display(),
                    report.bytes,
                    report.frames
                ),
                Err(e) => warn!("session from {peer} failed: {e}"),
            }
        }

        info!("collector stopped");
        Ok(())
    }

    /// Accept and serve exactly one session.
    pub async fn accept_one(&self) -> Result<SessionReport, CamError> {
        let (stream, peer) = self.listener.accept().await?;
        self.serve(stream, peer, &CancellationToken::new()).await
    }

    /// Store everything `stream` delivers until it closes.
    pub async fn serve<S>(
        &self,
        mut stream: S,
        peer: SocketAddr,
        cancel: &CancellationToken,
    ) -> Result<SessionReport, CamError>
    where
        S: AsyncRead + Unpin,
    {
        info!("producer connected from {peer}");
        let received = read_descriptor(&mut stream).await?;
        let name = received.descriptor.as_str().to_string();
        let path = self.output_dir.join(&name);
        let sink_err = |source: std::io::Error| CamError::SinkWrite {
            path: path.clone(),
            source,
        };

        let mut file = File::create(&path).await.map_err(sink_err)?;
        debug!("descriptor {name:?} -> {}", path.display());

        let mut counter = MarkerCounter::new();
        let mut bytes = 0u64;
        if !received.leftover.is_empty() {
            file.write_all(&received.leftover).await.map_err(sink_err)?;
            counter.feed(&received.leftover);
            bytes += received.leftover.len() as u64;
        }

        let mut buf = vec![0u8; TRANSFER_BUFFER_LEN];
        loop {
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("session from {peer} interrupted");
                    break;
                }
                read = stream.read(&mut buf) => read,
            };
            let n = match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    warn!("receive from {peer} failed: {e}; closing session");
                    break;
                }
            };
            file.write_all(&buf[..n]).await.map_err(sink_err)?;
            let found = counter.feed(&buf[..n]);
            bytes += n as u64;
            if found > 0 {
                debug!("{} frame(s) received so far", counter.count());
            }
        }

        file.flush().await.map_err(sink_err)?;
        drop(file);
        info!(
            "session {name:?} closed: {bytes} bytes, {} frame(s)",
            counter.count()
        );

        let transcoded = match &self.transcoder {
            Some(transcoder) => Some(transcoder.convert(&path).await?),
            None => None,
        };

        Ok(SessionReport {
            peer,
            name,
            path,
            bytes,
            frames: counter.count(),
            transcoded,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    async fn collector(dir: &Path) -> Collector {
        Collector::bind("127.0.0.1:0".parse().unwrap(), dir).await.unwrap()
    }

    #[test]
    fn counts_markers_in_one_chunk() {
        let mut c = MarkerCounter::new();
        assert_eq!(c.feed(b"\xFF\xD8abc\xFF\xD9\xFF\xD8"), 2);
        assert_eq!(c.count(), 2);
    }

    #[test]
    fn marker_split_across_chunks() {
        let mut c = MarkerCounter::new();
        assert_eq!(c.feed(b"abc\xFF"), 0);
        assert_eq!(c.feed(b"\xD8def"), 1);
        assert_eq!(c.count(), 1);
    }

    #[test]
    fn empty_chunk_keeps_lookback() {
        let mut c = MarkerCounter::new();
        c.feed(b"\xFF");
        c.feed(b"");
        c.feed(b"\xD8");
        assert_eq!(c.count(), 1);
    }

    #[test]
    fn lone_bytes_do_not_count() {
        let mut c = MarkerCounter::new();
        c.feed(b"\xD8\xFF\xFF\xD9\xD8");
        assert_eq!(c.count(), 0);
    }

    #[tokio::test]
    async fn serve_stores_stream_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let collector = collector(dir.path()).await;

        let input: &[u8] = b"cam_8_8_2.mjpeg\xFF\xD8one\xFF\xD9\xFF\xD8two\xFF\xD9";
        let report = collector
            .serve(input, peer(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.name, "cam_8_8_2.mjpeg");
        assert_eq!(report.frames, 2);
        assert_eq!(report.bytes, 14);
        assert!(report.transcoded.is_none());
        let stored = std::fs::read(dir.path().join("cam_8_8_2.mjpeg")).unwrap();
        assert_eq!(stored, b"\xFF\xD8one\xFF\xD9\xFF\xD8two\xFF\xD9");
    }

    #[tokio::test]
    async fn existing_file_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("x.mjpeg"), vec![0u8; 100]).unwrap();
        let collector = collector(dir.path()).await;

        let input: &[u8] = b"x.mjpeg";
        collector
            .serve(input, peer(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(std::fs::read(dir.path().join("x.mjpeg")).unwrap().is_empty());
    }

    #[tokio::test]
    async fn receive_error_ends_session_normally() {
        let dir = tempfile::tempdir().unwrap();
        let collector = collector(dir.path()).await;

        let stream = tokio_test::io::Builder::new()
            .read(b"r.mjpeg")
            .read(b"\xFF\xD8ab")
            .read_error(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"))
            .build();
        let report = collector
            .serve(stream, peer(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.bytes, 4);
        assert_eq!(report.frames, 1);
    }

    #[tokio::test]
    async fn missing_descriptor_is_session_error() {
        let dir = tempfile::tempdir().unwrap();
        let collector = collector(dir.path()).await;

        let input: &[u8] = b"";
        let err = collector
            .serve(input, peer(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CamError::SessionRead(_)));
    }

    #[tokio::test]
    async fn bind_creates_output_dir() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        let collector = collector(&nested).await;
        assert!(nested.is_dir());
        assert_eq!(collector.output_dir(), nested.as_path());
        assert_ne!(collector.local_addr().unwrap().port(), 0);
    }
}
