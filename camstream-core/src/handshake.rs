//! Session handshake.
//!
//! The producer writes one descriptor string as soon as it connects and
//! starts streaming right after, without waiting for an answer. The
//! collector does a single bounded read and treats everything up to the
//! first non-printable byte as the output name.
//!
//! Because nothing separates the descriptor from the first frame, that
//! read may also contain frame bytes. JPEG data starts with `0xFF`, which
//! is never printable, so the terminator is also where the stream
//! begins: the bytes from there on are handed back as `leftover` for the
//! collector to persist.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::capture::FrameTarget;
use crate::device::FrameFormat;
use crate::error::CamError;

/// Upper bound on the descriptor read.
pub const MAX_DESCRIPTOR_LEN: usize = 512;

/// Longest name the collector will use as a file name.
pub const MAX_NAME_LEN: usize = 255;

// ── StreamDescriptor ─────────────────────────────────────────────

/// Name of the artifact a capture session produces.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamDescriptor(String);

impl StreamDescriptor {
    /// Validate a descriptor the producer is about to send.
    pub fn new(name: impl Into<String>) -> Result<Self, CamError> {
        let name = name.into();
        if name.len() > MAX_DESCRIPTOR_LEN {
            return Err(CamError::SessionRead(format!(
                "descriptor is {} bytes (max {MAX_DESCRIPTOR_LEN})",
                name.len()
            )));
        }
        if let Some(pos) = name.bytes().position(|b| !is_printable(b)) {
            return Err(CamError::SessionRead(format!(
                "descriptor has a non-printable byte at {pos}"
            )));
        }
        Self::checked(name)
    }

    /// `<prefix>_<width>_<height>_<frames>.mjpeg`, e.g. `Webcam_640_480_3.mjpeg`.
    pub fn for_capture(prefix: &str, format: &FrameFormat, target: FrameTarget) -> Result<Self, CamError> {
        Self::new(format!(
            "{prefix}_{}_{}_{target}.mjpeg",
            format.width, format.height
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Reject names that are empty or would not stay a plain file name.
    fn checked(name: String) -> Result<Self, CamError> {
        if name.is_empty() {
            return Err(CamError::SessionRead("empty descriptor".into()));
        }
        if name == "." || name == ".." || name.contains(['/', '\\']) {
            return Err(CamError::SessionRead(format!(
                "descriptor {name:?} is not a plain file name"
            )));
        }
        Ok(Self(name))
    }
}

impl std::fmt::Display for StreamDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// `isprint` in the C locale.
fn is_printable(b: u8) -> bool {
    (0x20..=0x7E).contains(&b)
}

/// Length of the printable prefix of `raw`.
pub fn sanitized_len(raw: &[u8]) -> usize {
    raw.iter().position(|&b| !is_printable(b)).unwrap_or(raw.len())
}

// ── Wire ─────────────────────────────────────────────────────────

/// Write the descriptor in one shot. No acknowledgement is expected.
pub async fn send_descriptor<W>(writer: &mut W, descriptor: &StreamDescriptor) -> Result<(), CamError>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(descriptor.as_bytes())
        .await
        .map_err(CamError::StreamSend)
}

/// A descriptor as read by the collector.
#[derive(Debug)]
pub struct ReceivedDescriptor {
    pub descriptor: StreamDescriptor,
    /// Stream bytes that arrived in the same read as the descriptor.
    pub leftover: Bytes,
}

/// Read and sanitize the descriptor with a single bounded read.
///
/// Names longer than [`MAX_NAME_LEN`] are cut to that length.
pub async fn read_descriptor<R>(reader: &mut R) -> Result<ReceivedDescriptor, CamError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::zeroed(MAX_DESCRIPTOR_LEN);
    let n = reader
        .read(&mut buf)
        .await
        .map_err(|e| CamError::SessionRead(format!("read failed: {e}")))?;
    if n == 0 {
        return Err(CamError::SessionRead(
            "connection closed before a descriptor was sent".into(),
        ));
    }
    buf.truncate(n);

    let end = sanitized_len(&buf);
    let leftover = buf.split_off(end).freeze();
    buf.truncate(end.min(MAX_NAME_LEN));

    // Printable ASCII is always valid UTF-8.
    let name = String::from_utf8_lossy(&buf).into_owned();
    let descriptor = StreamDescriptor::checked(name)?;
    Ok(ReceivedDescriptor {
        descriptor,
        leftover,
    })
}
