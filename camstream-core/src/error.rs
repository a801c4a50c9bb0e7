//! Error types for the camstream pipeline.
//!
//! Every fallible operation returns `Result<T, CamError>`. Each variant
//! names the step that failed and carries the platform error text, so a
//! one-line `Display` is enough for the user-facing diagnostic.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::pool::BufferState;

/// The canonical error type for camstream.
#[derive(Debug, Error)]
pub enum CamError {
    // ── Device initialisation ────────────────────────────────────
    /// A capability, format or buffer negotiation call failed.
    #[error("{step} failed: {source}")]
    DeviceInit {
        step: &'static str,
        #[source]
        source: io::Error,
    },

    /// The device lacks a capability the capture path depends on.
    #[error("unsupported device: {0}")]
    Unsupported(String),

    /// The driver granted fewer buffers than the pool can work with.
    #[error("insufficient buffer memory: device granted {granted} buffers, need at least {minimum}")]
    DeviceBuffer { granted: u32, minimum: u32 },

    /// Mapping a device buffer into the process failed.
    #[error("mmap of buffer {index} failed: {source}")]
    MemoryMap {
        index: u32,
        #[source]
        source: io::Error,
    },

    // ── Capture ──────────────────────────────────────────────────
    /// The readiness wait failed for a reason other than a timeout.
    #[error("device wait failed: {0}")]
    DeviceWait(#[source] io::Error),

    /// A queue / dequeue / stream on-off request was rejected.
    #[error("{step} failed: {source}")]
    DeviceIo {
        step: &'static str,
        #[source]
        source: io::Error,
    },

    /// A buffer was asked to make a transition its ownership state forbids.
    #[error("buffer {index}: illegal transition {from:?} -> {to:?}")]
    BufferState {
        index: u32,
        from: BufferState,
        to: BufferState,
    },

    /// The device reported a buffer index the pool never allocated.
    #[error("device returned unknown buffer index {0}")]
    UnknownBuffer(u32),

    // ── Network ──────────────────────────────────────────────────
    /// Connecting to the collector failed.
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Writing frame or descriptor bytes to the socket failed.
    #[error("frame send failed: {0}")]
    StreamSend(#[source] io::Error),

    /// The session descriptor was missing, empty or unusable.
    #[error("session descriptor rejected: {0}")]
    SessionRead(String),

    // ── Storage / post-processing ────────────────────────────────
    /// Creating or appending to the output file failed.
    #[error("write to {} failed: {source}", path.display())]
    SinkWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The external transcoder could not be launched or exited nonzero.
    #[error("transcode failed: {0}")]
    TranscodeInvocation(String),

    /// The debug preview could not decode a frame.
    #[error("frame decode failed: {0}")]
    Decode(String),

    /// Any other I/O error (listener setup, socket options).
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl CamError {
    /// Whether this error belongs to the device initialisation family.
    ///
    /// These are raised before any frame is streamed.
    pub fn is_device_init(&self) -> bool {
        matches!(
            self,
            CamError::DeviceInit { .. } | CamError::Unsupported(_) | CamError::DeviceBuffer { .. }
        )
    }

    pub(crate) fn init(step: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| CamError::DeviceInit { step, source }
    }

    pub(crate) fn device_io(step: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| CamError::DeviceIo { step, source }
    }
}

impl From<image::ImageError> for CamError {
    fn from(e: image::ImageError) -> Self {
        CamError::Decode(e.to_string())
    }
}
