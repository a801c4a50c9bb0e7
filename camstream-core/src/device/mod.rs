//! Capture device abstraction.
//!
//! The buffer pool drives a device exclusively through [`CaptureDevice`]:
//! capability query, format negotiation, buffer request / map, queue /
//! dequeue, stream on / off and a bounded readiness wait. Two
//! implementations ship with the crate:
//!
//! | Type              | Backend                                        |
//! |-------------------|------------------------------------------------|
//! | [`V4l2Device`]    | Video4Linux2 memory-mapped streaming I/O       |
//! | [`SyntheticDevice`] | In-memory device emitting JPEG-shaped frames |

use std::fmt;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::error::CamError;

pub mod synthetic;
pub mod v4l2;

pub use synthetic::{DeviceEvent, DeviceProbe, SyntheticDevice, WaitStep};
pub use v4l2::V4l2Device;

// ── FrameFormat ──────────────────────────────────────────────────

/// Frame geometry and pixel encoding negotiated with the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFormat {
    pub width: u32,
    pub height: u32,
    /// Four-character pixel encoding code, e.g. `MJPG`.
    pub fourcc: [u8; 4],
}

impl FrameFormat {
    /// Motion-JPEG at the given geometry.
    pub const fn mjpeg(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            fourcc: *b"MJPG",
        }
    }

    pub fn fourcc_str(&self) -> &str {
        std::str::from_utf8(&self.fourcc).unwrap_or("????")
    }
}

impl fmt::Display for FrameFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{} {}", self.width, self.height, self.fourcc_str())
    }
}

// ── Capabilities ─────────────────────────────────────────────────

/// The subset of device capabilities the capture path cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub driver: String,
    pub card: String,
    /// Single-planar video capture.
    pub video_capture: bool,
    /// Streaming (memory-mapped) I/O.
    pub streaming: bool,
}

// ── Readiness / Dequeued ─────────────────────────────────────────

/// Outcome of a bounded readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// At least one buffer may be ready to dequeue.
    Ready,
    /// The bound elapsed with nothing ready.
    TimedOut,
}

/// A buffer the device has handed back with captured data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dequeued {
    pub index: u32,
    /// Valid bytes in the buffer (`bytesused`).
    pub bytes_used: usize,
}

// ── Traits ───────────────────────────────────────────────────────

/// Device memory mapped into the process. Unmapped on drop.
pub trait MappedRegion: Send {
    /// The full mapped range.
    fn as_slice(&self) -> &[u8];

    fn len(&self) -> usize {
        self.as_slice().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Primitives a streaming capture device must provide.
///
/// Buffer bookkeeping (which side owns which buffer) lives in
/// [`BufferPool`](crate::pool::BufferPool); implementations only
/// forward requests to the driver.
#[async_trait]
pub trait CaptureDevice: Send {
    type Region: MappedRegion;

    /// Human-readable device name for diagnostics.
    fn name(&self) -> &str;

    fn capabilities(&self) -> io::Result<Capabilities>;

    /// Request `format`; returns what the driver actually selected.
    fn set_format(&mut self, format: &FrameFormat) -> io::Result<FrameFormat>;

    /// Ask for `count` buffers; returns the number granted.
    fn request_buffers(&mut self, count: u32) -> io::Result<u32>;

    fn map_buffer(&mut self, index: u32) -> io::Result<Self::Region>;

    fn queue_buffer(&mut self, index: u32) -> io::Result<()>;

    /// Take the oldest filled buffer, or `None` if nothing is ready.
    fn dequeue_buffer(&mut self) -> io::Result<Option<Dequeued>>;

    fn stream_on(&mut self) -> io::Result<()>;

    fn stream_off(&mut self) -> io::Result<()>;

    /// Block until a buffer may be ready or `timeout` elapses.
    async fn wait_ready(&mut self, timeout: Duration) -> io::Result<Readiness>;
}

// ── Negotiation ──────────────────────────────────────────────────

/// Check capabilities and apply `format`.
///
/// Fails with a device-init error if the device cannot capture, does not
/// support streaming I/O, or substitutes another pixel encoding. The
/// driver may still adjust the geometry.
pub fn negotiate<D: CaptureDevice>(
    device: &mut D,
    format: &FrameFormat,
) -> Result<FrameFormat, CamError> {
    let caps = device
        .capabilities()
        .map_err(CamError::init("VIDIOC_QUERYCAP"))?;

    if !caps.video_capture {
        return Err(CamError::Unsupported(format!(
            "{} is no video capture device",
            device.name()
        )));
    }
    if !caps.streaming {
        return Err(CamError::Unsupported(format!(
            "{} does not support streaming i/o",
            device.name()
        )));
    }

    let negotiated = device
        .set_format(format)
        .map_err(CamError::init("VIDIOC_S_FMT"))?;
    if negotiated.fourcc != format.fourcc {
        return Err(CamError::Unsupported(format!(
            "{} cannot capture {}, driver selected {}",
            device.name(),
            format.fourcc_str(),
            negotiated.fourcc_str()
        )));
    }

    info!(
        device = device.name(),
        driver = %caps.driver,
        card = %caps.card,
        "format negotiated: {negotiated}"
    );
    Ok(negotiated)
}
