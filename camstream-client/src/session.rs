//! One producer run, from device negotiation to teardown.
//!
//! ```text
//!   negotiate ─► map buffers ─► connect ─► descriptor ─► queue all
//!        ─► stream on ─► capture loop ─► finish socket ─► teardown
//! ```
//!
//! The device is prepared before the collector is contacted, so a device
//! that cannot stream never opens a connection. Teardown runs on every
//! path once the pool exists.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use camstream_core::{
    BufferPool, CamError, CaptureDevice, CaptureLoop, CaptureReport, FrameFormat, FrameSink,
    FrameStreamer, FrameTarget, StreamDescriptor, connect, negotiate, send_descriptor,
};

/// Everything a run needs besides the device.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Collector `host:port`.
    pub addr: String,
    pub format: FrameFormat,
    pub target: FrameTarget,
    /// Buffers to request from the driver.
    pub buffers: u32,
    pub wait_timeout: Duration,
    pub descriptor_prefix: String,
}

/// Capture from `device` and stream to the collector until the target is
/// met or `cancel` fires.
pub async fn run_session<D: CaptureDevice>(
    mut device: D,
    options: &SessionOptions,
    preview: Option<Box<dyn FrameSink>>,
    cancel: CancellationToken,
) -> Result<CaptureReport, CamError> {
    let format = negotiate(&mut device, &options.format)?;
    if format != options.format {
        warn!("requested {}, driver adjusted to {format}", options.format);
    }

    let mut pool = BufferPool::initialize(device, options.buffers)?;
    let outcome = stream_frames(&mut pool, format, options, preview, cancel).await;
    let released = pool.teardown();

    let report = outcome?;
    released?;
    info!(
        frames = report.frames,
        bytes = report.bytes,
        timeouts = report.timeouts,
        "capture finished ({:?})",
        report.stopped_by
    );
    Ok(report)
}

async fn stream_frames<D: CaptureDevice>(
    pool: &mut BufferPool<D>,
    format: FrameFormat,
    options: &SessionOptions,
    preview: Option<Box<dyn FrameSink>>,
    cancel: CancellationToken,
) -> Result<CaptureReport, CamError> {
    let descriptor = StreamDescriptor::for_capture(&options.descriptor_prefix, &format, options.target)?;

    let mut stream: TcpStream = connect(&options.addr).await?;
    send_descriptor(&mut stream, &descriptor).await?;
    info!("descriptor {descriptor} sent");

    pool.queue_all()?;
    pool.start_streaming()?;

    let mut streamer = FrameStreamer::new(stream);
    if let Some(sink) = preview {
        streamer = streamer.with_preview(sink);
    }

    let report = CaptureLoop::new(options.target, cancel)
        .with_wait_timeout(options.wait_timeout)
        .run(pool, &mut streamer)
        .await?;
    streamer.finish().await?;
    Ok(report)
}
