//! Producer-side frame streaming.
//!
//! Frames go on the wire exactly as the device produced them: one
//! contiguous write per buffer, no length prefix, no delimiter. The
//! receiver can only find frame boundaries by looking for JPEG markers
//! in the content.
//!
//! A debug [`FrameSink`] can be attached to see what is being sent. The
//! bundled [`JpegPreview`] decodes each frame and hands the pixels to a
//! [`FrameRenderer`]. Decode failures abort the run: the preview is a
//! debugging aid and a frame it cannot decode usually means the stream
//! itself is broken.

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, trace};

use crate::error::CamError;

// ── Collaborator traits ──────────────────────────────────────────

/// Receives a copy of every frame after it has been sent.
pub trait FrameSink: Send {
    fn accept_frame(&mut self, frame: &[u8]) -> Result<(), CamError>;
}

/// Displays decoded RGB8 pixels.
pub trait FrameRenderer: Send {
    fn render(&mut self, rgb: &[u8], width: u32, height: u32) -> Result<(), CamError>;
}

// ── JpegPreview ──────────────────────────────────────────────────

/// Decodes JPEG frames and forwards them to a renderer.
pub struct JpegPreview<R> {
    renderer: R,
}

impl<R: FrameRenderer> JpegPreview<R> {
    pub fn new(renderer: R) -> Self {
        Self { renderer }
    }

    pub fn renderer(&self) -> &R {
        &self.renderer
    }
}

impl<R: FrameRenderer> FrameSink for JpegPreview<R> {
    fn accept_frame(&mut self, frame: &[u8]) -> Result<(), CamError> {
        let image = image::load_from_memory_with_format(frame, image::ImageFormat::Jpeg)?;
        let rgb = image.to_rgb8();
        self.renderer.render(rgb.as_raw(), rgb.width(), rgb.height())
    }
}

/// A renderer that only logs what it would have shown.
#[derive(Debug, Default)]
pub struct TraceRenderer {
    frames: u64,
}

impl TraceRenderer {
    pub fn frames(&self) -> u64 {
        self.frames
    }
}

impl FrameRenderer for TraceRenderer {
    fn render(&mut self, rgb: &[u8], width: u32, height: u32) -> Result<(), CamError> {
        self.frames += 1;
        trace!(width, height, bytes = rgb.len(), "preview frame {}", self.frames);
        Ok(())
    }
}

// ── FrameStreamer ────────────────────────────────────────────────

/// Writes raw frames to the collector connection.
pub struct FrameStreamer<W> {
    writer: W,
    preview: Option<Box<dyn FrameSink>>,
    frames_sent: u64,
    bytes_sent: u64,
}

impl<W: AsyncWrite + Unpin + Send> FrameStreamer<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            preview: None,
            frames_sent: 0,
            bytes_sent: 0,
        }
    }

    /// Also hand every frame to `sink`.
    pub fn with_preview(mut self, sink: Box<dyn FrameSink>) -> Self {
        self.preview = Some(sink);
        self
    }

    /// Send one frame as a single contiguous write.
    pub async fn send_frame(&mut self, frame: &[u8]) -> Result<(), CamError> {
        self.writer
            .write_all(frame)
            .await
            .map_err(CamError::StreamSend)?;
        self.frames_sent += 1;
        self.bytes_sent += frame.len() as u64;

        if let Some(preview) = self.preview.as_mut() {
            preview.accept_frame(frame)?;
        }
        Ok(())
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Flush and shut down the write half, signalling end of stream.
    pub async fn finish(mut self) -> Result<W, CamError> {
        self.writer.flush().await.map_err(CamError::StreamSend)?;
        self.writer.shutdown().await.map_err(CamError::StreamSend)?;
        debug!(
            frames = self.frames_sent,
            bytes = self.bytes_sent,
            "stream finished"
        );
        Ok(self.writer)
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// Open the collector connection.
pub async fn connect(addr: &str) -> Result<TcpStream, CamError> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|source| CamError::Connect {
            addr: addr.to_string(),
            source,
        })?;
    stream.set_nodelay(true)?;
    info!("connected to {addr}");
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::device::SyntheticDevice;

    struct Counting(Arc<AtomicU32>);

    impl FrameSink for Counting {
        fn accept_frame(&mut self, _frame: &[u8]) -> Result<(), CamError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn frames_are_concatenated_verbatim() {
        let mut streamer = FrameStreamer::new(Vec::new());
        streamer.send_frame(b"\xFF\xD8abc").await.unwrap();
        streamer.send_frame(b"\xFF\xD8de").await.unwrap();
        assert_eq!(streamer.frames_sent(), 2);
        assert_eq!(streamer.bytes_sent(), 9);
        assert_eq!(streamer.into_inner(), b"\xFF\xD8abc\xFF\xD8de");
    }

    #[tokio::test]
    async fn write_failure_is_stream_send_error() {
        let writer = tokio_test::io::Builder::new()
            .write_error(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "reset"))
            .build();
        let mut streamer = FrameStreamer::new(writer);
        let err = streamer.send_frame(b"frame").await.unwrap_err();
        assert!(matches!(err, CamError::StreamSend(_)));
    }

    #[tokio::test]
    async fn preview_sees_every_frame() {
        let seen = Arc::new(AtomicU32::new(0));
        let mut streamer =
            FrameStreamer::new(Vec::new()).with_preview(Box::new(Counting(seen.clone())));
        for _ in 0..3 {
            streamer.send_frame(b"x").await.unwrap();
        }
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn jpeg_preview_rejects_non_jpeg() {
        // Synthetic frames only look like JPEG from a distance.
        let mut preview = JpegPreview::new(TraceRenderer::default());
        let frame = SyntheticDevice::frame_bytes(0, 64);
        let err = preview.accept_frame(&frame).unwrap_err();
        assert!(matches!(err, CamError::Decode(_)));
        assert_eq!(preview.renderer().frames(), 0);
    }

    #[test]
    fn jpeg_preview_renders_real_jpeg() {
        let mut jpeg = Vec::new();
        let img = image::RgbImage::from_pixel(8, 4, image::Rgb([200, 10, 10]));
        img.write_to(&mut std::io::Cursor::new(&mut jpeg), image::ImageFormat::Jpeg)
            .unwrap();

        let mut preview = JpegPreview::new(TraceRenderer::default());
        preview.accept_frame(&jpeg).unwrap();
        assert_eq!(preview.renderer().frames(), 1);
    }
}
