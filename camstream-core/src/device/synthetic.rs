//! In-memory capture device.
//!
//! Emits JPEG-shaped payloads (`FF D8 FF E0 … FF D9`) without touching
//! any hardware. Used by the test suites and by the client's
//! `--synthetic` mode. Every buffer's content is fixed at map time and
//! replayed each time the buffer is dequeued, so the byte stream a run
//! produces is fully predictable.
//!
//! Faults can be injected to exercise the pool's error paths: a short
//! buffer grant, a failing `mmap`, a failing queue request, a driver
//! that substitutes its own pixel encoding, scripted readiness timeouts
//! and a failing readiness wait. A [`DeviceProbe`] observes queue / dequeue
//! traffic and live mappings from the outside.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::device::{
    Capabilities, CaptureDevice, Dequeued, FrameFormat, MappedRegion, Readiness,
};

/// JPEG start-of-image marker.
const SOI: [u8; 2] = [0xFF, 0xD8];
/// JPEG end-of-image marker.
const EOI: [u8; 2] = [0xFF, 0xD9];
/// APP0 marker, so frames look like JFIF to a casual reader.
const APP0: [u8; 2] = [0xFF, 0xE0];

/// Slack between a frame's valid length and the mapped length.
const MAP_SLACK: usize = 64;

// ── WaitStep / DeviceEvent ───────────────────────────────────────

/// One scripted outcome of [`CaptureDevice::wait_ready`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStep {
    Ready,
    TimedOut,
    Fail,
}

/// Traffic recorded by the device, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    Queued(u32),
    Dequeued(u32),
    StreamOn,
    StreamOff,
}

#[derive(Debug, Default)]
struct ProbeState {
    events: Mutex<Vec<DeviceEvent>>,
    live_mappings: AtomicUsize,
}

/// Shared view of a [`SyntheticDevice`]'s activity.
#[derive(Debug, Clone, Default)]
pub struct DeviceProbe {
    state: Arc<ProbeState>,
}

impl DeviceProbe {
    pub fn events(&self) -> Vec<DeviceEvent> {
        self.state
            .events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Mappings created and not yet dropped.
    pub fn live_mappings(&self) -> usize {
        self.state.live_mappings.load(Ordering::SeqCst)
    }

    /// Whether the last stream event was `StreamOn`.
    pub fn is_streaming(&self) -> bool {
        self.events()
            .iter()
            .rev()
            .find(|e| matches!(e, DeviceEvent::StreamOn | DeviceEvent::StreamOff))
            == Some(&DeviceEvent::StreamOn)
    }

    fn record(&self, event: DeviceEvent) {
        if let Ok(mut events) = self.state.events.lock() {
            events.push(event);
        }
    }
}

// ── SyntheticRegion ──────────────────────────────────────────────

/// A "mapped" buffer backed by heap memory.
pub struct SyntheticRegion {
    data: Arc<[u8]>,
    probe: DeviceProbe,
}

impl MappedRegion for SyntheticRegion {
    fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for SyntheticRegion {
    fn drop(&mut self) {
        self.probe.state.live_mappings.fetch_sub(1, Ordering::SeqCst);
    }
}

// ── SyntheticDevice ──────────────────────────────────────────────

/// A capture device that lives entirely in memory.
pub struct SyntheticDevice {
    name: String,
    capabilities: Capabilities,
    format: FrameFormat,
    grant_limit: Option<u32>,
    granted: u32,
    fail_map_at: Option<u32>,
    fail_queue_at: Option<u32>,
    driver_fourcc: Option<[u8; 4]>,
    payload_len: usize,
    frame_interval: Option<Duration>,
    wait_script: VecDeque<WaitStep>,
    /// Frame bytes per buffer index, built on map.
    frames: Vec<Option<Arc<[u8]>>>,
    queued: VecDeque<u32>,
    streaming: bool,
    probe: DeviceProbe,
}

impl Default for SyntheticDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticDevice {
    pub fn new() -> Self {
        Self {
            name: "synthetic".into(),
            capabilities: Capabilities {
                driver: "synthetic".into(),
                card: "camstream synthetic camera".into(),
                video_capture: true,
                streaming: true,
            },
            format: FrameFormat::mjpeg(640, 480),
            grant_limit: None,
            granted: 0,
            fail_map_at: None,
            fail_queue_at: None,
            driver_fourcc: None,
            payload_len: 256,
            frame_interval: None,
            wait_script: VecDeque::new(),
            frames: Vec::new(),
            queued: VecDeque::new(),
            streaming: false,
            probe: DeviceProbe::default(),
        }
    }

    /// Grant at most `limit` buffers, whatever was requested.
    pub fn with_grant_limit(mut self, limit: u32) -> Self {
        self.grant_limit = Some(limit);
        self
    }

    /// Make mapping buffer `index` fail.
    pub fn failing_map_at(mut self, index: u32) -> Self {
        self.fail_map_at = Some(index);
        self
    }

    /// Make queueing buffer `index` fail.
    pub fn failing_queue_at(mut self, index: u32) -> Self {
        self.fail_queue_at = Some(index);
        self
    }

    /// Answer every format request with `fourcc`, like a driver that only
    /// supports one encoding.
    pub fn with_driver_fourcc(mut self, fourcc: [u8; 4]) -> Self {
        self.driver_fourcc = Some(fourcc);
        self
    }

    /// Body bytes per frame, excluding markers.
    pub fn with_payload_len(mut self, len: usize) -> Self {
        self.payload_len = len;
        self
    }

    /// Sleep this long in each readiness wait, like a camera at a fixed rate.
    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = Some(interval);
        self
    }

    /// Outcomes for the next readiness waits; `Ready` once exhausted.
    pub fn with_wait_script(mut self, steps: impl IntoIterator<Item = WaitStep>) -> Self {
        self.wait_script = steps.into_iter().collect();
        self
    }

    /// Report no streaming I/O capability.
    pub fn without_streaming(mut self) -> Self {
        self.capabilities.streaming = false;
        self
    }

    pub fn probe(&self) -> DeviceProbe {
        self.probe.clone()
    }

    /// The exact bytes buffer `index` yields when dequeued.
    pub fn frame_bytes(index: u32, payload_len: usize) -> Vec<u8> {
        let mut frame = Vec::with_capacity(payload_len + 6);
        frame.extend_from_slice(&SOI);
        frame.extend_from_slice(&APP0);
        // Bytes stay below 0xF0, so the body never contains a marker.
        frame.extend((0..payload_len).map(|i| ((i + index as usize * 31) % 0xF0) as u8));
        frame.extend_from_slice(&EOI);
        frame
    }

    fn invalid(msg: &str) -> io::Error {
        io::Error::new(io::ErrorKind::InvalidInput, msg.to_string())
    }
}

#[async_trait]
impl CaptureDevice for SyntheticDevice {
    type Region = SyntheticRegion;

    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> io::Result<Capabilities> {
        Ok(self.capabilities.clone())
    }

    fn set_format(&mut self, format: &FrameFormat) -> io::Result<FrameFormat> {
        self.format = FrameFormat {
            fourcc: self.driver_fourcc.unwrap_or(format.fourcc),
            ..*format
        };
        Ok(self.format)
    }

    fn request_buffers(&mut self, count: u32) -> io::Result<u32> {
        if self.streaming {
            return Err(io::Error::new(io::ErrorKind::ResourceBusy, "device is streaming"));
        }
        self.granted = self.grant_limit.map_or(count, |limit| count.min(limit));
        self.frames = vec![None; self.granted as usize];
        self.queued.clear();
        Ok(self.granted)
    }

    fn map_buffer(&mut self, index: u32) -> io::Result<SyntheticRegion> {
        if index >= self.granted {
            return Err(Self::invalid("buffer index out of range"));
        }
        if self.fail_map_at == Some(index) {
            return Err(io::Error::new(io::ErrorKind::OutOfMemory, "cannot allocate memory"));
        }

        let frame: Arc<[u8]> = Self::frame_bytes(index, self.payload_len).into();
        let mut mapped = frame.to_vec();
        mapped.resize(frame.len() + MAP_SLACK, 0);
        self.frames[index as usize] = Some(frame);

        self.probe.state.live_mappings.fetch_add(1, Ordering::SeqCst);
        Ok(SyntheticRegion {
            data: mapped.into(),
            probe: self.probe.clone(),
        })
    }

    fn queue_buffer(&mut self, index: u32) -> io::Result<()> {
        if index >= self.granted {
            return Err(Self::invalid("buffer index out of range"));
        }
        if self.queued.contains(&index) {
            return Err(Self::invalid("buffer already queued"));
        }
        if self.fail_queue_at == Some(index) {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "queue rejected"));
        }
        self.queued.push_back(index);
        self.probe.record(DeviceEvent::Queued(index));
        Ok(())
    }

    fn dequeue_buffer(&mut self) -> io::Result<Option<Dequeued>> {
        if !self.streaming {
            return Err(Self::invalid("device is not streaming"));
        }
        let Some(index) = self.queued.pop_front() else {
            return Ok(None);
        };
        let bytes_used = self.frames[index as usize]
            .as_ref()
            .map_or(0, |frame| frame.len());
        self.probe.record(DeviceEvent::Dequeued(index));
        Ok(Some(Dequeued { index, bytes_used }))
    }

    fn stream_on(&mut self) -> io::Result<()> {
        self.streaming = true;
        self.probe.record(DeviceEvent::StreamOn);
        Ok(())
    }

    fn stream_off(&mut self) -> io::Result<()> {
        self.streaming = false;
        self.queued.clear();
        self.probe.record(DeviceEvent::StreamOff);
        Ok(())
    }

    async fn wait_ready(&mut self, _timeout: Duration) -> io::Result<Readiness> {
        match self.wait_script.pop_front().unwrap_or(WaitStep::Ready) {
            WaitStep::Ready => {
                if let Some(interval) = self.frame_interval {
                    tokio::time::sleep(interval).await;
                }
                Ok(Readiness::Ready)
            }
            WaitStep::TimedOut => {
                tokio::task::yield_now().await;
                Ok(Readiness::TimedOut)
            }
            WaitStep::Fail => Err(io::Error::new(
                io::ErrorKind::Interrupted,
                "synthetic readiness failure",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_bytes_carry_exactly_one_soi() {
        let frame = SyntheticDevice::frame_bytes(3, 1000);
        assert_eq!(&frame[..2], &SOI);
        assert_eq!(&frame[frame.len() - 2..], &EOI);
        let markers = frame.windows(2).filter(|w| *w == SOI).count();
        assert_eq!(markers, 1);
    }

    #[test]
    fn grant_limit_caps_request() {
        let mut dev = SyntheticDevice::new().with_grant_limit(1);
        assert_eq!(dev.request_buffers(4).unwrap(), 1);
    }

    #[test]
    fn mapped_region_is_larger_than_frame() {
        let mut dev = SyntheticDevice::new().with_payload_len(10);
        dev.request_buffers(2).unwrap();
        let region = dev.map_buffer(1).unwrap();
        assert_eq!(region.len(), 16 + MAP_SLACK);
        assert_eq!(dev.probe().live_mappings(), 1);
        drop(region);
        assert_eq!(dev.probe().live_mappings(), 0);
    }

    #[test]
    fn double_queue_is_rejected() {
        let mut dev = SyntheticDevice::new();
        dev.request_buffers(2).unwrap();
        dev.queue_buffer(0).unwrap();
        assert!(dev.queue_buffer(0).is_err());
    }

    #[test]
    fn driver_fourcc_overrides_request() {
        let mut dev = SyntheticDevice::new().with_driver_fourcc(*b"YUYV");
        let got = dev.set_format(&FrameFormat::mjpeg(320, 240)).unwrap();
        assert_eq!(got.fourcc_str(), "YUYV");
        assert_eq!((got.width, got.height), (320, 240));
    }

    #[tokio::test]
    async fn wait_script_then_ready() {
        let mut dev = SyntheticDevice::new().with_wait_script([WaitStep::TimedOut, WaitStep::Fail]);
        let t = Duration::from_secs(5);
        assert_eq!(dev.wait_ready(t).await.unwrap(), Readiness::TimedOut);
        assert!(dev.wait_ready(t).await.is_err());
        assert_eq!(dev.wait_ready(t).await.unwrap(), Readiness::Ready);
    }
}
