//! Memory-mapped device buffer pool.
//!
//! The pool is an arena of [`Slot`]s indexed by buffer ordinal. Each slot
//! keeps the mapped region next to its ownership state, and every state
//! change goes through [`Slot::transition`], which only admits
//!
//! ```text
//! Free ──► QueuedToDevice ──► DequeuedToApp ──► QueuedToDevice ──► …
//! ```
//!
//! Outside code never sees a region directly: it gets a [`BufferHandle`]
//! from [`dequeue_ready`](BufferPool::dequeue_ready), reads the valid
//! bytes through [`frame`](BufferPool::frame) and gives the handle back
//! with [`requeue`](BufferPool::requeue). The handle is move-only, so a
//! buffer cannot be requeued twice.
//!
//! Dropping the pool stops streaming and unmaps everything, so error
//! paths cannot leak mappings or leave the device streaming.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::device::{CaptureDevice, Dequeued, MappedRegion, Readiness};
use crate::error::CamError;

/// Fewer granted buffers than this and capture cannot keep the driver fed.
pub const MIN_BUFFERS: u32 = 2;

/// Buffers requested by default.
pub const REQUESTED_BUFFERS: u32 = 4;

// ── BufferState ──────────────────────────────────────────────────

/// Which side may touch a buffer's memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferState {
    /// Mapped, never handed to the driver.
    Free,
    /// Owned by the driver; the application must not touch it.
    QueuedToDevice,
    /// Holds a captured frame the application is reading.
    DequeuedToApp,
}

impl BufferState {
    fn can_become(self, next: BufferState) -> bool {
        use BufferState::*;
        matches!(
            (self, next),
            (Free, QueuedToDevice) | (QueuedToDevice, DequeuedToApp) | (DequeuedToApp, QueuedToDevice)
        )
    }
}

// ── Slot ─────────────────────────────────────────────────────────

struct Slot<R> {
    index: u32,
    region: R,
    state: BufferState,
}

impl<R> Slot<R> {
    fn check(&self, next: BufferState) -> Result<(), CamError> {
        if !self.state.can_become(next) {
            return Err(CamError::BufferState {
                index: self.index,
                from: self.state,
                to: next,
            });
        }
        Ok(())
    }

    fn transition(&mut self, next: BufferState) -> Result<(), CamError> {
        self.check(next)?;
        self.state = next;
        Ok(())
    }
}

// ── BufferHandle ─────────────────────────────────────────────────

/// Proof that the application owns a dequeued buffer.
///
/// Give it back with [`BufferPool::requeue`], exactly once.
#[derive(Debug)]
#[must_use = "a dequeued buffer must be requeued or capture starves"]
pub struct BufferHandle {
    index: u32,
    bytes_used: usize,
}

impl BufferHandle {
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Length of the valid byte range.
    pub fn len(&self) -> usize {
        self.bytes_used
    }

    pub fn is_empty(&self) -> bool {
        self.bytes_used == 0
    }
}

// ── BufferPool ───────────────────────────────────────────────────

/// Owns the device and its mapped buffers for one capture session.
pub struct BufferPool<D: CaptureDevice> {
    device: D,
    slots: Vec<Slot<D::Region>>,
    streaming: bool,
}

impl<D: CaptureDevice> BufferPool<D> {
    /// Request `requested` buffers from `device` and map all of them.
    ///
    /// Fails with [`CamError::DeviceBuffer`] if the driver grants fewer
    /// than [`MIN_BUFFERS`], and with [`CamError::MemoryMap`] if any
    /// mapping fails. On failure every mapping made so far is released
    /// before the error is returned.
    pub fn initialize(mut device: D, requested: u32) -> Result<Self, CamError> {
        let granted = device
            .request_buffers(requested)
            .map_err(CamError::init("VIDIOC_REQBUFS"))?;

        if granted < MIN_BUFFERS {
            return Err(CamError::DeviceBuffer {
                granted,
                minimum: MIN_BUFFERS,
            });
        }

        let mut slots = Vec::with_capacity(granted as usize);
        for index in 0..granted {
            // `slots` drops on the error path, unmapping what is already mapped.
            let region = device
                .map_buffer(index)
                .map_err(|source| CamError::MemoryMap { index, source })?;
            debug!(index, len = region.len(), "mapped buffer");
            slots.push(Slot {
                index,
                region,
                state: BufferState::Free,
            });
        }

        info!(device = device.name(), requested, granted, "buffer pool ready");
        Ok(Self {
            device,
            slots,
            streaming: false,
        })
    }

    /// Number of buffers in the pool. Fixed for the pool's lifetime.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Current ownership state of buffer `index`.
    pub fn state(&self, index: u32) -> Option<BufferState> {
        self.slots.get(index as usize).map(|slot| slot.state)
    }

    /// Hand every free buffer to the driver. Call once, before streaming.
    ///
    /// A buffer only counts as queued once the driver has accepted it.
    pub fn queue_all(&mut self) -> Result<(), CamError> {
        for slot in &mut self.slots {
            slot.check(BufferState::QueuedToDevice)?;
            self.device
                .queue_buffer(slot.index)
                .map_err(CamError::device_io("VIDIOC_QBUF"))?;
            slot.state = BufferState::QueuedToDevice;
        }
        Ok(())
    }

    pub fn start_streaming(&mut self) -> Result<(), CamError> {
        self.device
            .stream_on()
            .map_err(CamError::device_io("VIDIOC_STREAMON"))?;
        self.streaming = true;
        info!(device = self.device.name(), "streaming started");
        Ok(())
    }

    /// Wait up to `timeout` for the driver to report readiness.
    ///
    /// A timeout is not an error; it yields [`Readiness::TimedOut`].
    pub async fn wait_ready(&mut self, timeout: Duration) -> Result<Readiness, CamError> {
        self.device
            .wait_ready(timeout)
            .await
            .map_err(CamError::DeviceWait)
    }

    /// Take one filled buffer from the driver.
    ///
    /// Returns `None` when the driver has nothing ready after all.
    pub fn dequeue_ready(&mut self) -> Result<Option<BufferHandle>, CamError> {
        let Some(Dequeued { index, bytes_used }) = self
            .device
            .dequeue_buffer()
            .map_err(CamError::device_io("VIDIOC_DQBUF"))?
        else {
            return Ok(None);
        };

        let slot = self
            .slots
            .get_mut(index as usize)
            .ok_or(CamError::UnknownBuffer(index))?;
        slot.transition(BufferState::DequeuedToApp)?;

        // Never expose more than was mapped, whatever the driver claims.
        let bytes_used = bytes_used.min(slot.region.len());
        Ok(Some(BufferHandle { index, bytes_used }))
    }

    /// The valid bytes of a dequeued buffer.
    pub fn frame(&self, handle: &BufferHandle) -> Result<&[u8], CamError> {
        let slot = self
            .slots
            .get(handle.index as usize)
            .ok_or(CamError::UnknownBuffer(handle.index))?;
        slot.region
            .as_slice()
            .get(..handle.bytes_used)
            .ok_or(CamError::UnknownBuffer(handle.index))
    }

    /// Return a dequeued buffer to the driver.
    pub fn requeue(&mut self, handle: BufferHandle) -> Result<(), CamError> {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .ok_or(CamError::UnknownBuffer(handle.index))?;
        slot.check(BufferState::QueuedToDevice)?;
        self.device
            .queue_buffer(handle.index)
            .map_err(CamError::device_io("VIDIOC_QBUF"))?;
        slot.state = BufferState::QueuedToDevice;
        Ok(())
    }

    /// Stop streaming, unmap every buffer and close the device.
    pub fn teardown(mut self) -> Result<(), CamError> {
        let result = self.stop_streaming();
        self.slots.clear();
        info!(device = self.device.name(), "buffer pool released");
        result
    }

    fn stop_streaming(&mut self) -> Result<(), CamError> {
        if !self.streaming {
            return Ok(());
        }
        self.streaming = false;
        self.device
            .stream_off()
            .map_err(CamError::device_io("VIDIOC_STREAMOFF"))
    }
}

impl<D: CaptureDevice> Drop for BufferPool<D> {
    fn drop(&mut self) {
        if let Err(e) = self.stop_streaming() {
            warn!("{e}");
        }
        // Regions unmap themselves when `slots` drops, before `device` closes.
        self.slots.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceEvent, SyntheticDevice};

    fn streaming_pool(dev: SyntheticDevice) -> BufferPool<SyntheticDevice> {
        let mut pool = BufferPool::initialize(dev, REQUESTED_BUFFERS).unwrap();
        pool.queue_all().unwrap();
        pool.start_streaming().unwrap();
        pool
    }

    #[test]
    fn initialize_maps_every_granted_buffer() {
        let dev = SyntheticDevice::new();
        let probe = dev.probe();
        let pool = BufferPool::initialize(dev, 4).unwrap();
        assert_eq!(pool.len(), 4);
        assert_eq!(probe.live_mappings(), 4);
        assert!((0..4).all(|i| pool.state(i) == Some(BufferState::Free)));
    }

    #[test]
    fn too_few_buffers_is_device_init_error() {
        let dev = SyntheticDevice::new().with_grant_limit(1);
        let probe = dev.probe();
        let err = BufferPool::initialize(dev, 4).err().unwrap();
        assert!(matches!(err, CamError::DeviceBuffer { granted: 1, minimum: 2 }));
        assert!(err.is_device_init());
        assert_eq!(probe.live_mappings(), 0);
    }

    #[test]
    fn map_failure_releases_earlier_mappings() {
        let dev = SyntheticDevice::new().failing_map_at(2);
        let probe = dev.probe();
        let err = BufferPool::initialize(dev, 4).err().unwrap();
        assert!(matches!(err, CamError::MemoryMap { index: 2, .. }));
        assert_eq!(probe.live_mappings(), 0);
    }

    #[test]
    fn dequeue_exposes_bytes_used_only() {
        let mut pool = streaming_pool(SyntheticDevice::new().with_payload_len(100));
        let handle = pool.dequeue_ready().unwrap().unwrap();
        assert_eq!(handle.index(), 0);
        assert_eq!(pool.frame(&handle).unwrap(), SyntheticDevice::frame_bytes(0, 100).as_slice());
        assert_eq!(pool.state(0), Some(BufferState::DequeuedToApp));
        pool.requeue(handle).unwrap();
        assert_eq!(pool.state(0), Some(BufferState::QueuedToDevice));
    }

    #[test]
    fn queue_all_twice_is_rejected() {
        let mut pool = BufferPool::initialize(SyntheticDevice::new(), 2).unwrap();
        pool.queue_all().unwrap();
        let err = pool.queue_all().unwrap_err();
        assert!(matches!(
            err,
            CamError::BufferState {
                from: BufferState::QueuedToDevice,
                to: BufferState::QueuedToDevice,
                ..
            }
        ));
    }

    #[test]
    fn rejected_queue_leaves_buffer_free() {
        let mut pool = BufferPool::initialize(SyntheticDevice::new().failing_queue_at(1), 4).unwrap();
        let err = pool.queue_all().unwrap_err();
        assert!(matches!(err, CamError::DeviceIo { step: "VIDIOC_QBUF", .. }));
        assert_eq!(pool.state(0), Some(BufferState::QueuedToDevice));
        assert_eq!(pool.state(1), Some(BufferState::Free));
        assert_eq!(pool.state(2), Some(BufferState::Free));
    }

    #[test]
    fn frame_rejects_handle_from_larger_pool() {
        let mut big = streaming_pool(SyntheticDevice::new());
        let small = BufferPool::initialize(SyntheticDevice::new(), 2).unwrap();

        let mut handles = Vec::new();
        for _ in 0..REQUESTED_BUFFERS {
            handles.push(big.dequeue_ready().unwrap().unwrap());
        }
        let last = handles.last().unwrap();
        assert_eq!(last.index(), REQUESTED_BUFFERS - 1);
        assert!(matches!(small.frame(last), Err(CamError::UnknownBuffer(3))));

        for handle in handles {
            big.requeue(handle).unwrap();
        }
    }

    #[test]
    fn ownership_trace_follows_protocol() {
        let dev = SyntheticDevice::new();
        let probe = dev.probe();
        let mut pool = streaming_pool(dev);

        for _ in 0..10 {
            let handle = pool.dequeue_ready().unwrap().unwrap();
            pool.requeue(handle).unwrap();
        }
        pool.teardown().unwrap();

        // Rebuild each buffer's state trace from the device's view.
        for index in 0..REQUESTED_BUFFERS {
            let mut trace = vec![BufferState::Free];
            for event in probe.events() {
                match event {
                    DeviceEvent::Queued(i) if i == index => trace.push(BufferState::QueuedToDevice),
                    DeviceEvent::Dequeued(i) if i == index => trace.push(BufferState::DequeuedToApp),
                    _ => {}
                }
            }
            assert!(trace.len() > 2, "buffer {index} never cycled");
            for pair in trace.windows(2) {
                assert_ne!(pair[0], pair[1]);
                assert!(pair[0].can_become(pair[1]), "bad step {pair:?}");
            }
        }
    }

    #[test]
    fn teardown_stops_stream_and_unmaps() {
        let dev = SyntheticDevice::new();
        let probe = dev.probe();
        let mut pool = streaming_pool(dev);
        let handle = pool.dequeue_ready().unwrap().unwrap();
        // Teardown unmaps regardless of state; the handle is just a token.
        drop(handle);
        pool.teardown().unwrap();
        assert!(!probe.is_streaming());
        assert_eq!(probe.live_mappings(), 0);
    }

    #[test]
    fn drop_is_a_teardown_backstop() {
        let dev = SyntheticDevice::new();
        let probe = dev.probe();
        let pool = streaming_pool(dev);
        drop(pool);
        assert!(!probe.is_streaming());
        assert_eq!(probe.live_mappings(), 0);
    }
}
