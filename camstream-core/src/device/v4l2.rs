//! Video4Linux2 capture device.
//!
//! Uses the `v4l` crate to open the node and negotiate capabilities and
//! format, and its raw `ioctl` / `mmap` wrappers for the streaming I/O
//! requests the buffer pool issues one by one:
//!
//! 1. `VIDIOC_REQBUFS` / `VIDIOC_QUERYBUF` + `mmap` per buffer.
//! 2. `VIDIOC_QBUF` every buffer, `VIDIOC_STREAMON`.
//! 3. Wait for readability, `VIDIOC_DQBUF`, read, `VIDIOC_QBUF`.
//! 4. `VIDIOC_STREAMOFF`, `munmap`, close.
//!
//! # Platform
//!
//! This module is **Linux-only**. On other platforms the type keeps its
//! API but [`V4l2Device::open`] fails with
//! [`CamError::Unsupported`](crate::error::CamError::Unsupported).

// ── Linux implementation ─────────────────────────────────────────

#[cfg(target_os = "linux")]
mod platform {
    use std::io;
    use std::mem;
    use std::os::fd::{AsRawFd, RawFd};
    use std::os::raw::c_void;
    use std::ptr;
    use std::slice;
    use std::time::Duration;

    use async_trait::async_trait;
    use futures::FutureExt;
    use tokio::io::Interest;
    use tokio::io::unix::AsyncFd;
    use tracing::{debug, warn};
    use v4l::buffer::Type;
    use v4l::capability::Flags;
    use v4l::memory::Memory;
    use v4l::v4l_sys::{v4l2_buffer, v4l2_requestbuffers};
    use v4l::v4l2::{self as raw, vidioc};
    use v4l::video::Capture;
    use v4l::{Device, Format, FourCC};

    use crate::device::{
        Capabilities, CaptureDevice, Dequeued, FrameFormat, MappedRegion, Readiness,
    };
    use crate::error::CamError;

    /// Raw descriptor registered with the reactor. Does not own the fd.
    struct DeviceFd(RawFd);

    impl AsRawFd for DeviceFd {
        fn as_raw_fd(&self) -> RawFd {
            self.0
        }
    }

    /// A V4L2 capture node opened in non-blocking mode.
    pub struct V4l2Device {
        // Declared before `device` so it is deregistered before the fd closes.
        ready: AsyncFd<DeviceFd>,
        device: Device,
        path: String,
    }

    impl V4l2Device {
        /// Open the capture node at `path` (e.g. `/dev/video0`).
        ///
        /// Must be called from within a Tokio runtime.
        pub fn open(path: &str) -> Result<Self, CamError> {
            let device = Device::with_path(path).map_err(CamError::init("open"))?;
            let fd = device.handle().fd();
            let ready = AsyncFd::with_interest(DeviceFd(fd), Interest::READABLE)
                .map_err(CamError::init("register device"))?;
            debug!(path, fd, "opened capture device");
            Ok(Self {
                ready,
                device,
                path: path.to_owned(),
            })
        }

        fn fd(&self) -> RawFd {
            self.ready.get_ref().0
        }

        fn ioctl<T>(&self, request: vidioc::_IOC_TYPE, arg: &mut T) -> io::Result<()> {
            // SAFETY: `arg` is the structure `request` expects and outlives the call.
            unsafe { raw::ioctl(self.fd(), request, arg as *mut T as *mut c_void) }
        }

        fn capture_buffer(index: u32) -> v4l2_buffer {
            // SAFETY: v4l2_buffer is a plain C struct; all-zero is a valid value.
            let mut buf: v4l2_buffer = unsafe { mem::zeroed() };
            buf.type_ = Type::VideoCapture as u32;
            buf.memory = Memory::Mmap as u32;
            buf.index = index;
            buf
        }

        fn stream_ioctl(&self, request: vidioc::_IOC_TYPE) -> io::Result<()> {
            let mut typ = Type::VideoCapture as u32;
            self.ioctl(request, &mut typ)
        }

        /// Drop any readiness the reactor still holds for the device.
        fn clear_readiness(&self) {
            if let Some(Ok(mut guard)) = self.ready.readable().now_or_never() {
                guard.clear_ready();
            }
        }
    }

    #[async_trait]
    impl CaptureDevice for V4l2Device {
        type Region = MmapRegion;

        fn name(&self) -> &str {
            &self.path
        }

        fn capabilities(&self) -> io::Result<Capabilities> {
            let caps = self.device.query_caps()?;
            Ok(Capabilities {
                video_capture: caps.capabilities.contains(Flags::VIDEO_CAPTURE),
                streaming: caps.capabilities.contains(Flags::STREAMING),
                driver: caps.driver,
                card: caps.card,
            })
        }

        fn set_format(&mut self, format: &FrameFormat) -> io::Result<FrameFormat> {
            let wanted = Format::new(format.width, format.height, FourCC::new(&format.fourcc));
            let got = self.device.set_format(&wanted)?;
            Ok(FrameFormat {
                width: got.width,
                height: got.height,
                fourcc: got.fourcc.repr,
            })
        }

        fn request_buffers(&mut self, count: u32) -> io::Result<u32> {
            // SAFETY: plain C struct, zero is valid.
            let mut req: v4l2_requestbuffers = unsafe { mem::zeroed() };
            req.count = count;
            req.type_ = Type::VideoCapture as u32;
            req.memory = Memory::Mmap as u32;
            self.ioctl(vidioc::VIDIOC_REQBUFS, &mut req)?;
            Ok(req.count)
        }

        fn map_buffer(&mut self, index: u32) -> io::Result<MmapRegion> {
            let mut buf = Self::capture_buffer(index);
            self.ioctl(vidioc::VIDIOC_QUERYBUF, &mut buf)?;

            let len = buf.length as usize;
            // SAFETY: the driver filled `m.offset` for an MMAP buffer.
            let offset = unsafe { buf.m.offset };
            // SAFETY: maps `len` bytes of the device at the offset QUERYBUF
            // reported; the region is unmapped exactly once in `Drop`.
            let ptr = unsafe {
                raw::mmap(
                    ptr::null_mut(),
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    self.fd(),
                    offset as libc::off_t,
                )?
            };
            Ok(MmapRegion { ptr, len })
        }

        fn queue_buffer(&mut self, index: u32) -> io::Result<()> {
            let mut buf = Self::capture_buffer(index);
            self.ioctl(vidioc::VIDIOC_QBUF, &mut buf)
        }

        fn dequeue_buffer(&mut self) -> io::Result<Option<Dequeued>> {
            let mut buf = Self::capture_buffer(0);
            match self.ioctl(vidioc::VIDIOC_DQBUF, &mut buf) {
                Ok(()) => Ok(Some(Dequeued {
                    index: buf.index,
                    bytes_used: buf.bytesused as usize,
                })),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.clear_readiness();
                    Ok(None)
                }
                Err(e) => Err(e),
            }
        }

        fn stream_on(&mut self) -> io::Result<()> {
            self.stream_ioctl(vidioc::VIDIOC_STREAMON)
        }

        fn stream_off(&mut self) -> io::Result<()> {
            self.stream_ioctl(vidioc::VIDIOC_STREAMOFF)
        }

        async fn wait_ready(&mut self, timeout: Duration) -> io::Result<Readiness> {
            match tokio::time::timeout(timeout, self.ready.readable()).await {
                // Readiness is kept until DQBUF reports EAGAIN.
                Ok(Ok(_guard)) => Ok(Readiness::Ready),
                Ok(Err(e)) => Err(e),
                Err(_) => Ok(Readiness::TimedOut),
            }
        }
    }

    // ── MmapRegion ───────────────────────────────────────────────

    /// A device buffer mapped with `PROT_READ | PROT_WRITE`, `MAP_SHARED`.
    pub struct MmapRegion {
        ptr: *mut c_void,
        len: usize,
    }

    // SAFETY: the mapping is process-wide memory; access is serialised by
    // the pool's ownership state.
    unsafe impl Send for MmapRegion {}

    impl MappedRegion for MmapRegion {
        fn as_slice(&self) -> &[u8] {
            // SAFETY: `ptr` maps `len` readable bytes until `drop`.
            unsafe { slice::from_raw_parts(self.ptr as *const u8, self.len) }
        }
    }

    impl Drop for MmapRegion {
        fn drop(&mut self) {
            // SAFETY: `ptr`/`len` come from a successful mmap and are unmapped once.
            if let Err(e) = unsafe { raw::munmap(self.ptr, self.len) } {
                warn!("munmap failed: {e}");
            }
        }
    }
}

pub use platform::{MmapRegion, V4l2Device};

// ── Non-Linux stub ───────────────────────────────────────────────

#[cfg(not(target_os = "linux"))]
mod platform {
    use std::io;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::device::{
        Capabilities, CaptureDevice, Dequeued, FrameFormat, MappedRegion, Readiness,
    };
    use crate::error::CamError;

    const UNAVAILABLE: &str = "Video4Linux2 capture is only available on Linux";

    fn unsupported() -> io::Error {
        io::Error::new(io::ErrorKind::Unsupported, UNAVAILABLE)
    }

    /// Never constructed; [`V4l2Device::open`] always fails here.
    pub struct V4l2Device {
        _private: (),
    }

    /// Placeholder region type; no buffer is ever mapped.
    pub struct MmapRegion {
        _private: (),
    }

    impl MappedRegion for MmapRegion {
        fn as_slice(&self) -> &[u8] {
            &[]
        }
    }

    impl V4l2Device {
        pub fn open(_path: &str) -> Result<Self, CamError> {
            Err(CamError::Unsupported(UNAVAILABLE.into()))
        }
    }

    #[async_trait]
    impl CaptureDevice for V4l2Device {
        type Region = MmapRegion;

        fn name(&self) -> &str {
            "v4l2 (unavailable)"
        }

        fn capabilities(&self) -> io::Result<Capabilities> {
            Err(unsupported())
        }

        fn set_format(&mut self, _format: &FrameFormat) -> io::Result<FrameFormat> {
            Err(unsupported())
        }

        fn request_buffers(&mut self, _count: u32) -> io::Result<u32> {
            Err(unsupported())
        }

        fn map_buffer(&mut self, _index: u32) -> io::Result<MmapRegion> {
            Err(unsupported())
        }

        fn queue_buffer(&mut self, _index: u32) -> io::Result<()> {
            Err(unsupported())
        }

        fn dequeue_buffer(&mut self) -> io::Result<Option<Dequeued>> {
            Err(unsupported())
        }

        fn stream_on(&mut self) -> io::Result<()> {
            Err(unsupported())
        }

        fn stream_off(&mut self) -> io::Result<()> {
            Err(unsupported())
        }

        async fn wait_ready(&mut self, _timeout: Duration) -> io::Result<Readiness> {
            Err(unsupported())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn open_fails_as_device_init() {
            let err = V4l2Device::open("/dev/video0").err().unwrap();
            assert!(err.is_device_init());
        }

        fn assert_capture_device<D: CaptureDevice>() {}

        #[test]
        fn stub_keeps_device_surface() {
            assert_capture_device::<V4l2Device>();
        }
    }
}
