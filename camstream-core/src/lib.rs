//! # camstream-core
//!
//! Core library for streaming webcam frames from a V4L2 device to a
//! TCP collector.
//!
//! This crate contains:
//! - **Device**: `CaptureDevice` trait, the V4L2 backend and an in-memory
//!   `SyntheticDevice`
//! - **Pool**: `BufferPool`, the memory-mapped buffers and their ownership
//!   state
//! - **Capture**: `CaptureLoop`, wait / dequeue / send / requeue
//! - **Stream**: `FrameStreamer` and the debug preview sink
//! - **Handshake**: the descriptor sent ahead of the frames
//! - **Collector**: sequential accept loop that stores sessions and counts
//!   JPEG markers
//! - **Transcode**: post-processing hook for stored files
//! - **Error**: `CamError`, typed `thiserror`-based error hierarchy

pub mod capture;
pub mod collector;
pub mod device;
pub mod error;
pub mod handshake;
pub mod pool;
pub mod stream;
pub mod transcode;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use capture::{CaptureLoop, CaptureReport, CaptureState, FrameTarget, StopReason};
pub use collector::{Collector, MarkerCounter, SessionReport};
pub use device::{CaptureDevice, FrameFormat, SyntheticDevice, V4l2Device, negotiate};
pub use error::CamError;
pub use handshake::{MAX_DESCRIPTOR_LEN, StreamDescriptor, read_descriptor, send_descriptor};
pub use pool::{BufferHandle, BufferPool, BufferState, MIN_BUFFERS, REQUESTED_BUFFERS};
pub use stream::{FrameRenderer, FrameSink, FrameStreamer, JpegPreview, TraceRenderer, connect};
pub use transcode::{CommandTranscoder, Transcoder};
