//! Producer capture loop.
//!
//! ```text
//!            timeout
//!          ┌─────────┐
//!          ▼         │
//!   ──► WaitingReady ┴──► HasBuffer ──► Streaming ──┐
//!          ▲                                        │
//!          └────────────────────────────────────────┘
//!   target reached / cancelled ──► Stopped
//! ```
//!
//! A readiness timeout is the benign "no frame yet" case and simply
//! re-enters the wait. Every other failure is fatal to the run.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::device::{CaptureDevice, Readiness};
use crate::error::CamError;
use crate::pool::BufferPool;
use crate::stream::FrameStreamer;

/// Default bound on a single readiness wait.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

// ── FrameTarget ──────────────────────────────────────────────────

/// How many frames a run should produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameTarget {
    Finite(u64),
    /// Run until cancelled.
    Unbounded,
}

impl FrameTarget {
    pub fn is_reached(&self, produced: u64) -> bool {
        match self {
            FrameTarget::Finite(n) => produced >= *n,
            FrameTarget::Unbounded => false,
        }
    }
}

impl FromStr for FrameTarget {
    type Err = String;

    /// Accepts a non-negative count, or `-1` / `unbounded` / `inf`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "-1" | "unbounded" | "inf" => Ok(FrameTarget::Unbounded),
            other => other
                .parse::<u64>()
                .map(FrameTarget::Finite)
                .map_err(|_| format!("invalid frame count {other:?}: expected N >= 0 or -1")),
        }
    }
}

impl fmt::Display for FrameTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameTarget::Finite(n) => write!(f, "{n}"),
            FrameTarget::Unbounded => f.write_str("-1"),
        }
    }
}

// ── CaptureState / CaptureReport ─────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    WaitingReady,
    HasBuffer,
    Streaming,
    Stopped,
}

/// Why a run ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopReason {
    #[default]
    TargetReached,
    Cancelled,
}

/// Counters for a finished run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureReport {
    pub frames: u64,
    pub bytes: u64,
    /// Readiness waits that timed out.
    pub timeouts: u64,
    pub stopped_by: StopReason,
}

// ── CaptureLoop ──────────────────────────────────────────────────

pub struct CaptureLoop {
    target: FrameTarget,
    wait_timeout: Duration,
    cancel: CancellationToken,
    state: CaptureState,
}

impl CaptureLoop {
    pub fn new(target: FrameTarget, cancel: CancellationToken) -> Self {
        Self {
            target,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            cancel,
            state: CaptureState::WaitingReady,
        }
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    /// Capture until the target is met or the token is cancelled.
    ///
    /// The pool must already be queued and streaming.
    pub async fn run<D, W>(
        &mut self,
        pool: &mut BufferPool<D>,
        streamer: &mut FrameStreamer<W>,
    ) -> Result<CaptureReport, CamError>
    where
        D: CaptureDevice,
        W: AsyncWrite + Unpin + Send,
    {
        let mut report = CaptureReport::default();
        self.enter(CaptureState::WaitingReady);

        while !self.target.is_reached(report.frames) {
            let readiness = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    report.stopped_by = StopReason::Cancelled;
                    break;
                }
                ready = pool.wait_ready(self.wait_timeout) => ready?,
            };

            if readiness == Readiness::TimedOut {
                report.timeouts += 1;
                debug!("no frame within {:?}; waiting again", self.wait_timeout);
                continue;
            }

            let Some(handle) = pool.dequeue_ready()? else {
                trace!("spurious wake-up");
                continue;
            };
            self.enter(CaptureState::HasBuffer);

            let sent = match pool.frame(&handle) {
                Ok(frame) => {
                    self.enter(CaptureState::Streaming);
                    streamer.send_frame(frame).await
                }
                Err(e) => Err(e),
            };
            let len = handle.len() as u64;
            pool.requeue(handle)?;
            sent?;

            report.frames += 1;
            report.bytes += len;
            info!(
                "frame {}/{} captured ({len} bytes) and sent",
                report.frames, self.target
            );
            self.enter(CaptureState::WaitingReady);
        }

        self.enter(CaptureState::Stopped);
        Ok(report)
    }

    fn enter(&mut self, next: CaptureState) {
        trace!(from = ?self.state, to = ?next, "capture state");
        self.state = next;
    }
}
