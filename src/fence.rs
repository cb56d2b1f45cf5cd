//! Producer-side buffer readiness signals.
//!
//! A [`Fence`] stands in for the acquire fence a buffer producer attaches
//! to an output buffer: the device must not write into the buffer until
//! the producer signals readiness. Waiting is bounded; a fence that never
//! fires is a hard failure for its buffer, not a retry.

use std::fmt;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use crate::error::{CameraError, Result};

enum FenceState {
    Ready,
    Failed,
}

/// Waitable readiness signal attached to an output buffer.
pub struct Fence {
    rx: Receiver<FenceState>,
}

/// Producer half of a [`Fence`]. Dropping it without signaling counts as
/// an error signal for the waiter.
pub struct FenceSignal {
    tx: Sender<FenceState>,
}

impl Fence {
    /// Create a fence and its producer half.
    #[must_use]
    pub fn pair() -> (FenceSignal, Self) {
        let (tx, rx) = mpsc::channel();
        (FenceSignal { tx }, Self { rx })
    }

    /// Create a fence that is already signaled ready.
    #[must_use]
    pub fn signaled() -> Self {
        let (signal, fence) = Self::pair();
        signal.signal();
        fence
    }

    /// Block until the producer signals, up to `timeout`.
    ///
    /// # Errors
    ///
    /// `BufferTimeout` if the signal never arrives within the bound;
    /// `BufferSignalError` on an explicit error signal or a dropped
    /// producer.
    pub fn wait(&self, timeout: Duration) -> Result<()> {
        match self.rx.recv_timeout(timeout) {
            Ok(FenceState::Ready) => Ok(()),
            Ok(FenceState::Failed) | Err(RecvTimeoutError::Disconnected) => {
                Err(CameraError::BufferSignalError)
            }
            Err(RecvTimeoutError::Timeout) => Err(CameraError::BufferTimeout),
        }
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Fence")
    }
}

impl FenceSignal {
    /// Signal that the buffer is ready for device access.
    pub fn signal(self) {
        let _ = self.tx.send(FenceState::Ready);
    }

    /// Signal an explicit producer-side error.
    pub fn fail(self) {
        let _ = self.tx.send(FenceState::Failed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHORT: Duration = Duration::from_millis(20);

    #[test]
    fn test_signaled_fence_is_ready() {
        let fence = Fence::signaled();
        fence.wait(SHORT).expect("pre-signaled fence should be ready");
    }

    #[test]
    fn test_unsignaled_fence_times_out() {
        let (_signal, fence) = Fence::pair();
        match fence.wait(SHORT) {
            Err(CameraError::BufferTimeout) => {}
            other => panic!("expected BufferTimeout, got {other:?}"),
        }
    }

    #[test]
    fn test_failed_fence_reports_signal_error() {
        let (signal, fence) = Fence::pair();
        signal.fail();
        match fence.wait(SHORT) {
            Err(CameraError::BufferSignalError) => {}
            other => panic!("expected BufferSignalError, got {other:?}"),
        }
    }

    #[test]
    fn test_dropped_producer_reports_signal_error() {
        let (signal, fence) = Fence::pair();
        drop(signal);
        match fence.wait(SHORT) {
            Err(CameraError::BufferSignalError) => {}
            other => panic!("expected BufferSignalError, got {other:?}"),
        }
    }
}
