//! Streaming state machine: the on/off state of the kernel capture
//! stream.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, error};

use crate::broker::BufferBroker;
use crate::error::{CameraError, Result};
use crate::negotiator::FormatNegotiator;
use crate::traits::VideoDevice;

/// Whether the kernel capture stream is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamingState {
    /// Stream is off; the device holds no buffers.
    Idle,
    /// Stream is on; enqueued buffers are being filled.
    Streaming,
}

/// Owns the Idle/Streaming transitions. Start and stop are idempotent.
pub struct StreamingController<D> {
    device: Arc<D>,
    broker: Arc<BufferBroker<D>>,
    negotiator: Arc<FormatNegotiator<D>>,
    state: Mutex<StreamingState>,
}

impl<D: VideoDevice> StreamingController<D> {
    /// Create a controller in the Idle state.
    pub fn new(
        device: Arc<D>,
        broker: Arc<BufferBroker<D>>,
        negotiator: Arc<FormatNegotiator<D>>,
    ) -> Self {
        Self {
            device,
            broker,
            negotiator,
            state: Mutex::new(StreamingState::Idle),
        }
    }

    fn state_guard(&self) -> MutexGuard<'_, StreamingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current streaming state.
    #[must_use]
    pub fn state(&self) -> StreamingState {
        *self.state_guard()
    }

    /// Turn the stream on. No-op when already streaming; requires a
    /// negotiated format.
    pub fn start(&self) -> Result<()> {
        let mut state = self.state_guard();
        if *state == StreamingState::Streaming {
            return Ok(());
        }
        if self.negotiator.current_format().is_none() {
            error!("stream format must be set before turning on the stream");
            return Err(CameraError::FormatNotSet);
        }

        match self.device.stream_on() {
            Ok(()) => {
                debug!("stream on");
                *state = StreamingState::Streaming;
                Ok(())
            }
            Err(CameraError::DeviceError(code)) => {
                error!("stream-on rejected (errno {code})");
                Err(CameraError::StreamStartFailed(code))
            }
            Err(err) => Err(err),
        }
    }

    /// Turn the stream off. No-op when already idle.
    ///
    /// Stopping always releases every buffer lock, even when the
    /// device-level stop fails: the device discards buffers it was
    /// holding at stream-off either way, and a leaked lock is worse than
    /// a stream that silently stayed on. An unlock failure therefore
    /// outranks a stop failure.
    pub fn stop(&self) -> Result<()> {
        let mut state = self.state_guard();
        if *state == StreamingState::Idle {
            return Ok(());
        }

        let off_result = self.device.stream_off();
        let unlock_result = self.broker.unlock_all();
        *state = StreamingState::Idle;
        debug!("stream off");

        unlock_result?;
        off_result
    }
}
