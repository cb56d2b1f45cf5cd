//! Format negotiation: translating abstract stream descriptors into a
//! device-accepted capture format.
//!
//! The negotiated format is cached; re-negotiating an identical
//! descriptor is free. The device must accept the requested format
//! exactly — a silently substituted format is a failure, since consumers
//! cannot adapt to it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, error, trace};

use crate::broker::BufferBroker;
use crate::error::{CameraError, Result};
use crate::traits::VideoDevice;
use crate::types::{StreamDescriptor, StreamDirection, StreamFormat};

#[derive(Clone)]
struct Negotiated {
    format: StreamFormat,
    max_buffers: u32,
}

/// Negotiates and caches the device capture format.
pub struct FormatNegotiator<D> {
    device: Arc<D>,
    broker: Arc<BufferBroker<D>>,
    current: Mutex<Option<Negotiated>>,
}

impl<D: VideoDevice> FormatNegotiator<D> {
    /// Create a negotiator over a device and its buffer broker.
    pub fn new(device: Arc<D>, broker: Arc<BufferBroker<D>>) -> Self {
        Self {
            device,
            broker,
            current: Mutex::new(None),
        }
    }

    fn current(&self) -> MutexGuard<'_, Option<Negotiated>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Negotiate the device format for a stream descriptor.
    ///
    /// Returns the negotiated format and the maximum number of in-flight
    /// buffers the device supports for it. A repeat negotiation of the
    /// current format performs no device calls.
    pub fn negotiate(&self, descriptor: &StreamDescriptor) -> Result<(StreamFormat, u32)> {
        if descriptor.direction != StreamDirection::Output {
            error!("stream {} is not capture-direction", descriptor.id);
            return Err(CameraError::UnsupportedDirection);
        }

        let mut current = self.current();
        if let Some(negotiated) = current.as_ref() {
            if negotiated.format.satisfies(descriptor) {
                trace!("already in format {}, skipping", negotiated.format);
                return Ok((negotiated.format.clone(), negotiated.max_buffers));
            }
        }

        let desired = StreamFormat::from_descriptor(descriptor);
        let actual = self.device.set_format(&desired)?;
        if actual != desired {
            error!("device substituted {actual} for requested {desired}");
            return Err(CameraError::UnsupportedFormat {
                fourcc: descriptor.fourcc,
                width: descriptor.width,
                height: descriptor.height,
            });
        }

        // Format changed; the old pool (and cache) are gone either way.
        *current = None;
        let max_buffers = self.broker.request_pool(&actual)?;
        debug!("negotiated {actual}, max {max_buffers} buffers");
        *current = Some(Negotiated {
            format: actual.clone(),
            max_buffers,
        });
        Ok((actual, max_buffers))
    }

    /// The currently negotiated format, if any.
    #[must_use]
    pub fn current_format(&self) -> Option<StreamFormat> {
        self.current().as_ref().map(|n| n.format.clone())
    }

    /// Drop the cached format (on disconnect the device forgets it too).
    pub fn reset(&self) {
        *self.current() = None;
    }
}
