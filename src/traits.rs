//! The three external seams of the HAL: the kernel device protocol it
//! consumes, the buffer allocator it borrows memory through, and the host
//! callbacks it completes requests into.

use crate::error::Result;
use crate::request::{CaptureResult, NotifyEvent};
use crate::types::{
    BufferHandle, ControlRange, DequeuedBuffer, DeviceCapabilities, DeviceRegion, FourCC,
    StreamFormat,
};

/// Abstraction over the kernel capture-device protocol.
///
/// Implementations serialize every operation internally; callers may share
/// one device across threads. The production implementation is
/// [`V4l2Connection`](crate::device::V4l2Connection); tests substitute a
/// mock.
pub trait VideoDevice: Send + Sync {
    /// Open the device node. Fails with `AlreadyOpen` if a handle is
    /// live, `DeviceUnavailable` if the open itself fails.
    fn connect(&self) -> Result<()>;

    /// Release the device handle. Double-disconnect is the caller's bug;
    /// the connection simply resets to invalid.
    fn disconnect(&self);

    /// Whether a device handle is currently live.
    fn is_connected(&self) -> bool;

    /// Driver identity and capability flags.
    fn capabilities(&self) -> Result<DeviceCapabilities>;

    /// Push a capture format and return what the device actually set.
    fn set_format(&self, desired: &StreamFormat) -> Result<StreamFormat>;

    /// Request a buffer pool; the device may clamp the count. Returns the
    /// granted count.
    fn request_buffers(&self, count: u32) -> Result<u32>;

    /// Hand one device-writable region to the device under a buffer
    /// index.
    fn enqueue_buffer(&self, index: u32, region: DeviceRegion) -> Result<()>;

    /// Wait for the device to fill a buffer and take it back.
    fn dequeue_buffer(&self) -> Result<DequeuedBuffer>;

    /// Start the capture stream.
    fn stream_on(&self) -> Result<()>;

    /// Stop the capture stream. The device discards buffers it held.
    fn stream_off(&self) -> Result<()>;

    /// Query range and default of a named control.
    fn query_control(&self, id: u32) -> Result<ControlRange>;

    /// Read a control value.
    fn get_control(&self, id: u32) -> Result<i32>;

    /// Write a control value; returns the value the device settled on.
    fn set_control(&self, id: u32, value: i32) -> Result<i32>;

    /// Pixel formats the device can produce.
    fn supported_formats(&self) -> Result<Vec<FourCC>>;

    /// Frame sizes the device can produce for one format.
    fn supported_sizes(&self, fourcc: FourCC) -> Result<Vec<(u32, u32)>>;
}

/// External buffer allocator collaborator.
///
/// Turns opaque buffer handles into device-writable memory and back.
/// Owns its own synchronization; the HAL never assumes two calls are
/// serialized.
pub trait BufferAllocator: Send + Sync {
    /// Lock a handle for device-native write access with the given line
    /// stride. The returned region stays valid until the handle is
    /// unlocked.
    fn lock(&self, handle: &BufferHandle, bytes_per_line: u32) -> Result<DeviceRegion>;

    /// Release a previously locked handle back to opaque form.
    fn unlock(&self, handle: &BufferHandle) -> Result<()>;
}

/// Host-side completion callbacks.
///
/// For every accepted request the HAL delivers exactly one result, and
/// one notification before it (shutter on success, error otherwise).
/// Callbacks are invoked from the pipeline worker; implementations must
/// not call back into the session from them.
pub trait CameraCallbacks: Send + Sync {
    /// Deliver an out-of-band notification.
    fn notify(&self, event: NotifyEvent);

    /// Deliver a per-frame capture result.
    fn process_result(&self, result: CaptureResult);
}
