//! Error taxonomy for camera HAL operations.

use std::io;

use thiserror::Error;

use crate::types::FourCC;

/// Error type for camera operations.
///
/// Validation failures (`InvalidArgument`, `MissingSettings`,
/// `InvalidSettings`, `InvalidStreamConfiguration`) are reported
/// synchronously and leave session state untouched. Device-protocol
/// failures surface either synchronously (lifecycle and negotiation calls)
/// or as the error of a per-request completion callback.
#[derive(Debug, Error)]
pub enum CameraError {
    /// Malformed caller input; no state was changed.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The device is already open.
    #[error("device is already open")]
    AlreadyOpen,

    /// The session is not open.
    #[error("device is not open")]
    NotOpen,

    /// No device handle is live.
    #[error("device is not connected")]
    NotConnected,

    /// Opening the device node failed.
    #[error("failed to open device: {0}")]
    DeviceUnavailable(#[source] io::Error),

    /// A device-protocol request failed; carries the OS error code.
    #[error("device request failed (errno {0})")]
    DeviceError(i32),

    /// The device refused or silently substituted the requested format.
    #[error("device does not support format {fourcc} {width}x{height}")]
    UnsupportedFormat {
        /// Requested pixel encoding.
        fourcc: FourCC,
        /// Requested width in pixels.
        width: u32,
        /// Requested height in pixels.
        height: u32,
    },

    /// The stream direction cannot be negotiated on this device.
    #[error("stream direction not supported")]
    UnsupportedDirection,

    /// The stream set failed aggregate validation; the prior
    /// configuration is preserved.
    #[error("invalid stream configuration: {0}")]
    InvalidStreamConfiguration(&'static str),

    /// Streaming was requested before a format was negotiated.
    #[error("stream format must be negotiated before streaming")]
    FormatNotSet,

    /// The device rejected the stream-on request.
    #[error("failed to start streaming (errno {0})")]
    StreamStartFailed(i32),

    /// The buffer is already locked for device access.
    #[error("buffer {0} is already locked")]
    BufferBusy(u64),

    /// Buffer geometry does not match the negotiated format.
    #[error("buffer incompatible with negotiated format: {0}")]
    BufferIncompatible(&'static str),

    /// The device cannot supply any usable buffers.
    #[error("device reports no usable buffers")]
    InsufficientBuffers,

    /// The producer readiness signal never arrived within the bound.
    #[error("timed out waiting for buffer readiness")]
    BufferTimeout,

    /// The producer readiness signal reported an error.
    #[error("buffer readiness signal reported an error")]
    BufferSignalError,

    /// First request of a configuration must carry full settings.
    #[error("request has no settings and none were previously supplied")]
    MissingSettings,

    /// Request settings failed capability validation.
    #[error("request settings rejected: {0}")]
    InvalidSettings(&'static str),
}

impl CameraError {
    /// Map an ioctl failure into `DeviceError` carrying the OS error code.
    pub(crate) fn from_ioctl(err: &io::Error) -> Self {
        Self::DeviceError(err.raw_os_error().unwrap_or(0))
    }
}

/// Result type for camera operations.
pub type Result<T> = std::result::Result<T, CameraError>;
