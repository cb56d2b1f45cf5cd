//! Capture request and completion types exchanged with the host.

use std::time::Duration;

use crate::fence::Fence;
use crate::metadata::CaptureSettings;
use crate::types::BufferHandle;

/// One output buffer attached to a capture request.
#[derive(Debug)]
pub struct OutputBuffer {
    /// The configured stream this buffer belongs to.
    pub stream_id: u32,
    /// Opaque external buffer handle.
    pub handle: BufferHandle,
    /// Producer readiness signal; `None` means ready immediately.
    pub acquire: Option<Fence>,
}

/// One caller-issued ask for a single frame.
///
/// An empty settings snapshot means "use the previous request's
/// settings"; the first request after a configuration change must carry a
/// full snapshot.
#[derive(Debug)]
pub struct CaptureRequest {
    /// Monotonic frame identifier assigned by the host.
    pub frame_number: u32,
    /// Settings snapshot, possibly empty.
    pub settings: CaptureSettings,
    /// Optional reprocessing input buffer.
    pub input_buffer: Option<BufferHandle>,
    /// Output buffers to fill; at least one.
    pub output_buffers: Vec<OutputBuffer>,
}

/// Terminal status of one buffer in a completed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferStatus {
    /// The device filled the buffer.
    Ok,
    /// The buffer carries no valid frame data.
    Error,
}

/// One buffer as returned in a capture result.
#[derive(Debug, Clone)]
pub struct CompletedBuffer {
    /// The configured stream this buffer belongs to.
    pub stream_id: u32,
    /// The external handle, returned to the host.
    pub handle: BufferHandle,
    /// Terminal buffer status.
    pub status: BufferStatus,
    /// Bytes the device wrote; 0 on error.
    pub bytes_used: u32,
}

/// The per-frame result delivered through the result callback.
#[derive(Debug, Clone)]
pub struct CaptureResult {
    /// Frame identifier of the originating request.
    pub frame_number: u32,
    /// Completed settings, including frame-specific fields.
    pub settings: CaptureSettings,
    /// The request's input buffer, returned to the host untouched.
    pub input_buffer: Option<BufferHandle>,
    /// All output buffers of the request, each with its terminal status.
    pub buffers: Vec<CompletedBuffer>,
}

/// Out-of-band notification delivered ahead of (or instead of) a result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyEvent {
    /// Start-of-exposure timing for a frame. Delivered before the frame's
    /// result, never after it.
    Shutter {
        /// Frame identifier.
        frame_number: u32,
        /// Effective capture timestamp.
        timestamp: Duration,
    },
    /// The request for this frame failed; a degraded result follows.
    Error {
        /// Frame identifier.
        frame_number: u32,
    },
}
