//! Mock device, allocator and callback recorder for testing without
//! hardware.
//!
//! The mock device counts every protocol call per operation and supports
//! one-shot failure injection, so tests can observe cache hits, cleanup
//! paths and exactly-once completion.

use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::error::{CameraError, Result};
use crate::request::{CaptureResult, NotifyEvent};
use crate::traits::{BufferAllocator, CameraCallbacks, VideoDevice};
use crate::types::{
    BufferHandle, ControlRange, DequeuedBuffer, DeviceCapabilities, DeviceRegion, FourCC,
    StreamDirection, StreamFormat,
};

/// Operation name for call counting and failure injection.
pub const OP_CONNECT: &str = "connect";
/// See [`OP_CONNECT`].
pub const OP_SET_FORMAT: &str = "set_format";
/// See [`OP_CONNECT`].
pub const OP_REQUEST_BUFFERS: &str = "request_buffers";
/// See [`OP_CONNECT`].
pub const OP_ENQUEUE_BUFFER: &str = "enqueue_buffer";
/// See [`OP_CONNECT`].
pub const OP_DEQUEUE_BUFFER: &str = "dequeue_buffer";
/// See [`OP_CONNECT`].
pub const OP_STREAM_ON: &str = "stream_on";
/// See [`OP_CONNECT`].
pub const OP_STREAM_OFF: &str = "stream_off";
/// See [`OP_CONNECT`].
pub const OP_SET_CONTROL: &str = "set_control";

struct MockState {
    connected: bool,
    format: Option<StreamFormat>,
    substitute: Option<(u32, u32)>,
    streaming: bool,
    queued: VecDeque<(u32, DeviceRegion)>,
    sequence: u32,
    controls: BTreeMap<u32, i32>,
    calls: BTreeMap<&'static str, u32>,
    fail: BTreeMap<&'static str, i32>,
}

/// In-memory device double with per-operation call counters and one-shot
/// failure injection.
pub struct MockDevice {
    buffer_grant: u32,
    state: Mutex<MockState>,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    /// Create a mock device granting a pool of four buffers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer_grant: 4,
            state: Mutex::new(MockState {
                connected: false,
                format: None,
                substitute: None,
                streaming: false,
                queued: VecDeque::new(),
                sequence: 0,
                controls: BTreeMap::new(),
                calls: BTreeMap::new(),
                fail: BTreeMap::new(),
            }),
        }
    }

    /// Override how many buffers the device grants on a pool request.
    #[must_use]
    pub fn with_buffer_grant(mut self, buffer_grant: u32) -> Self {
        self.buffer_grant = buffer_grant;
        self
    }

    /// Make the device silently substitute this size on the next
    /// set-format call.
    pub fn substitute_format(&self, width: u32, height: u32) {
        self.state().substitute = Some((width, height));
    }

    /// Inject a one-shot failure with the given errno for an operation.
    pub fn fail_next(&self, op: &'static str, errno: i32) {
        self.state().fail.insert(op, errno);
    }

    /// Number of times an operation was invoked.
    #[must_use]
    pub fn calls(&self, op: &'static str) -> u32 {
        self.state().calls.get(op).copied().unwrap_or(0)
    }

    /// The last value written to a control, if any.
    #[must_use]
    pub fn control_value(&self, id: u32) -> Option<i32> {
        self.state().controls.get(&id).copied()
    }

    /// Whether the mock stream is currently on.
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.state().streaming
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enter(state: &mut MockState, op: &'static str) -> Result<()> {
        *state.calls.entry(op).or_insert(0) += 1;
        if !state.connected {
            return Err(CameraError::NotConnected);
        }
        if let Some(errno) = state.fail.remove(op) {
            return Err(CameraError::DeviceError(errno));
        }
        Ok(())
    }
}

impl VideoDevice for MockDevice {
    fn connect(&self) -> Result<()> {
        let mut state = self.state();
        *state.calls.entry(OP_CONNECT).or_insert(0) += 1;
        if state.connected {
            return Err(CameraError::AlreadyOpen);
        }
        if let Some(errno) = state.fail.remove(OP_CONNECT) {
            return Err(CameraError::DeviceUnavailable(io::Error::from_raw_os_error(
                errno,
            )));
        }
        state.connected = true;
        Ok(())
    }

    fn disconnect(&self) {
        let mut state = self.state();
        state.connected = false;
        state.format = None;
        state.streaming = false;
        state.queued.clear();
    }

    fn is_connected(&self) -> bool {
        self.state().connected
    }

    fn capabilities(&self) -> Result<DeviceCapabilities> {
        let state = self.state();
        if !state.connected {
            return Err(CameraError::NotConnected);
        }
        Ok(DeviceCapabilities {
            driver: "mock".to_owned(),
            card: "Mock Camera".to_owned(),
            bus_info: "mock:0".to_owned(),
            can_capture: true,
            can_stream: true,
        })
    }

    fn set_format(&self, desired: &StreamFormat) -> Result<StreamFormat> {
        let mut state = self.state();
        Self::enter(&mut state, OP_SET_FORMAT)?;

        let (width, height) = state
            .substitute
            .take()
            .unwrap_or((desired.width, desired.height));
        let bytes_per_line = width * 2; // YUYV
        let actual = StreamFormat {
            fourcc: desired.fourcc,
            width,
            height,
            direction: StreamDirection::Output,
            bytes_per_line,
            size_image: bytes_per_line * height,
        };
        state.format = Some(actual.clone());
        Ok(actual)
    }

    fn request_buffers(&self, _count: u32) -> Result<u32> {
        let mut state = self.state();
        Self::enter(&mut state, OP_REQUEST_BUFFERS)?;
        // A pool request releases anything the device was holding.
        state.queued.clear();
        Ok(self.buffer_grant)
    }

    fn enqueue_buffer(&self, index: u32, region: DeviceRegion) -> Result<()> {
        let mut state = self.state();
        Self::enter(&mut state, OP_ENQUEUE_BUFFER)?;
        if state.format.is_none() {
            return Err(CameraError::DeviceError(22)); // EINVAL
        }
        state.queued.push_back((index, region));
        Ok(())
    }

    fn dequeue_buffer(&self) -> Result<DequeuedBuffer> {
        let mut state = self.state();
        Self::enter(&mut state, OP_DEQUEUE_BUFFER)?;
        let Some((index, region)) = state.queued.pop_front() else {
            return Err(CameraError::DeviceError(11)); // EAGAIN
        };
        state.sequence += 1;
        let sequence = state.sequence;
        #[allow(clippy::cast_possible_truncation)]
        let bytes_used = region.len as u32;
        Ok(DequeuedBuffer {
            index,
            bytes_used,
            sequence,
            timestamp: Duration::from_millis(33 * u64::from(sequence)),
        })
    }

    fn stream_on(&self) -> Result<()> {
        let mut state = self.state();
        Self::enter(&mut state, OP_STREAM_ON)?;
        state.streaming = true;
        Ok(())
    }

    fn stream_off(&self) -> Result<()> {
        let mut state = self.state();
        Self::enter(&mut state, OP_STREAM_OFF)?;
        state.streaming = false;
        state.queued.clear();
        Ok(())
    }

    fn query_control(&self, id: u32) -> Result<ControlRange> {
        let state = self.state();
        if !state.connected {
            return Err(CameraError::NotConnected);
        }
        Ok(ControlRange {
            id,
            minimum: 0,
            maximum: 255,
            step: 1,
            default_value: 0,
        })
    }

    fn get_control(&self, id: u32) -> Result<i32> {
        let state = self.state();
        if !state.connected {
            return Err(CameraError::NotConnected);
        }
        Ok(state.controls.get(&id).copied().unwrap_or(0))
    }

    fn set_control(&self, id: u32, value: i32) -> Result<i32> {
        let mut state = self.state();
        Self::enter(&mut state, OP_SET_CONTROL)?;
        state.controls.insert(id, value);
        Ok(value)
    }

    fn supported_formats(&self) -> Result<Vec<FourCC>> {
        let state = self.state();
        if !state.connected {
            return Err(CameraError::NotConnected);
        }
        Ok(vec![FourCC::YUYV, FourCC::MJPG])
    }

    fn supported_sizes(&self, _fourcc: FourCC) -> Result<Vec<(u32, u32)>> {
        let state = self.state();
        if !state.connected {
            return Err(CameraError::NotConnected);
        }
        Ok(vec![(640, 480), (1280, 720)])
    }
}

/// Allocator double tracking which handles are locked.
pub struct MockAllocator {
    locked: Mutex<Vec<u64>>,
    fail_unlock: Mutex<bool>,
}

impl Default for MockAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAllocator {
    /// Create an allocator with no locks outstanding.
    #[must_use]
    pub fn new() -> Self {
        Self {
            locked: Mutex::new(Vec::new()),
            fail_unlock: Mutex::new(false),
        }
    }

    /// Make every following unlock call fail.
    pub fn fail_unlocks(&self) {
        *self
            .fail_unlock
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = true;
    }

    /// Number of handles currently locked.
    #[must_use]
    pub fn locked_count(&self) -> usize {
        self.locked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl BufferAllocator for MockAllocator {
    fn lock(&self, handle: &BufferHandle, bytes_per_line: u32) -> Result<DeviceRegion> {
        let mut locked = self.locked.lock().unwrap_or_else(PoisonError::into_inner);
        locked.push(handle.id);

        let stride = if bytes_per_line == 0 {
            handle.width * 2
        } else {
            bytes_per_line
        };
        Ok(DeviceRegion {
            addr: 0x1000 * (handle.id as usize + 1),
            len: (stride * handle.height) as usize,
        })
    }

    fn unlock(&self, handle: &BufferHandle) -> Result<()> {
        if *self
            .fail_unlock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
        {
            return Err(CameraError::DeviceError(16)); // EBUSY
        }
        let mut locked = self.locked.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(position) = locked.iter().position(|id| *id == handle.id) {
            locked.swap_remove(position);
        }
        Ok(())
    }
}

/// One recorded callback invocation.
#[derive(Debug, Clone)]
pub enum CallbackEvent {
    /// An out-of-band notification.
    Notify(NotifyEvent),
    /// A per-frame result.
    Result(CaptureResult),
}

/// Callback recorder: stores every invocation in order and lets tests
/// wait for a specific frame's result.
pub struct RecordingCallbacks {
    events: Mutex<Vec<CallbackEvent>>,
    arrived: Condvar,
}

impl Default for RecordingCallbacks {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingCallbacks {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            arrived: Condvar::new(),
        }
    }

    /// Everything recorded so far, in delivery order.
    #[must_use]
    pub fn events(&self) -> Vec<CallbackEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Block until the result for `frame_number` arrives, up to
    /// `timeout`.
    #[must_use]
    pub fn wait_for_result(&self, frame_number: u32, timeout: Duration) -> Option<CaptureResult> {
        let deadline = Instant::now() + timeout;
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            let found = events.iter().find_map(|event| match event {
                CallbackEvent::Result(result) if result.frame_number == frame_number => {
                    Some(result.clone())
                }
                _ => None,
            });
            if found.is_some() {
                return found;
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .arrived
                .wait_timeout(events, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            events = guard;
        }
    }
}

impl CameraCallbacks for RecordingCallbacks {
    fn notify(&self, event: NotifyEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(CallbackEvent::Notify(event));
        self.arrived.notify_all();
    }

    fn process_result(&self, result: CaptureResult) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(CallbackEvent::Result(result));
        self.arrived.notify_all();
    }
}
