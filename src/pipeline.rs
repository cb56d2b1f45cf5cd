//! Request pipeline: validates capture requests, drives the device
//! through them on a worker thread, and delivers completion callbacks.
//!
//! Submission is non-blocking for the caller apart from the bounded
//! buffer-readiness waits. Accepted requests enter a FIFO queue drained
//! by one worker; for each request the worker negotiates the format,
//! ensures streaming, locks and enqueues the buffers, drains the filled
//! frames and completes the request. Every accepted request is completed
//! exactly once, error or success, so callers never wait forever.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, trace, warn};

use crate::broker::BufferBroker;
use crate::error::{CameraError, Result};
use crate::metadata::{self, CaptureSettings, ControlEntry, Tag, Value};
use crate::negotiator::FormatNegotiator;
use crate::request::{
    BufferStatus, CaptureRequest, CaptureResult, CompletedBuffer, NotifyEvent,
};
use crate::streaming::StreamingController;
use crate::traits::{CameraCallbacks, VideoDevice};
use crate::types::{BufferHandle, StreamDescriptor};

/// Bound on waiting for a buffer's producer readiness signal.
pub const DEFAULT_BUFFER_TIMEOUT: Duration = Duration::from_millis(5000);

struct PendingBuffer {
    stream_id: u32,
    handle: BufferHandle,
    bytes_used: u32,
    status: BufferStatus,
}

struct PendingRequest {
    frame_number: u32,
    settings: CaptureSettings,
    descriptor: StreamDescriptor,
    input_buffer: Option<BufferHandle>,
    buffers: Vec<PendingBuffer>,
    // A readiness failure still yields a completion callback; the worker
    // turns this into the completion error without touching the device.
    precheck_failure: Option<CameraError>,
}

enum WorkerCmd {
    Process(Box<PendingRequest>),
    Shutdown,
}

struct InFlight {
    count: Mutex<usize>,
    idle: Condvar,
}

impl InFlight {
    fn new() -> Self {
        Self {
            count: Mutex::new(0),
            idle: Condvar::new(),
        }
    }

    fn count_guard(&self) -> MutexGuard<'_, usize> {
        self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn add(&self) {
        *self.count_guard() += 1;
    }

    fn done(&self) {
        let mut count = self.count_guard();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    fn wait_idle(&self) {
        let mut count = self.count_guard();
        while *count > 0 {
            count = self
                .idle
                .wait(count)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

struct WorkerCtx<D> {
    device: Arc<D>,
    negotiator: Arc<FormatNegotiator<D>>,
    broker: Arc<BufferBroker<D>>,
    streaming: Arc<StreamingController<D>>,
    callbacks: Arc<dyn CameraCallbacks>,
    table: Arc<Vec<ControlEntry>>,
    in_flight: Arc<InFlight>,
    draining: Arc<AtomicBool>,
}

struct PipelineState {
    tx: Option<Sender<WorkerCmd>>,
    worker: Option<JoinHandle<()>>,
    last_settings: Option<CaptureSettings>,
    streams: Vec<StreamDescriptor>,
}

/// Validates and executes capture requests end to end.
pub struct RequestPipeline<D: VideoDevice + 'static> {
    device: Arc<D>,
    negotiator: Arc<FormatNegotiator<D>>,
    broker: Arc<BufferBroker<D>>,
    streaming: Arc<StreamingController<D>>,
    callbacks: Arc<dyn CameraCallbacks>,
    table: Arc<Vec<ControlEntry>>,
    buffer_timeout: Duration,
    state: Mutex<PipelineState>,
    in_flight: Arc<InFlight>,
    draining: Arc<AtomicBool>,
}

impl<D: VideoDevice + 'static> RequestPipeline<D> {
    /// Wire a pipeline over the device-control components.
    pub fn new(
        device: Arc<D>,
        negotiator: Arc<FormatNegotiator<D>>,
        broker: Arc<BufferBroker<D>>,
        streaming: Arc<StreamingController<D>>,
        callbacks: Arc<dyn CameraCallbacks>,
        table: Arc<Vec<ControlEntry>>,
        buffer_timeout: Duration,
    ) -> Self {
        Self {
            device,
            negotiator,
            broker,
            streaming,
            callbacks,
            table,
            buffer_timeout,
            state: Mutex::new(PipelineState {
                tx: None,
                worker: None,
                last_settings: None,
                streams: Vec::new(),
            }),
            in_flight: Arc::new(InFlight::new()),
            draining: Arc::new(AtomicBool::new(false)),
        }
    }

    fn state(&self) -> MutexGuard<'_, PipelineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn the worker. No-op if it is already running.
    pub fn start(&self) -> Result<()> {
        let mut state = self.state();
        if state.tx.is_some() {
            return Ok(());
        }

        self.draining.store(false, Ordering::Release);
        let (tx, rx) = mpsc::channel();
        let ctx = WorkerCtx {
            device: Arc::clone(&self.device),
            negotiator: Arc::clone(&self.negotiator),
            broker: Arc::clone(&self.broker),
            streaming: Arc::clone(&self.streaming),
            callbacks: Arc::clone(&self.callbacks),
            table: Arc::clone(&self.table),
            in_flight: Arc::clone(&self.in_flight),
            draining: Arc::clone(&self.draining),
        };
        let worker = thread::Builder::new()
            .name("capture-worker".into())
            .spawn(move || worker_loop(&rx, &ctx))
            .map_err(CameraError::DeviceUnavailable)?;

        state.tx = Some(tx);
        state.worker = Some(worker);
        Ok(())
    }

    /// Stop the worker, completing every request still in flight with an
    /// error first. No completion is delivered after this returns.
    pub fn shutdown(&self) {
        let (tx, worker) = {
            let mut state = self.state();
            (state.tx.take(), state.worker.take())
        };
        // Anything still queued completes with an error, not a capture.
        self.draining.store(true, Ordering::Release);
        if let Some(tx) = tx {
            let _ = tx.send(WorkerCmd::Shutdown);
        }
        if let Some(worker) = worker {
            if worker.join().is_err() {
                error!("capture worker panicked during shutdown");
            }
        }
    }

    /// Install the active stream set and invalidate memoized settings —
    /// a fresh configuration requires fresh full settings.
    pub fn set_streams(&self, streams: Vec<StreamDescriptor>) {
        let mut state = self.state();
        state.streams = streams;
        state.last_settings = None;
    }

    /// Block until no request is pending or in flight.
    pub fn wait_idle(&self) {
        self.in_flight.wait_idle();
    }

    /// Validate a capture request and queue it for execution.
    ///
    /// Success means "accepted for processing": the result arrives later
    /// through the callbacks. Validation failures are rejected here and
    /// never enter the queue.
    pub fn submit(&self, mut request: CaptureRequest) -> Result<()> {
        trace!("submit frame {}", request.frame_number);
        if request.output_buffers.is_empty() {
            error!(
                "frame {}: request has no output buffers",
                request.frame_number
            );
            return Err(CameraError::InvalidArgument(
                "request has no output buffers",
            ));
        }
        if request.input_buffer.is_some() {
            debug!("frame {}: reprocessing input buffer", request.frame_number);
        }

        let (tx, settings, descriptor) = {
            let mut state = self.state();
            let Some(tx) = state.tx.clone() else {
                return Err(CameraError::NotOpen);
            };

            // Empty settings mean "use the previous request's settings";
            // the first request of a configuration must carry them.
            let settings = if request.settings.is_empty() {
                match state.last_settings.clone() {
                    Some(previous) => previous,
                    None => {
                        error!(
                            "frame {}: empty settings without a previous set",
                            request.frame_number
                        );
                        return Err(CameraError::MissingSettings);
                    }
                }
            } else {
                request.settings.clone()
            };
            metadata::validate_settings(&self.table, &settings)?;

            for buffer in &request.output_buffers {
                if !state.streams.iter().any(|s| s.id == buffer.stream_id) {
                    return Err(CameraError::InvalidArgument(
                        "buffer references an unknown stream",
                    ));
                }
            }
            let descriptor = request
                .output_buffers
                .first()
                .and_then(|buffer| state.streams.iter().find(|s| s.id == buffer.stream_id))
                .cloned()
                .ok_or(CameraError::InvalidArgument(
                    "request has no output buffers",
                ))?;

            // The request is now accepted; remember its settings for
            // empty follow-ups.
            state.last_settings = Some(settings.clone());
            (tx, settings, descriptor)
        };

        // Wait on producer readiness outside every lock; this blocks the
        // calling path only, never the pipeline or the device.
        let mut precheck_failure = None;
        for buffer in &mut request.output_buffers {
            if let Some(fence) = buffer.acquire.take() {
                if let Err(err) = fence.wait(self.buffer_timeout) {
                    warn!(
                        "frame {}: buffer {} readiness failed: {err}",
                        request.frame_number, buffer.handle.id
                    );
                    precheck_failure = Some(err);
                    break;
                }
            }
        }

        let pending = Box::new(PendingRequest {
            frame_number: request.frame_number,
            settings,
            descriptor,
            input_buffer: request.input_buffer,
            buffers: request
                .output_buffers
                .into_iter()
                .map(|buffer| PendingBuffer {
                    stream_id: buffer.stream_id,
                    handle: buffer.handle,
                    bytes_used: 0,
                    status: BufferStatus::Ok,
                })
                .collect(),
            precheck_failure,
        });

        self.in_flight.add();
        if tx.send(WorkerCmd::Process(pending)).is_err() {
            self.in_flight.done();
            return Err(CameraError::NotOpen);
        }
        Ok(())
    }
}

fn worker_loop<D: VideoDevice>(rx: &Receiver<WorkerCmd>, ctx: &WorkerCtx<D>) {
    while let Ok(cmd) = rx.recv() {
        match cmd {
            WorkerCmd::Process(mut pending) => {
                let outcome = if ctx.draining.load(Ordering::Acquire) {
                    // Forced drain: the session is closing.
                    Err(CameraError::NotConnected)
                } else if let Some(err) = pending.precheck_failure.take() {
                    Err(err)
                } else {
                    execute(ctx, &mut pending)
                };
                complete(ctx, *pending, outcome);
            }
            WorkerCmd::Shutdown => break,
        }
    }
}

fn execute<D: VideoDevice>(ctx: &WorkerCtx<D>, pending: &mut PendingRequest) -> Result<()> {
    let result = drive_device(ctx, pending);
    if result.is_err() {
        // Leave the device in its most recoverable state: stream
        // stopped, every buffer unlocked.
        if let Err(stop_err) = ctx.streaming.stop() {
            warn!(
                "frame {}: cleanup stop failed: {stop_err}",
                pending.frame_number
            );
        }
    }
    result
}

fn drive_device<D: VideoDevice>(ctx: &WorkerCtx<D>, pending: &mut PendingRequest) -> Result<()> {
    let (format, _max_buffers) = ctx.negotiator.negotiate(&pending.descriptor)?;
    ctx.streaming.start()?;
    metadata::apply_settings(&ctx.table, ctx.device.as_ref(), &pending.settings)?;

    // Device buffer index → position in the request's buffer list.
    let mut enqueued: HashMap<u32, usize> = HashMap::new();
    for (position, buffer) in pending.buffers.iter().enumerate() {
        let (index, region) = ctx.broker.lock(&format, &buffer.handle)?;
        if let Err(err) = ctx.device.enqueue_buffer(index, region) {
            let _ = ctx.broker.unlock(index);
            return Err(err);
        }
        enqueued.insert(index, position);
    }

    for _ in 0..pending.buffers.len() {
        let done = ctx.device.dequeue_buffer()?;
        if let Some(position) = enqueued.remove(&done.index) {
            if let Some(buffer) = pending.buffers.get_mut(position) {
                buffer.bytes_used = done.bytes_used;
            }
        }
        pending.settings.set(
            Tag::SensorTimestamp,
            Value::Long(metadata::timestamp_nanos(done.timestamp)),
        );
        ctx.broker.unlock(done.index)?;
    }
    Ok(())
}

fn complete<D: VideoDevice>(ctx: &WorkerCtx<D>, mut pending: PendingRequest, outcome: Result<()>) {
    let frame_number = pending.frame_number;
    let succeeded = match outcome {
        Ok(()) => match pending.settings.long(Tag::SensorTimestamp) {
            Some(nanos) => {
                #[allow(clippy::cast_sign_loss)]
                let timestamp = Duration::from_nanos(nanos.max(0) as u64);
                ctx.callbacks.notify(NotifyEvent::Shutter {
                    frame_number,
                    timestamp,
                });
                true
            }
            None => {
                error!("frame {frame_number} is missing its capture timestamp");
                false
            }
        },
        Err(err) => {
            error!("error completing request for frame {frame_number}: {err}");
            false
        }
    };

    if !succeeded {
        ctx.callbacks.notify(NotifyEvent::Error { frame_number });
        for buffer in &mut pending.buffers {
            buffer.status = BufferStatus::Error;
            buffer.bytes_used = 0;
        }
    }

    let result = CaptureResult {
        frame_number,
        settings: pending.settings,
        input_buffer: pending.input_buffer,
        buffers: pending
            .buffers
            .into_iter()
            .map(|buffer| CompletedBuffer {
                stream_id: buffer.stream_id,
                handle: buffer.handle,
                status: buffer.status,
                bytes_used: buffer.bytes_used,
            })
            .collect(),
    };
    ctx.callbacks.process_result(result);
    ctx.in_flight.done();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fence::Fence;
    use crate::metadata::{build_template, control_table, TemplateKind};
    use crate::mock::{
        CallbackEvent, MockAllocator, MockDevice, RecordingCallbacks, OP_ENQUEUE_BUFFER,
        OP_STREAM_OFF,
    };
    use crate::request::OutputBuffer;
    use crate::types::{FourCC, StreamDirection};

    const WAIT: Duration = Duration::from_millis(2000);

    struct Rig {
        device: Arc<MockDevice>,
        broker: Arc<BufferBroker<MockDevice>>,
        streaming: Arc<StreamingController<MockDevice>>,
        callbacks: Arc<RecordingCallbacks>,
        pipeline: RequestPipeline<MockDevice>,
    }

    fn rig() -> Rig {
        rig_with_timeout(DEFAULT_BUFFER_TIMEOUT)
    }

    fn rig_with_timeout(buffer_timeout: Duration) -> Rig {
        let device = Arc::new(MockDevice::new());
        device.connect().expect("mock connect");
        let broker = Arc::new(BufferBroker::new(
            Arc::clone(&device),
            Arc::new(MockAllocator::new()),
        ));
        let negotiator = Arc::new(FormatNegotiator::new(
            Arc::clone(&device),
            Arc::clone(&broker),
        ));
        let streaming = Arc::new(StreamingController::new(
            Arc::clone(&device),
            Arc::clone(&broker),
            Arc::clone(&negotiator),
        ));
        let callbacks = Arc::new(RecordingCallbacks::new());
        let table = Arc::new(control_table());
        let pipeline = RequestPipeline::new(
            Arc::clone(&device),
            negotiator,
            Arc::clone(&broker),
            Arc::clone(&streaming),
            Arc::clone(&callbacks),
            table,
            buffer_timeout,
        );
        pipeline.start().expect("start worker");
        pipeline.set_streams(vec![StreamDescriptor {
            id: 0,
            direction: StreamDirection::Output,
            fourcc: FourCC::YUYV,
            width: 640,
            height: 480,
        }]);
        Rig {
            device,
            broker,
            streaming,
            callbacks,
            pipeline,
        }
    }

    fn request(frame_number: u32, settings: CaptureSettings, fence: Option<Fence>) -> CaptureRequest {
        CaptureRequest {
            frame_number,
            settings,
            input_buffer: None,
            output_buffers: vec![OutputBuffer {
                stream_id: 0,
                handle: BufferHandle {
                    id: u64::from(frame_number),
                    width: 640,
                    height: 480,
                    fourcc: FourCC::YUYV,
                    bytes_per_line: 0,
                },
                acquire: fence,
            }],
        }
    }

    fn full_settings() -> CaptureSettings {
        build_template(TemplateKind::Preview, &control_table())
    }

    #[test]
    fn test_zero_buffers_is_invalid_argument() {
        let rig = rig();
        let request = CaptureRequest {
            frame_number: 1,
            settings: full_settings(),
            input_buffer: None,
            output_buffers: Vec::new(),
        };
        match rig.pipeline.submit(request) {
            Err(CameraError::InvalidArgument(_)) => {}
            other => panic!("expected InvalidArgument, got {other:?}"),
        }
        rig.pipeline.shutdown();
        assert!(rig.callbacks.events().is_empty());
    }

    #[test]
    fn test_empty_settings_without_history_is_rejected() {
        let rig = rig();
        match rig.pipeline.submit(request(1, CaptureSettings::new(), None)) {
            Err(CameraError::MissingSettings) => {}
            other => panic!("expected MissingSettings, got {other:?}"),
        }
        rig.pipeline.shutdown();
        // Rejected synchronously: nothing was queued, no callback fired.
        assert!(rig.callbacks.events().is_empty());
    }

    #[test]
    fn test_successful_capture_completes_once() {
        let rig = rig();
        rig.pipeline
            .submit(request(7, full_settings(), Some(Fence::signaled())))
            .expect("submit");

        let result = rig.callbacks.wait_for_result(7, WAIT).expect("result");
        assert_eq!(result.frame_number, 7);
        assert_eq!(result.buffers.len(), 1);
        assert_eq!(result.buffers.first().expect("buffer").status, BufferStatus::Ok);
        assert!(result.settings.long(Tag::SensorTimestamp).is_some());

        rig.pipeline.shutdown();
        let results = rig
            .callbacks
            .events()
            .into_iter()
            .filter(|event| matches!(event, CallbackEvent::Result(_)))
            .count();
        assert_eq!(results, 1);
        // All buffer locks were returned.
        assert_eq!(rig.broker.locked_count(), 0);
    }

    #[test]
    fn test_shutter_precedes_result() {
        let rig = rig();
        for frame in 1..=3 {
            rig.pipeline
                .submit(request(frame, full_settings(), Some(Fence::signaled())))
                .expect("submit");
        }
        rig.pipeline.wait_idle();
        rig.pipeline.shutdown();

        let events = rig.callbacks.events();
        for frame in 1..=3u32 {
            let shutter = events
                .iter()
                .position(|event| {
                    matches!(event, CallbackEvent::Notify(NotifyEvent::Shutter { frame_number, .. })
                        if *frame_number == frame)
                })
                .expect("shutter observed");
            let result = events
                .iter()
                .position(|event| {
                    matches!(event, CallbackEvent::Result(result) if result.frame_number == frame)
                })
                .expect("result observed");
            assert!(
                shutter < result,
                "shutter for frame {frame} must precede its result"
            );
        }
    }

    #[test]
    fn test_requests_complete_in_submission_order() {
        let rig = rig();
        for frame in 1..=4 {
            rig.pipeline
                .submit(request(frame, full_settings(), None))
                .expect("submit");
        }
        rig.pipeline.wait_idle();
        rig.pipeline.shutdown();

        let completed: Vec<u32> = rig
            .callbacks
            .events()
            .into_iter()
            .filter_map(|event| match event {
                CallbackEvent::Result(result) => Some(result.frame_number),
                CallbackEvent::Notify(_) => None,
            })
            .collect();
        assert_eq!(completed, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_failed_readiness_signal_completes_with_error() {
        let rig = rig();
        let (signal, fence) = Fence::pair();
        signal.fail();

        rig.pipeline
            .submit(request(3, full_settings(), Some(fence)))
            .expect("submit is accepted");

        let result = rig.callbacks.wait_for_result(3, WAIT).expect("result");
        assert_eq!(
            result.buffers.first().expect("buffer").status,
            BufferStatus::Error
        );
        // The device was never asked to enqueue the errored buffer.
        assert_eq!(rig.device.calls(OP_ENQUEUE_BUFFER), 0);

        let events = rig.callbacks.events();
        assert!(events
            .iter()
            .any(|event| matches!(event, CallbackEvent::Notify(NotifyEvent::Error { frame_number: 3 }))));
        rig.pipeline.shutdown();
    }

    #[test]
    fn test_readiness_timeout_completes_with_error() {
        let rig = rig_with_timeout(Duration::from_millis(50));
        let (_signal, fence) = Fence::pair(); // never signaled, kept alive

        rig.pipeline
            .submit(request(9, full_settings(), Some(fence)))
            .expect("submit is accepted");

        let result = rig.callbacks.wait_for_result(9, WAIT).expect("result");
        assert_eq!(
            result.buffers.first().expect("buffer").status,
            BufferStatus::Error
        );
        assert_eq!(rig.device.calls(OP_ENQUEUE_BUFFER), 0);
        rig.pipeline.shutdown();
    }

    #[test]
    fn test_device_failure_stops_stream_and_completes() {
        let rig = rig();
        rig.device.fail_next(OP_ENQUEUE_BUFFER, 5); // EIO

        rig.pipeline
            .submit(request(2, full_settings(), None))
            .expect("submit");

        let result = rig.callbacks.wait_for_result(2, WAIT).expect("result");
        assert_eq!(
            result.buffers.first().expect("buffer").status,
            BufferStatus::Error
        );
        // Recovery: stream stopped, no lock leaked.
        assert_eq!(rig.device.calls(OP_STREAM_OFF), 1);
        assert_eq!(rig.broker.locked_count(), 0);
        rig.pipeline.shutdown();

        let results = rig
            .callbacks
            .events()
            .into_iter()
            .filter(|event| matches!(event, CallbackEvent::Result(_)))
            .count();
        assert_eq!(results, 1);
    }

    #[test]
    fn test_empty_settings_reuse_previous() {
        let rig = rig();
        rig.pipeline
            .submit(request(1, full_settings(), None))
            .expect("first submit");
        rig.pipeline
            .submit(request(2, CaptureSettings::new(), None))
            .expect("empty follow-up");

        let result = rig.callbacks.wait_for_result(2, WAIT).expect("result");
        assert_eq!(
            result.buffers.first().expect("buffer").status,
            BufferStatus::Ok
        );
        // The follow-up ran under the memoized settings.
        assert!(result.settings.byte(Tag::CaptureIntent).is_some());
        rig.pipeline.shutdown();
    }

    #[test]
    fn test_reconfiguration_invalidates_memoized_settings() {
        let rig = rig();
        rig.pipeline
            .submit(request(1, full_settings(), None))
            .expect("first submit");
        rig.pipeline.wait_idle();

        rig.pipeline.set_streams(vec![StreamDescriptor {
            id: 0,
            direction: StreamDirection::Output,
            fourcc: FourCC::YUYV,
            width: 640,
            height: 480,
        }]);
        match rig.pipeline.submit(request(2, CaptureSettings::new(), None)) {
            Err(CameraError::MissingSettings) => {}
            other => panic!("expected MissingSettings, got {other:?}"),
        }
        rig.pipeline.shutdown();
    }

    #[test]
    fn test_unknown_stream_is_rejected() {
        let rig = rig();
        let mut bad = request(1, full_settings(), None);
        if let Some(buffer) = bad.output_buffers.first_mut() {
            buffer.stream_id = 42;
        }
        match rig.pipeline.submit(bad) {
            Err(CameraError::InvalidArgument(_)) => {}
            other => panic!("expected InvalidArgument, got {other:?}"),
        }
        rig.pipeline.shutdown();
    }

    #[test]
    fn test_shutdown_drains_queued_requests_with_error() {
        let rig = rig();
        // Queue a burst, then shut down immediately; every accepted
        // request still gets exactly one completion.
        for frame in 1..=5 {
            rig.pipeline
                .submit(request(frame, full_settings(), None))
                .expect("submit");
        }
        rig.pipeline.shutdown();

        let completed: Vec<u32> = rig
            .callbacks
            .events()
            .into_iter()
            .filter_map(|event| match event {
                CallbackEvent::Result(result) => Some(result.frame_number),
                CallbackEvent::Notify(_) => None,
            })
            .collect();
        assert_eq!(completed, vec![1, 2, 3, 4, 5]);
    }
}
