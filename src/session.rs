//! Capture session: maps the host-facing lifecycle (open, configure
//! streams, submit request, close) onto the request pipeline.
//!
//! Enforces the per-device single-open invariant and keeps stream
//! reconfiguration mutually exclusive with in-flight requests.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, error, info};

use crate::broker::BufferBroker;
use crate::device::V4l2Connection;
use crate::error::{CameraError, Result};
use crate::metadata::{self, ControlEntry, Metadata, Tag, TemplateKind, Value};
use crate::negotiator::FormatNegotiator;
use crate::pipeline::{RequestPipeline, DEFAULT_BUFFER_TIMEOUT};
use crate::request::CaptureRequest;
use crate::streaming::StreamingController;
use crate::traits::{BufferAllocator, CameraCallbacks, VideoDevice};
use crate::types::StreamDescriptor;

/// Device-class options for a capture session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Whether the device supports only one active format across all
    /// configured streams. True for this V4L2 device class; a limitation
    /// of the hardware, not of the protocol.
    pub single_format: bool,
    /// Bound on waiting for a buffer's producer readiness signal.
    pub buffer_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            single_format: true,
            buffer_timeout: DEFAULT_BUFFER_TIMEOUT,
        }
    }
}

impl SessionOptions {
    /// Override the single-active-format constraint.
    #[must_use]
    pub fn with_single_format(mut self, single_format: bool) -> Self {
        self.single_format = single_format;
        self
    }

    /// Override the buffer readiness wait bound.
    #[must_use]
    pub fn with_buffer_timeout(mut self, buffer_timeout: Duration) -> Self {
        self.buffer_timeout = buffer_timeout;
        self
    }
}

/// One host-visible camera device.
pub struct CaptureSession<D: VideoDevice + 'static> {
    device: Arc<D>,
    negotiator: Arc<FormatNegotiator<D>>,
    streaming: Arc<StreamingController<D>>,
    pipeline: RequestPipeline<D>,
    table: Arc<Vec<ControlEntry>>,
    options: SessionOptions,
    busy: Mutex<bool>,
    active_streams: Mutex<Vec<StreamDescriptor>>,
    templates: Mutex<BTreeMap<TemplateKind, Metadata>>,
    static_info: Mutex<Option<Metadata>>,
}

impl CaptureSession<V4l2Connection> {
    /// Create a session for the V4L2 device at `path`.
    #[must_use]
    pub fn create(
        path: &str,
        allocator: Arc<dyn BufferAllocator>,
        callbacks: Arc<dyn CameraCallbacks>,
        options: SessionOptions,
    ) -> Self {
        Self::with_device(Arc::new(V4l2Connection::new(path)), allocator, callbacks, options)
    }
}

impl<D: VideoDevice + 'static> CaptureSession<D> {
    /// Wire a session over an arbitrary device implementation.
    pub fn with_device(
        device: Arc<D>,
        allocator: Arc<dyn BufferAllocator>,
        callbacks: Arc<dyn CameraCallbacks>,
        options: SessionOptions,
    ) -> Self {
        let broker = Arc::new(BufferBroker::new(Arc::clone(&device), allocator));
        let negotiator = Arc::new(FormatNegotiator::new(
            Arc::clone(&device),
            Arc::clone(&broker),
        ));
        let streaming = Arc::new(StreamingController::new(
            Arc::clone(&device),
            Arc::clone(&broker),
            Arc::clone(&negotiator),
        ));
        let table = Arc::new(metadata::control_table());
        let pipeline = RequestPipeline::new(
            Arc::clone(&device),
            Arc::clone(&negotiator),
            broker,
            Arc::clone(&streaming),
            callbacks,
            Arc::clone(&table),
            options.buffer_timeout,
        );
        Self {
            device,
            negotiator,
            streaming,
            pipeline,
            table,
            options,
            busy: Mutex::new(false),
            active_streams: Mutex::new(Vec::new()),
            templates: Mutex::new(BTreeMap::new()),
            static_info: Mutex::new(None),
        }
    }

    fn busy(&self) -> MutexGuard<'_, bool> {
        self.busy.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open the device. Fails with `AlreadyOpen` while the session is
    /// busy.
    pub fn open(&self) -> Result<()> {
        let mut busy = self.busy();
        if *busy {
            error!("camera device already opened");
            return Err(CameraError::AlreadyOpen);
        }

        self.device.connect()?;
        if let Err(err) = self.pipeline.start() {
            self.device.disconnect();
            return Err(err);
        }
        *busy = true;
        info!("camera device opened");
        Ok(())
    }

    /// Close the device. Completes (with an error) any requests still in
    /// flight before returning; no completion is delivered afterwards.
    pub fn close(&self) -> Result<()> {
        let mut busy = self.busy();
        if !*busy {
            error!("camera device not open");
            return Err(CameraError::NotOpen);
        }

        self.pipeline.shutdown();
        let stop_result = self.streaming.stop();
        self.negotiator.reset();
        self.device.disconnect();
        *busy = false;
        info!("camera device closed");
        stop_result
    }

    /// Replace the active stream configuration.
    ///
    /// Validation is all-or-nothing: on failure the prior configuration
    /// stays active, byte for byte. A successful reconfiguration
    /// invalidates the memoized request settings.
    pub fn configure_streams(&self, streams: &[StreamDescriptor]) -> Result<()> {
        if !*self.busy() {
            return Err(CameraError::NotOpen);
        }
        if streams.is_empty() {
            error!("empty stream configuration");
            return Err(CameraError::InvalidArgument("empty stream configuration"));
        }

        let mut active = self
            .active_streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Self::validate_stream_set(streams, &self.options)?;

        // A configuration change must not overlap a mid-flight request.
        self.pipeline.wait_idle();
        self.pipeline.set_streams(streams.to_vec());
        *active = streams.to_vec();
        debug!("configured {} stream(s)", streams.len());
        Ok(())
    }

    fn validate_stream_set(streams: &[StreamDescriptor], options: &SessionOptions) -> Result<()> {
        let outputs = streams.iter().filter(|s| s.direction.is_output()).count();
        let inputs = streams.iter().filter(|s| s.direction.is_input()).count();
        if outputs < 1 {
            error!("stream configuration must have at least one output");
            return Err(CameraError::InvalidStreamConfiguration(
                "at least one output stream is required",
            ));
        }
        if inputs > 1 {
            error!("stream configuration must have at most one input");
            return Err(CameraError::InvalidStreamConfiguration(
                "at most one input stream is supported",
            ));
        }

        if options.single_format {
            if let Some(first) = streams.first() {
                let mismatched = streams.iter().any(|s| {
                    s.fourcc != first.fourcc
                        || s.width != first.width
                        || s.height != first.height
                });
                if mismatched {
                    error!("device supports only one format and size at a time");
                    return Err(CameraError::InvalidStreamConfiguration(
                        "all streams must share one format and size",
                    ));
                }
            }
        }
        Ok(())
    }

    /// Build (lazily, once per kind) the default settings snapshot for a
    /// template kind.
    pub fn default_settings(&self, kind: TemplateKind) -> Result<Metadata> {
        let mut templates = self
            .templates
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(template) = templates.get(&kind) {
            return Ok(template.clone());
        }
        let template = metadata::build_template(kind, &self.table);
        templates.insert(kind, template.clone());
        Ok(template)
    }

    /// Static device characteristics, built lazily on first use.
    ///
    /// Works before `open`: if the device is not connected, a temporary
    /// connection is made for the queries and released again.
    pub fn static_info(&self) -> Result<Metadata> {
        let mut cached = self
            .static_info
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(info) = cached.as_ref() {
            return Ok(info.clone());
        }

        let was_connected = self.device.is_connected();
        if !was_connected {
            self.device.connect()?;
        }
        let built = self.build_static_info();
        if !was_connected {
            self.device.disconnect();
        }

        let info = built?;
        *cached = Some(info.clone());
        Ok(info)
    }

    fn build_static_info(&self) -> Result<Metadata> {
        let mut info = Metadata::new();
        for entry in self.table.iter() {
            entry.populate_static(&mut info);
        }

        let caps = self.device.capabilities()?;
        info.set(Tag::DeviceDriver, Value::Text(caps.driver));
        info.set(Tag::DeviceCard, Value::Text(caps.card));

        let mut configs = Vec::new();
        for fourcc in self.device.supported_formats()? {
            for (width, height) in self.device.supported_sizes(fourcc)? {
                configs.push((fourcc, width, height));
            }
        }
        info.set(Tag::AvailableStreamConfigs, Value::StreamConfigs(configs));
        Ok(info)
    }

    /// Submit one capture request. See
    /// [`RequestPipeline::submit`](crate::pipeline::RequestPipeline::submit).
    pub fn submit(&self, request: CaptureRequest) -> Result<()> {
        if !*self.busy() {
            return Err(CameraError::NotOpen);
        }
        self.pipeline.submit(request)
    }

    /// The currently active stream configuration.
    #[must_use]
    pub fn active_streams(&self) -> Vec<StreamDescriptor> {
        self.active_streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fence::Fence;
    use crate::metadata::CaptureSettings;
    use crate::mock::{CallbackEvent, MockAllocator, MockDevice, RecordingCallbacks};
    use crate::request::{BufferStatus, OutputBuffer};
    use crate::types::{BufferHandle, FourCC, StreamDirection};

    const WAIT: Duration = Duration::from_millis(2000);

    struct Rig {
        device: Arc<MockDevice>,
        callbacks: Arc<RecordingCallbacks>,
        session: CaptureSession<MockDevice>,
    }

    fn rig() -> Rig {
        rig_with_options(SessionOptions::default())
    }

    fn rig_with_options(options: SessionOptions) -> Rig {
        let device = Arc::new(MockDevice::new());
        let callbacks = Arc::new(RecordingCallbacks::new());
        let session = CaptureSession::with_device(
            Arc::clone(&device),
            Arc::new(MockAllocator::new()),
            Arc::clone(&callbacks),
            options,
        );
        Rig {
            device,
            callbacks,
            session,
        }
    }

    fn stream(id: u32, direction: StreamDirection) -> StreamDescriptor {
        StreamDescriptor {
            id,
            direction,
            fourcc: FourCC::YUYV,
            width: 640,
            height: 480,
        }
    }

    fn request(frame_number: u32) -> CaptureRequest {
        CaptureRequest {
            frame_number,
            settings: metadata::build_template(TemplateKind::Preview, &metadata::control_table()),
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
                acquire: Some(Fence::signaled()),
            }],
        }
    }

    #[test]
    fn test_open_twice_is_already_open() {
        let rig = rig();
        rig.session.open().expect("first open");
        match rig.session.open() {
            Err(CameraError::AlreadyOpen) => {}
            other => panic!("expected AlreadyOpen, got {other:?}"),
        }
        rig.session.close().expect("close");
    }

    #[test]
    fn test_close_without_open_is_not_open() {
        let rig = rig();
        match rig.session.close() {
            Err(CameraError::NotOpen) => {}
            other => panic!("expected NotOpen, got {other:?}"),
        }
    }

    #[test]
    fn test_reopen_after_close() {
        let rig = rig();
        rig.session.open().expect("open");
        rig.session.close().expect("close");
        rig.session.open().expect("re-open");
        rig.session.close().expect("re-close");
        assert!(!rig.device.is_connected());
    }

    #[test]
    fn test_configure_requires_open() {
        let rig = rig();
        match rig
            .session
            .configure_streams(&[stream(0, StreamDirection::Output)])
        {
            Err(CameraError::NotOpen) => {}
            other => panic!("expected NotOpen, got {other:?}"),
        }
    }

    #[test]
    fn test_configure_rejects_empty_set() {
        let rig = rig();
        rig.session.open().expect("open");
        match rig.session.configure_streams(&[]) {
            Err(CameraError::InvalidArgument(_)) => {}
            other => panic!("expected InvalidArgument, got {other:?}"),
        }
        rig.session.close().expect("close");
    }

    #[test]
    fn test_configure_failure_preserves_prior_configuration() {
        let rig = rig();
        rig.session.open().expect("open");
        let good = vec![stream(0, StreamDirection::Output)];
        rig.session.configure_streams(&good).expect("configure");

        // Two input-direction streams: rejected in aggregate.
        let bad = vec![
            stream(1, StreamDirection::Output),
            stream(2, StreamDirection::Input),
            stream(3, StreamDirection::Input),
        ];
        match rig.session.configure_streams(&bad) {
            Err(CameraError::InvalidStreamConfiguration(_)) => {}
            other => panic!("expected InvalidStreamConfiguration, got {other:?}"),
        }
        assert_eq!(rig.session.active_streams(), good);
        rig.session.close().expect("close");
    }

    #[test]
    fn test_configure_rejects_output_less_set() {
        let rig = rig();
        rig.session.open().expect("open");
        match rig
            .session
            .configure_streams(&[stream(0, StreamDirection::Input)])
        {
            Err(CameraError::InvalidStreamConfiguration(_)) => {}
            other => panic!("expected InvalidStreamConfiguration, got {other:?}"),
        }
        rig.session.close().expect("close");
    }

    #[test]
    fn test_single_format_constraint_is_an_option() {
        let mut second = stream(1, StreamDirection::Output);
        second.width = 1280;
        second.height = 720;

        let rig = rig();
        rig.session.open().expect("open");
        match rig
            .session
            .configure_streams(&[stream(0, StreamDirection::Output), second.clone()])
        {
            Err(CameraError::InvalidStreamConfiguration(_)) => {}
            other => panic!("expected InvalidStreamConfiguration, got {other:?}"),
        }
        rig.session.close().expect("close");

        // The same set is accepted when the device class is not limited
        // to a single active format.
        let relaxed = rig_with_options(SessionOptions::default().with_single_format(false));
        relaxed.session.open().expect("open");
        relaxed
            .session
            .configure_streams(&[stream(0, StreamDirection::Output), second])
            .expect("mixed sizes accepted");
        relaxed.session.close().expect("close");
    }

    #[test]
    fn test_submit_requires_open() {
        let rig = rig();
        match rig.session.submit(request(1)) {
            Err(CameraError::NotOpen) => {}
            other => panic!("expected NotOpen, got {other:?}"),
        }
    }

    #[test]
    fn test_first_request_must_carry_settings() {
        let rig = rig();
        rig.session.open().expect("open");
        rig.session
            .configure_streams(&[stream(0, StreamDirection::Output)])
            .expect("configure");

        let mut empty = request(1);
        empty.settings = CaptureSettings::new();
        match rig.session.submit(empty) {
            Err(CameraError::MissingSettings) => {}
            other => panic!("expected MissingSettings, got {other:?}"),
        }
        // Nothing was queued for the rejected request.
        assert!(rig.callbacks.events().is_empty());
        rig.session.close().expect("close");
    }

    #[test]
    fn test_full_capture_scenario() {
        let rig = rig();
        rig.session.open().expect("open");
        rig.session
            .configure_streams(&[stream(0, StreamDirection::Output)])
            .expect("configure");

        let template = rig
            .session
            .default_settings(TemplateKind::Preview)
            .expect("template");
        let mut first = request(11);
        first.settings = template;
        rig.session.submit(first).expect("submit");

        let result = rig.callbacks.wait_for_result(11, WAIT).expect("result");
        assert_eq!(result.frame_number, 11);
        assert_eq!(
            result.buffers.first().expect("buffer").status,
            BufferStatus::Ok
        );
        rig.session.close().expect("close");
    }

    #[test]
    fn test_close_completes_in_flight_requests() {
        let rig = rig();
        rig.session.open().expect("open");
        rig.session
            .configure_streams(&[stream(0, StreamDirection::Output)])
            .expect("configure");
        for frame in 1..=3 {
            rig.session.submit(request(frame)).expect("submit");
        }
        rig.session.close().expect("close");

        // Every accepted request was completed before close returned.
        let results = rig
            .callbacks
            .events()
            .into_iter()
            .filter(|event| matches!(event, CallbackEvent::Result(_)))
            .count();
        assert_eq!(results, 3);
        assert!(!rig.device.is_connected());
    }

    #[test]
    fn test_templates_are_cached() {
        let rig = rig();
        let first = rig
            .session
            .default_settings(TemplateKind::StillCapture)
            .expect("first");
        let second = rig
            .session
            .default_settings(TemplateKind::StillCapture)
            .expect("second");
        assert_eq!(first, second);
    }

    #[test]
    fn test_static_info_uses_temporary_connection() {
        let rig = rig();
        assert!(!rig.device.is_connected());

        let info = rig.session.static_info().expect("static info");
        assert!(info.get(Tag::DeviceDriver).is_some());
        assert!(matches!(
            info.get(Tag::AvailableStreamConfigs),
            Some(Value::StreamConfigs(configs)) if !configs.is_empty()
        ));
        // The temporary connection was released again.
        assert!(!rig.device.is_connected());

        // Second query answers from the cache.
        let again = rig.session.static_info().expect("cached static info");
        assert_eq!(info, again);
    }
}
