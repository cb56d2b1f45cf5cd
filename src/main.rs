//! Demo binary: drive a capture session against a real V4L2 device.

use std::collections::HashMap;
use std::env;
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use v4l2_hal::metadata::Tag;
use v4l2_hal::{
    BufferAllocator, BufferHandle, CameraCallbacks, CaptureRequest, CaptureResult,
    CaptureSession, CaptureSettings, DeviceRegion, Fence, FourCC, NotifyEvent, OutputBuffer,
    SessionOptions, StreamDescriptor, StreamDirection, TemplateKind,
};

const WIDTH: u32 = 640;
const HEIGHT: u32 = 480;
const FRAMES: u32 = 10;

/// Heap-backed reference allocator: every handle gets a buffer that
/// stays alive for the life of the allocator.
struct HeapAllocator {
    buffers: Mutex<HashMap<u64, Box<[u8]>>>,
}

impl HeapAllocator {
    fn new() -> Self {
        Self {
            buffers: Mutex::new(HashMap::new()),
        }
    }
}

impl BufferAllocator for HeapAllocator {
    fn lock(&self, handle: &BufferHandle, bytes_per_line: u32) -> v4l2_hal::Result<DeviceRegion> {
        let stride = if bytes_per_line == 0 {
            handle.width * 2
        } else {
            bytes_per_line
        };
        let len = (stride * handle.height) as usize;

        let mut buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        let buffer = buffers
            .entry(handle.id)
            .or_insert_with(|| vec![0u8; len].into_boxed_slice());
        Ok(DeviceRegion {
            addr: buffer.as_ptr() as usize,
            len: buffer.len(),
        })
    }

    fn unlock(&self, _handle: &BufferHandle) -> v4l2_hal::Result<()> {
        // The memory stays alive for the host to read; nothing to do.
        Ok(())
    }
}

/// Prints every callback and reports completed frame numbers back to the
/// main thread.
struct PrintCallbacks {
    done: Mutex<Sender<u32>>,
}

impl CameraCallbacks for PrintCallbacks {
    fn notify(&self, event: NotifyEvent) {
        match event {
            NotifyEvent::Shutter {
                frame_number,
                timestamp,
            } => println!("shutter frame {frame_number} at {timestamp:?}"),
            NotifyEvent::Error { frame_number } => println!("error on frame {frame_number}"),
        }
    }

    fn process_result(&self, result: CaptureResult) {
        let bytes: u32 = result.buffers.iter().map(|b| b.bytes_used).sum();
        println!(
            "result frame {}: {} buffer(s), {bytes} bytes",
            result.frame_number,
            result.buffers.len()
        );
        let _ = self
            .done
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .send(result.frame_number);
    }
}

fn main() {
    env_logger::init();
    if let Err(err) = run() {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn run() -> v4l2_hal::Result<()> {
    let path = env::args().nth(1).unwrap_or_else(|| "/dev/video0".to_owned());
    let (tx, rx) = mpsc::channel();
    let session = CaptureSession::create(
        &path,
        Arc::new(HeapAllocator::new()),
        Arc::new(PrintCallbacks {
            done: Mutex::new(tx),
        }),
        SessionOptions::default(),
    );

    let info = session.static_info()?;
    if let Some(v4l2_hal::metadata::Value::Text(driver)) = info.get(Tag::DeviceDriver) {
        println!("Driver: {driver}");
    }
    if let Some(v4l2_hal::metadata::Value::Text(card)) = info.get(Tag::DeviceCard) {
        println!("Device: {card}");
    }

    session.open()?;
    session.configure_streams(&[StreamDescriptor {
        id: 0,
        direction: StreamDirection::Output,
        fourcc: FourCC::YUYV,
        width: WIDTH,
        height: HEIGHT,
    }])?;

    let template = session.default_settings(TemplateKind::Preview)?;
    for frame_number in 0..FRAMES {
        // Full settings on the first frame, "use previous" afterwards.
        let settings = if frame_number == 0 {
            template.clone()
        } else {
            CaptureSettings::new()
        };
        session.submit(CaptureRequest {
            frame_number,
            settings,
            input_buffer: None,
            output_buffers: vec![OutputBuffer {
                stream_id: 0,
                handle: BufferHandle {
                    id: u64::from(frame_number % 4),
                    width: WIDTH,
                    height: HEIGHT,
                    fourcc: FourCC::YUYV,
                    bytes_per_line: 0,
                },
                acquire: Some(Fence::signaled()),
            }],
        })?;

        // One request in flight at a time keeps the demo simple.
        if rx.recv_timeout(Duration::from_secs(10)).is_err() {
            eprintln!("no completion for frame {frame_number}");
            break;
        }
    }

    session.close()
}
