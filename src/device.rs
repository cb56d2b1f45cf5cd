//! V4L2 device connection: open/close lifecycle and the single
//! serialization point for every kernel-protocol request.
//!
//! All device-protocol operations funnel through one locked ioctl helper;
//! no other module touches the device handle. The transient "interrupted"
//! condition is retried transparently and indefinitely here, since it is
//! not a real failure. This is the only module that needs raw ioctls, and
//! the only one allowed unsafe code.
#![allow(unsafe_code)]

use std::io;
use std::mem;
use std::os::raw::{c_ulong, c_void};
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, error};
use v4l::capability::Flags;
use v4l::v4l2;
use v4l::v4l_sys as sys;
use v4l::video::Capture;

use crate::error::{CameraError, Result};
use crate::traits::VideoDevice;
use crate::types::{
    ControlRange, DequeuedBuffer, DeviceCapabilities, DeviceRegion, FourCC, StreamDirection,
    StreamFormat,
};

// Buffer type and memory mode this device class uses: single-planar video
// capture into user-pointer memory.
const BUF_TYPE_VIDEO_CAPTURE: u32 = 1;
const MEMORY_USERPTR: u32 = 2;
const FIELD_NONE: u32 = 1;

// Extended-control query probe flags.
const CTRL_FLAG_NEXT_CTRL: u32 = 0x8000_0000;
const CTRL_FLAG_NEXT_COMPOUND: u32 = 0x4000_0000;
const CTRL_TYPE_BITMASK: u32 = 8;

const ENOTTY: i32 = 25;

struct ConnState {
    device: Option<v4l::Device>,
    extended_query: bool,
}

/// Exclusive owner of one kernel capture-device handle.
///
/// Only one handle per device path is live at a time; re-connecting while
/// connected is rejected. Every protocol request executes under one
/// internal lock, so the device is never called concurrently from two
/// tasks.
pub struct V4l2Connection {
    path: PathBuf,
    state: Mutex<ConnState>,
}

impl V4l2Connection {
    /// Create an unconnected wrapper for a device path.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(ConnState {
                device: None,
                extended_query: false,
            }),
        }
    }

    /// The device path this connection is bound to.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn state(&self) -> MutexGuard<'_, ConnState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Execute one protocol request under the connection lock.
    fn ioctl_locked<T>(&self, request: v4l2::vidioc::_IOC, arg: &mut T) -> Result<()> {
        let state = self.state();
        let Some(device) = state.device.as_ref() else {
            error!("device {} not connected", self.path.display());
            return Err(CameraError::NotConnected);
        };
        ioctl_retry(device.handle().fd(), request, (arg as *mut T).cast())
    }

    fn query_control_extended(&self, id: u32) -> Result<ControlRange> {
        let mut query = unsafe { mem::zeroed::<sys::v4l2_query_ext_ctrl>() };
        query.id = id;
        self.ioctl_locked(v4l2::vidioc::VIDIOC_QUERY_EXT_CTRL, &mut query)?;
        Ok(ControlRange {
            id: query.id,
            minimum: query.minimum,
            maximum: query.maximum,
            step: query.step,
            default_value: query.default_value,
        })
    }

    fn query_control_basic(&self, id: u32) -> Result<ControlRange> {
        let mut query = unsafe { mem::zeroed::<sys::v4l2_queryctrl>() };
        query.id = id;
        self.ioctl_locked(v4l2::vidioc::VIDIOC_QUERYCTRL, &mut query)?;

        // Widen the 32-bit result into the extended shape. For BITMASK
        // controls max and default are documented as unsigned, so the
        // widening must pad with zeroes.
        #[allow(clippy::cast_sign_loss)]
        let (maximum, default_value) = if query.type_ == CTRL_TYPE_BITMASK {
            (
                i64::from(query.maximum as u32),
                i64::from(query.default_value as u32),
            )
        } else {
            (i64::from(query.maximum), i64::from(query.default_value))
        };
        #[allow(clippy::cast_sign_loss)]
        let step = query.step.max(0) as u64;

        Ok(ControlRange {
            id: query.id,
            minimum: i64::from(query.minimum),
            maximum,
            step,
            default_value,
        })
    }
}

/// Run one ioctl, retrying the transient "interrupted" condition forever.
fn ioctl_retry(fd: RawFd, request: v4l2::vidioc::_IOC, arg: *mut c_void) -> Result<()> {
    loop {
        match unsafe { v4l2::ioctl(fd, request, arg) } {
            Ok(()) => return Ok(()),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(CameraError::from_ioctl(&err)),
        }
    }
}

impl VideoDevice for V4l2Connection {
    fn connect(&self) -> Result<()> {
        let mut state = self.state();
        if state.device.is_some() {
            error!(
                "device {} is already connected, close it first",
                self.path.display()
            );
            return Err(CameraError::AlreadyOpen);
        }

        let device =
            v4l::Device::with_path(&self.path).map_err(CameraError::DeviceUnavailable)?;
        let caps = device
            .query_caps()
            .map_err(CameraError::DeviceUnavailable)?;
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE)
            || !caps.capabilities.contains(Flags::STREAMING)
        {
            error!(
                "{} ({}) is not a streaming capture device",
                self.path.display(),
                caps.card
            );
            return Err(CameraError::DeviceUnavailable(io::Error::new(
                io::ErrorKind::Unsupported,
                "not a streaming video capture device",
            )));
        }

        // Probe for extended control query support. Absence is not an
        // error, just a fallback flag. Already holding the lock, so the
        // ioctl goes straight to the fd.
        let mut query = unsafe { mem::zeroed::<sys::v4l2_query_ext_ctrl>() };
        query.id = CTRL_FLAG_NEXT_CTRL | CTRL_FLAG_NEXT_COMPOUND;
        state.extended_query = ioctl_retry(
            device.handle().fd(),
            v4l2::vidioc::VIDIOC_QUERY_EXT_CTRL,
            (&mut query as *mut sys::v4l2_query_ext_ctrl).cast(),
        )
        .is_ok();

        debug!(
            "connected to {} ({}), extended control query: {}",
            self.path.display(),
            caps.card,
            state.extended_query
        );
        state.device = Some(device);
        Ok(())
    }

    fn disconnect(&self) {
        let mut state = self.state();
        state.device = None;
        state.extended_query = false;
        debug!("disconnected from {}", self.path.display());
    }

    fn is_connected(&self) -> bool {
        self.state().device.is_some()
    }

    fn capabilities(&self) -> Result<DeviceCapabilities> {
        let state = self.state();
        let device = state.device.as_ref().ok_or(CameraError::NotConnected)?;
        let caps = device
            .query_caps()
            .map_err(|err| CameraError::from_ioctl(&err))?;
        Ok(DeviceCapabilities {
            driver: caps.driver,
            card: caps.card,
            bus_info: caps.bus,
            can_capture: caps.capabilities.contains(Flags::VIDEO_CAPTURE),
            can_stream: caps.capabilities.contains(Flags::STREAMING),
        })
    }

    fn set_format(&self, desired: &StreamFormat) -> Result<StreamFormat> {
        // Should be checked by the negotiator; sanity check.
        if desired.direction != StreamDirection::Output {
            error!("only capture-direction formats are supported");
            return Err(CameraError::UnsupportedDirection);
        }

        let mut pix = unsafe { mem::zeroed::<sys::v4l2_pix_format>() };
        pix.width = desired.width;
        pix.height = desired.height;
        pix.pixelformat = desired.fourcc.to_u32();
        pix.field = FIELD_NONE;

        let mut format = unsafe { mem::zeroed::<sys::v4l2_format>() };
        format.type_ = BUF_TYPE_VIDEO_CAPTURE;
        format.fmt.pix = pix;
        self.ioctl_locked(v4l2::vidioc::VIDIOC_S_FMT, &mut format)?;

        let pix = unsafe { format.fmt.pix };
        Ok(StreamFormat {
            fourcc: FourCC::from_u32(pix.pixelformat),
            width: pix.width,
            height: pix.height,
            direction: StreamDirection::Output,
            bytes_per_line: pix.bytesperline,
            size_image: pix.sizeimage,
        })
    }

    fn request_buffers(&self, count: u32) -> Result<u32> {
        let mut request = unsafe { mem::zeroed::<sys::v4l2_requestbuffers>() };
        request.type_ = BUF_TYPE_VIDEO_CAPTURE;
        request.memory = MEMORY_USERPTR;
        request.count = count;
        self.ioctl_locked(v4l2::vidioc::VIDIOC_REQBUFS, &mut request)?;
        Ok(request.count)
    }

    fn enqueue_buffer(&self, index: u32, region: DeviceRegion) -> Result<()> {
        // QUERYBUF first to confirm the buffer slot is in good shape.
        let mut buffer = unsafe { mem::zeroed::<sys::v4l2_buffer>() };
        buffer.type_ = BUF_TYPE_VIDEO_CAPTURE;
        buffer.index = index;
        self.ioctl_locked(v4l2::vidioc::VIDIOC_QUERYBUF, &mut buffer)?;

        buffer.memory = MEMORY_USERPTR;
        buffer.m.userptr = region.addr as c_ulong;
        #[allow(clippy::cast_possible_truncation)]
        {
            buffer.length = region.len as u32;
        }
        self.ioctl_locked(v4l2::vidioc::VIDIOC_QBUF, &mut buffer)
    }

    fn dequeue_buffer(&self) -> Result<DequeuedBuffer> {
        let mut buffer = unsafe { mem::zeroed::<sys::v4l2_buffer>() };
        buffer.type_ = BUF_TYPE_VIDEO_CAPTURE;
        buffer.memory = MEMORY_USERPTR;
        self.ioctl_locked(v4l2::vidioc::VIDIOC_DQBUF, &mut buffer)?;

        // Kernel timestamps are non-negative in practice.
        #[allow(clippy::cast_sign_loss)]
        let secs = buffer.timestamp.tv_sec.max(0) as u64;
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        let nanos = (buffer.timestamp.tv_usec.max(0) as u32).saturating_mul(1000);

        Ok(DequeuedBuffer {
            index: buffer.index,
            bytes_used: buffer.bytesused,
            sequence: buffer.sequence,
            timestamp: Duration::new(secs, nanos),
        })
    }

    fn stream_on(&self) -> Result<()> {
        let mut buf_type = BUF_TYPE_VIDEO_CAPTURE;
        self.ioctl_locked(v4l2::vidioc::VIDIOC_STREAMON, &mut buf_type)
    }

    fn stream_off(&self) -> Result<()> {
        let mut buf_type = BUF_TYPE_VIDEO_CAPTURE;
        self.ioctl_locked(v4l2::vidioc::VIDIOC_STREAMOFF, &mut buf_type)
    }

    fn query_control(&self, id: u32) -> Result<ControlRange> {
        if self.state().extended_query {
            match self.query_control_extended(id) {
                // Only fall back when the extended query itself is
                // unsupported despite the probe.
                Err(CameraError::DeviceError(ENOTTY)) => {}
                result => return result,
            }
        }
        self.query_control_basic(id)
    }

    fn get_control(&self, id: u32) -> Result<i32> {
        let mut control = unsafe { mem::zeroed::<sys::v4l2_control>() };
        control.id = id;
        self.ioctl_locked(v4l2::vidioc::VIDIOC_G_CTRL, &mut control)?;
        Ok(control.value)
    }

    fn set_control(&self, id: u32, value: i32) -> Result<i32> {
        let mut control = unsafe { mem::zeroed::<sys::v4l2_control>() };
        control.id = id;
        control.value = value;
        self.ioctl_locked(v4l2::vidioc::VIDIOC_S_CTRL, &mut control)?;
        Ok(control.value)
    }

    fn supported_formats(&self) -> Result<Vec<FourCC>> {
        let state = self.state();
        let device = state.device.as_ref().ok_or(CameraError::NotConnected)?;
        let descriptions = device
            .enum_formats()
            .map_err(|err| CameraError::from_ioctl(&err))?;
        Ok(descriptions
            .into_iter()
            .map(|description| FourCC::from(description.fourcc))
            .collect())
    }

    fn supported_sizes(&self, fourcc: FourCC) -> Result<Vec<(u32, u32)>> {
        let state = self.state();
        let device = state.device.as_ref().ok_or(CameraError::NotConnected)?;
        let sizes = device
            .enum_framesizes(fourcc.into())
            .map_err(|err| CameraError::from_ioctl(&err))?;

        let mut result = Vec::new();
        for framesize in sizes {
            match framesize.size {
                v4l::framesize::FrameSizeEnum::Discrete(discrete) => {
                    result.push((discrete.width, discrete.height));
                }
                v4l::framesize::FrameSizeEnum::Stepwise(stepwise) => {
                    result.push((stepwise.min_width, stepwise.min_height));
                    result.push((stepwise.max_width, stepwise.max_height));
                }
            }
        }
        Ok(result)
    }
}
