//! Core value types shared across the HAL: pixel formats, stream
//! descriptors, negotiated formats and device-side buffer descriptors.

use std::fmt;
use std::time::Duration;

/// Pixel format representation (e.g., YUYV, MJPG, RGB3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Create a new `FourCC` from a 4-byte array.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// YUYV pixel format (4:2:2 packed).
    pub const YUYV: Self = Self::new(b"YUYV");
    /// MJPEG pixel format (Motion JPEG).
    pub const MJPG: Self = Self::new(b"MJPG");
    /// RGB3 pixel format (24-bit RGB).
    pub const RGB3: Self = Self::new(b"RGB3");
    /// NV12 pixel format (4:2:0 semi-planar).
    pub const NV12: Self = Self::new(b"NV12");

    /// Pack into the little-endian u32 used by the kernel interface.
    #[must_use]
    pub const fn to_u32(self) -> u32 {
        u32::from_le_bytes(self.0)
    }

    /// Unpack from the little-endian u32 used by the kernel interface.
    #[must_use]
    pub const fn from_u32(value: u32) -> Self {
        Self(value.to_le_bytes())
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            let ch = if byte.is_ascii_graphic() { byte as char } else { '.' };
            write!(f, "{ch}")?;
        }
        Ok(())
    }
}

impl From<v4l::FourCC> for FourCC {
    fn from(fourcc: v4l::FourCC) -> Self {
        Self(fourcc.repr)
    }
}

impl From<FourCC> for v4l::FourCC {
    fn from(fourcc: FourCC) -> Self {
        Self::new(&fourcc.0)
    }
}

/// Direction of a configured stream, from the device's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDirection {
    /// Device fills buffers for the consumer (capture).
    Output,
    /// Consumer hands filled buffers to the device (reprocessing).
    Input,
    /// Stream is used in both directions.
    Bidirectional,
}

impl StreamDirection {
    /// Whether the device writes into buffers of this stream.
    #[must_use]
    pub const fn is_output(self) -> bool {
        matches!(self, Self::Output | Self::Bidirectional)
    }

    /// Whether the device reads buffers of this stream.
    #[must_use]
    pub const fn is_input(self) -> bool {
        matches!(self, Self::Input | Self::Bidirectional)
    }
}

/// Abstract description of one requested stream, prior to negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDescriptor {
    /// Caller-chosen stream identifier, referenced by request buffers.
    pub id: u32,
    /// Stream direction.
    pub direction: StreamDirection,
    /// Requested pixel encoding.
    pub fourcc: FourCC,
    /// Requested width in pixels.
    pub width: u32,
    /// Requested height in pixels.
    pub height: u32,
}

/// A format negotiated with (or requested from) the device.
///
/// Replaced wholesale on reconfiguration, never mutated in place.
/// Equality compares encoding, size and direction only; line stride and
/// image size are details the device chooses and do not participate in
/// the "already negotiated" comparison.
#[derive(Debug, Clone)]
pub struct StreamFormat {
    /// Pixel encoding.
    pub fourcc: FourCC,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Stream direction.
    pub direction: StreamDirection,
    /// Bytes per line as chosen by the device (0 before negotiation).
    pub bytes_per_line: u32,
    /// Total image size in bytes as chosen by the device.
    pub size_image: u32,
}

impl StreamFormat {
    /// Build a format request from a stream descriptor. Stride and image
    /// size are left to the device.
    #[must_use]
    pub fn from_descriptor(descriptor: &StreamDescriptor) -> Self {
        Self {
            fourcc: descriptor.fourcc,
            width: descriptor.width,
            height: descriptor.height,
            direction: descriptor.direction,
            bytes_per_line: 0,
            size_image: 0,
        }
    }

    /// Whether this negotiated format already satisfies a descriptor.
    #[must_use]
    pub fn satisfies(&self, descriptor: &StreamDescriptor) -> bool {
        self.fourcc == descriptor.fourcc
            && self.width == descriptor.width
            && self.height == descriptor.height
            && self.direction == descriptor.direction
    }
}

impl PartialEq for StreamFormat {
    fn eq(&self, other: &Self) -> bool {
        self.fourcc == other.fourcc
            && self.width == other.width
            && self.height == other.height
            && self.direction == other.direction
    }
}

impl Eq for StreamFormat {}

impl fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}x{}", self.fourcc, self.width, self.height)
    }
}

/// Device capability flags.
#[derive(Debug, Clone, Default)]
pub struct DeviceCapabilities {
    /// Driver name.
    pub driver: String,
    /// Card/device name.
    pub card: String,
    /// Bus information.
    pub bus_info: String,
    /// Whether the device can capture video.
    pub can_capture: bool,
    /// Whether the device supports streaming.
    pub can_stream: bool,
}

/// A device-writable memory region produced by locking an external
/// buffer handle. The address stays valid until the buffer is unlocked.
#[derive(Debug, Clone, Copy)]
pub struct DeviceRegion {
    /// Userspace address handed to the device.
    pub addr: usize,
    /// Region length in bytes.
    pub len: usize,
}

/// Metadata of one buffer dequeued from the device.
#[derive(Debug, Clone, Copy)]
pub struct DequeuedBuffer {
    /// Device buffer index.
    pub index: u32,
    /// Actual bytes written by the device.
    pub bytes_used: u32,
    /// Driver frame sequence number.
    pub sequence: u32,
    /// Capture timestamp.
    pub timestamp: Duration,
}

/// Range and default of one named device control.
#[derive(Debug, Clone, Copy)]
pub struct ControlRange {
    /// Control identifier.
    pub id: u32,
    /// Minimum accepted value.
    pub minimum: i64,
    /// Maximum accepted value.
    pub maximum: i64,
    /// Value step.
    pub step: u64,
    /// Default value.
    pub default_value: i64,
}

/// Opaque external buffer handle, as handed in by the host.
///
/// The pixel storage behind the handle is owned by the external
/// allocator; the HAL only sees geometry for compatibility validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferHandle {
    /// Allocator-scoped buffer identity.
    pub id: u64,
    /// Buffer width in pixels.
    pub width: u32,
    /// Buffer height in pixels.
    pub height: u32,
    /// Pixel encoding of the buffer.
    pub fourcc: FourCC,
    /// Line stride in bytes; 0 when the producer leaves it to the HAL.
    pub bytes_per_line: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fourcc_u32_round_trip() {
        let code = FourCC::YUYV;
        assert_eq!(FourCC::from_u32(code.to_u32()), code);
        assert_eq!(code.to_string(), "YUYV");
    }

    #[test]
    fn test_format_equality_ignores_stride() {
        let descriptor = StreamDescriptor {
            id: 0,
            direction: StreamDirection::Output,
            fourcc: FourCC::YUYV,
            width: 640,
            height: 480,
        };
        let requested = StreamFormat::from_descriptor(&descriptor);
        let mut negotiated = requested.clone();
        negotiated.bytes_per_line = 1280;
        negotiated.size_image = 1280 * 480;

        assert_eq!(requested, negotiated);
        assert!(negotiated.satisfies(&descriptor));
    }

    #[test]
    fn test_format_equality_detects_substitution() {
        let descriptor = StreamDescriptor {
            id: 0,
            direction: StreamDirection::Output,
            fourcc: FourCC::YUYV,
            width: 640,
            height: 480,
        };
        let requested = StreamFormat::from_descriptor(&descriptor);
        let mut substituted = requested.clone();
        substituted.width = 320;
        substituted.height = 240;

        assert_ne!(requested, substituted);
        assert!(!substituted.satisfies(&descriptor));
    }

    #[test]
    fn test_bidirectional_counts_as_both() {
        assert!(StreamDirection::Bidirectional.is_input());
        assert!(StreamDirection::Bidirectional.is_output());
        assert!(!StreamDirection::Output.is_input());
        assert!(!StreamDirection::Input.is_output());
    }
}
