//! Settings snapshots, static characteristics and the property/control
//! table.
//!
//! Per-frame settings and per-device characteristics share one key→value
//! representation ([`Metadata`]). What the device can express is described
//! by a table of [`ControlEntry`] values: a tagged union of fixed
//! properties, controls mapped onto device controls, and controls that are
//! accepted but not wired to hardware. Every entry exposes the same
//! capability set: populate static info, populate template defaults,
//! validate a request, apply a request to the device.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::{CameraError, Result};
use crate::traits::VideoDevice;
use crate::types::FourCC;

/// Metadata keys understood by this HAL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tag {
    // Static characteristics.
    /// Which way the camera faces.
    LensFacing,
    /// Sensor mounting orientation in degrees.
    SensorOrientation,
    /// Lens focal length in millimeters.
    LensFocalLength,
    /// Lens aperture (f-number).
    LensAperture,
    /// Maximum digital zoom factor.
    MaxDigitalZoom,
    /// Kernel driver identity.
    DeviceDriver,
    /// Card/device name.
    DeviceCard,
    /// Stream configurations the device can produce.
    AvailableStreamConfigs,
    /// Option values accepted for [`Tag::AwbMode`].
    AvailableAwbModes,
    /// Option values accepted for [`Tag::AeAntibandingMode`].
    AvailableAntibandingModes,

    // Request / result settings.
    /// Intended use of the capture (preview, still, ...).
    CaptureIntent,
    /// Auto-exposure mode.
    AeMode,
    /// Anti-banding mode.
    AeAntibandingMode,
    /// Target frames-per-second range.
    AeTargetFpsRange,
    /// Auto-white-balance mode.
    AwbMode,
    /// Auto-focus mode.
    AfMode,
    /// Auto-focus trigger.
    AfTrigger,
    /// Flash mode.
    FlashMode,
    /// Frame duration in nanoseconds.
    SensorFrameDuration,
    /// Start-of-exposure timestamp in nanoseconds, filled per frame.
    SensorTimestamp,
}

/// One metadata value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Byte-sized enum value.
    Byte(u8),
    /// 32-bit integer.
    Int(i32),
    /// 64-bit integer.
    Long(i64),
    /// Floating point value.
    Float(f32),
    /// Pair of 32-bit integers (e.g. an FPS range).
    IntPair(i32, i32),
    /// List of byte-sized enum values.
    Bytes(Vec<u8>),
    /// Free-form text (driver names and the like).
    Text(String),
    /// Stream configurations: encoding plus frame size.
    StreamConfigs(Vec<(FourCC, u32, u32)>),
}

/// Key→value metadata map used for both per-frame settings snapshots and
/// static characteristics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metadata {
    entries: BTreeMap<Tag, Value>,
}

/// A per-frame settings snapshot.
pub type CaptureSettings = Metadata;

impl Metadata {
    /// Create an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the map carries no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Insert or replace one entry.
    pub fn set(&mut self, tag: Tag, value: Value) {
        self.entries.insert(tag, value);
    }

    /// Look up one entry.
    #[must_use]
    pub fn get(&self, tag: Tag) -> Option<&Value> {
        self.entries.get(&tag)
    }

    /// Look up a byte-sized enum entry.
    #[must_use]
    pub fn byte(&self, tag: Tag) -> Option<u8> {
        match self.entries.get(&tag) {
            Some(Value::Byte(value)) => Some(*value),
            _ => None,
        }
    }

    /// Look up a 64-bit integer entry.
    #[must_use]
    pub fn long(&self, tag: Tag) -> Option<i64> {
        match self.entries.get(&tag) {
            Some(Value::Long(value)) => Some(*value),
            _ => None,
        }
    }
}

/// Well-known byte values for the enum-typed tags.
pub mod values {
    /// The camera is externally attached (USB and the like).
    pub const LENS_FACING_EXTERNAL: u8 = 2;

    /// Auto-white-balance off.
    pub const AWB_MODE_OFF: u8 = 0;
    /// Auto-white-balance on.
    pub const AWB_MODE_AUTO: u8 = 1;

    /// Anti-banding disabled.
    pub const ANTIBANDING_OFF: u8 = 0;
    /// 50 Hz anti-banding.
    pub const ANTIBANDING_50HZ: u8 = 1;
    /// 60 Hz anti-banding.
    pub const ANTIBANDING_60HZ: u8 = 2;
    /// Driver-chosen anti-banding.
    pub const ANTIBANDING_AUTO: u8 = 3;

    /// Auto-exposure enabled.
    pub const AE_MODE_ON: u8 = 1;
    /// Auto-focus disabled (fixed focus).
    pub const AF_MODE_OFF: u8 = 0;
    /// No auto-focus trigger pending.
    pub const AF_TRIGGER_IDLE: u8 = 0;
    /// Flash disabled.
    pub const FLASH_MODE_OFF: u8 = 0;

    /// Preview capture intent.
    pub const INTENT_PREVIEW: u8 = 1;
    /// Still-capture intent.
    pub const INTENT_STILL_CAPTURE: u8 = 2;
    /// Video-record intent.
    pub const INTENT_VIDEO_RECORD: u8 = 3;
    /// Video-snapshot intent.
    pub const INTENT_VIDEO_SNAPSHOT: u8 = 4;
}

/// V4L2 control identifiers used by the mapped controls.
pub mod cid {
    /// `V4L2_CID_AUTO_WHITE_BALANCE`
    pub const AUTO_WHITE_BALANCE: u32 = 0x0098_090c;
    /// `V4L2_CID_POWER_LINE_FREQUENCY`
    pub const POWER_LINE_FREQUENCY: u32 = 0x0098_0918;
}

/// A characteristic with a fixed, device-independent value.
#[derive(Debug, Clone)]
pub struct FixedProperty {
    /// Key this property populates.
    pub tag: Tag,
    /// The fixed value.
    pub value: Value,
}

/// A request setting wired to a device control.
#[derive(Debug, Clone)]
pub struct MappedControl {
    /// Request key.
    pub tag: Tag,
    /// Static key advertising the accepted option values.
    pub options_tag: Tag,
    /// Device control identifier.
    pub control_id: u32,
    /// Accepted setting values and the device control value each maps to.
    pub options: Vec<(u8, i32)>,
    /// Template default.
    pub default: u8,
}

/// A request setting that is accepted and echoed but not wired to
/// hardware (the device has no matching control).
#[derive(Debug, Clone)]
pub struct IgnoredControl {
    /// Request key.
    pub tag: Tag,
    /// Template default.
    pub default: Value,
}

/// Tagged union over the property/control variants. Each variant answers
/// the same four capabilities; callers never branch on the variant.
#[derive(Debug, Clone)]
pub enum ControlEntry {
    /// Fixed static characteristic.
    Fixed(FixedProperty),
    /// Setting mapped to a device control.
    Mapped(MappedControl),
    /// Setting accepted but not applied to hardware.
    Ignored(IgnoredControl),
}

impl ControlEntry {
    /// The request/static key this entry owns.
    #[must_use]
    pub fn tag(&self) -> Tag {
        match self {
            Self::Fixed(p) => p.tag,
            Self::Mapped(c) => c.tag,
            Self::Ignored(c) => c.tag,
        }
    }

    /// Contribute to the static characteristics map.
    pub fn populate_static(&self, info: &mut Metadata) {
        match self {
            Self::Fixed(p) => info.set(p.tag, p.value.clone()),
            Self::Mapped(c) => {
                let options = c.options.iter().map(|(v, _)| *v).collect();
                info.set(c.options_tag, Value::Bytes(options));
            }
            Self::Ignored(_) => {}
        }
    }

    /// Contribute the template default for this entry.
    pub fn populate_defaults(&self, settings: &mut Metadata) {
        match self {
            Self::Fixed(p) => settings.set(p.tag, p.value.clone()),
            Self::Mapped(c) => settings.set(c.tag, Value::Byte(c.default)),
            Self::Ignored(c) => settings.set(c.tag, c.default.clone()),
        }
    }

    /// Validate the entry's key in a request settings snapshot.
    pub fn validate_request(&self, settings: &Metadata) -> Result<()> {
        match self {
            Self::Fixed(p) => match settings.get(p.tag) {
                None => Ok(()),
                Some(value) if *value == p.value => Ok(()),
                Some(_) => Err(CameraError::InvalidSettings(
                    "request contradicts a fixed property",
                )),
            },
            Self::Mapped(c) => match settings.get(c.tag) {
                None => Ok(()),
                Some(Value::Byte(value)) => {
                    if c.options.iter().any(|(option, _)| option == value) {
                        Ok(())
                    } else {
                        Err(CameraError::InvalidSettings(
                            "value outside the advertised options",
                        ))
                    }
                }
                Some(_) => Err(CameraError::InvalidSettings(
                    "unexpected value type for a mapped control",
                )),
            },
            Self::Ignored(_) => Ok(()),
        }
    }

    /// Push the entry's value from a validated request to the device.
    pub fn apply_request<D: VideoDevice + ?Sized>(
        &self,
        device: &D,
        settings: &Metadata,
    ) -> Result<()> {
        if let Self::Mapped(c) = self {
            if let Some(value) = settings.byte(c.tag) {
                if let Some((_, control_value)) =
                    c.options.iter().find(|(option, _)| *option == value)
                {
                    device.set_control(c.control_id, *control_value)?;
                }
            }
        }
        Ok(())
    }
}

/// The property/control table for this device class.
#[must_use]
pub fn control_table() -> Vec<ControlEntry> {
    vec![
        ControlEntry::Fixed(FixedProperty {
            tag: Tag::LensFacing,
            value: Value::Byte(values::LENS_FACING_EXTERNAL),
        }),
        ControlEntry::Fixed(FixedProperty {
            tag: Tag::SensorOrientation,
            value: Value::Int(0),
        }),
        ControlEntry::Fixed(FixedProperty {
            tag: Tag::LensFocalLength,
            value: Value::Float(3.04),
        }),
        ControlEntry::Fixed(FixedProperty {
            tag: Tag::LensAperture,
            value: Value::Float(2.0),
        }),
        ControlEntry::Fixed(FixedProperty {
            tag: Tag::MaxDigitalZoom,
            value: Value::Float(1.0),
        }),
        ControlEntry::Mapped(MappedControl {
            tag: Tag::AwbMode,
            options_tag: Tag::AvailableAwbModes,
            control_id: cid::AUTO_WHITE_BALANCE,
            options: vec![(values::AWB_MODE_OFF, 0), (values::AWB_MODE_AUTO, 1)],
            default: values::AWB_MODE_AUTO,
        }),
        ControlEntry::Mapped(MappedControl {
            tag: Tag::AeAntibandingMode,
            options_tag: Tag::AvailableAntibandingModes,
            control_id: cid::POWER_LINE_FREQUENCY,
            options: vec![
                (values::ANTIBANDING_OFF, 0),
                (values::ANTIBANDING_50HZ, 1),
                (values::ANTIBANDING_60HZ, 2),
                (values::ANTIBANDING_AUTO, 3),
            ],
            default: values::ANTIBANDING_AUTO,
        }),
        ControlEntry::Ignored(IgnoredControl {
            tag: Tag::AeMode,
            default: Value::Byte(values::AE_MODE_ON),
        }),
        ControlEntry::Ignored(IgnoredControl {
            tag: Tag::AfMode,
            default: Value::Byte(values::AF_MODE_OFF),
        }),
        ControlEntry::Ignored(IgnoredControl {
            tag: Tag::AfTrigger,
            default: Value::Byte(values::AF_TRIGGER_IDLE),
        }),
        ControlEntry::Ignored(IgnoredControl {
            tag: Tag::FlashMode,
            default: Value::Byte(values::FLASH_MODE_OFF),
        }),
        ControlEntry::Ignored(IgnoredControl {
            tag: Tag::SensorFrameDuration,
            default: Value::Long(33_333_333), // 1/30 s
        }),
    ]
}

/// Validate a full settings snapshot against the table.
pub fn validate_settings(table: &[ControlEntry], settings: &Metadata) -> Result<()> {
    for entry in table {
        entry.validate_request(settings)?;
    }
    Ok(())
}

/// Apply a validated settings snapshot to the device.
pub fn apply_settings<D: VideoDevice + ?Sized>(
    table: &[ControlEntry],
    device: &D,
    settings: &Metadata,
) -> Result<()> {
    for entry in table {
        entry.apply_request(device, settings)?;
    }
    Ok(())
}

/// Named default-settings templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TemplateKind {
    /// Continuous viewfinder frames.
    Preview,
    /// One high-quality still frame.
    StillCapture,
    /// Continuous recording frames.
    VideoRecord,
    /// Still frame taken while recording.
    VideoSnapshot,
}

impl TemplateKind {
    /// Convert a raw template index as carried by the plugin interface.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for indices outside the supported set.
    pub fn from_index(index: i32) -> Result<Self> {
        match index {
            1 => Ok(Self::Preview),
            2 => Ok(Self::StillCapture),
            3 => Ok(Self::VideoRecord),
            4 => Ok(Self::VideoSnapshot),
            _ => Err(CameraError::InvalidArgument("unrecognized template kind")),
        }
    }

    fn intent(self) -> u8 {
        match self {
            Self::Preview => values::INTENT_PREVIEW,
            Self::StillCapture => values::INTENT_STILL_CAPTURE,
            Self::VideoRecord => values::INTENT_VIDEO_RECORD,
            Self::VideoSnapshot => values::INTENT_VIDEO_SNAPSHOT,
        }
    }

    fn fps_range(self) -> (i32, i32) {
        match self {
            // Recording paths want a flat rate; still capture tolerates a
            // variable one for better exposure in low light.
            Self::Preview | Self::VideoRecord | Self::VideoSnapshot => (30, 30),
            Self::StillCapture => (5, 30),
        }
    }
}

/// Build the default settings snapshot for one template kind.
#[must_use]
pub fn build_template(kind: TemplateKind, table: &[ControlEntry]) -> Metadata {
    let mut settings = Metadata::new();
    for entry in table {
        entry.populate_defaults(&mut settings);
    }
    settings.set(Tag::CaptureIntent, Value::Byte(kind.intent()));
    let (min, max) = kind.fps_range();
    settings.set(Tag::AeTargetFpsRange, Value::IntPair(min, max));
    settings
}

/// Timestamp helper: nanoseconds for the settings/notify path.
#[must_use]
pub fn timestamp_nanos(timestamp: Duration) -> i64 {
    i64::try_from(timestamp.as_nanos()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_carries_intent_and_defaults() {
        let table = control_table();
        let template = build_template(TemplateKind::Preview, &table);

        assert_eq!(
            template.byte(Tag::CaptureIntent),
            Some(values::INTENT_PREVIEW)
        );
        assert_eq!(template.byte(Tag::AwbMode), Some(values::AWB_MODE_AUTO));
        assert_eq!(
            template.get(Tag::AeTargetFpsRange),
            Some(&Value::IntPair(30, 30))
        );
    }

    #[test]
    fn test_still_capture_uses_variable_fps() {
        let table = control_table();
        let template = build_template(TemplateKind::StillCapture, &table);
        assert_eq!(
            template.get(Tag::AeTargetFpsRange),
            Some(&Value::IntPair(5, 30))
        );
    }

    #[test]
    fn test_validate_rejects_unknown_option() {
        let table = control_table();
        let mut settings = build_template(TemplateKind::Preview, &table);
        settings.set(Tag::AwbMode, Value::Byte(99));

        match validate_settings(&table, &settings) {
            Err(CameraError::InvalidSettings(_)) => {}
            other => panic!("expected InvalidSettings, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_rejects_contradicted_fixed_property() {
        let table = control_table();
        let mut settings = Metadata::new();
        settings.set(Tag::LensFacing, Value::Byte(0));

        match validate_settings(&table, &settings) {
            Err(CameraError::InvalidSettings(_)) => {}
            other => panic!("expected InvalidSettings, got {other:?}"),
        }
    }

    #[test]
    fn test_template_index_conversion() {
        assert_eq!(
            TemplateKind::from_index(1).expect("preview index"),
            TemplateKind::Preview
        );
        assert!(matches!(
            TemplateKind::from_index(7),
            Err(CameraError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_static_population_advertises_options() {
        let table = control_table();
        let mut info = Metadata::new();
        for entry in &table {
            entry.populate_static(&mut info);
        }

        assert_eq!(
            info.byte(Tag::LensFacing),
            Some(values::LENS_FACING_EXTERNAL)
        );
        assert_eq!(
            info.get(Tag::AvailableAwbModes),
            Some(&Value::Bytes(vec![
                values::AWB_MODE_OFF,
                values::AWB_MODE_AUTO
            ]))
        );
    }
}
