//! Value types exchanged with camera devices.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Fan operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanMode {
    FullSpeed,
    LowSpeed,
    Off,
}

/// Generic on/off switch used by cooler and monitor controls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Switch {
    Enabled,
    Disabled,
}

impl Switch {
    #[must_use]
    pub const fn is_enabled(self) -> bool {
        matches!(self, Self::Enabled)
    }
}

/// Shutter operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutterMode {
    FullAuto,
    PermanentlyOpen,
    PermanentlyClosed,
}

/// Sensor temperature regulation status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemperatureStatus {
    Off,
    NotReached,
    NotStabilized,
    Drift,
    Stabilized,
}

/// A single temperature measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TemperatureReading {
    /// Sensor temperature in degrees Celsius.
    pub temperature: f32,
    pub status: TemperatureStatus,
}

/// Static feature set reported by a camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraCapabilities {
    pub can_set_temperature: bool,
    pub can_control_fan: bool,
    pub has_internal_shutter: bool,
    pub has_external_shutter: bool,
    /// Lowest settable temperature in degrees Celsius.
    pub min_temperature: f32,
    /// Highest settable temperature in degrees Celsius.
    pub max_temperature: f32,
}

/// Detector geometry and readout properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraProperties {
    pub detector_width: u32,
    pub detector_height: u32,
    /// Pixel pitch in micrometres.
    pub pixel_size_um: f32,
    pub bit_depth: u8,
}

/// Progress snapshot carried by acquisition events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquisitionStatus {
    pub images_acquired: u32,
    pub images_total: u32,
}

/// Raw frame pulled from the camera buffer.
///
/// Pixels are little-endian `u16` samples, row-major.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
}

impl Image {
    /// Number of pixels described by the header.
    #[must_use]
    pub const fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}
