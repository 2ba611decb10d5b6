//! Device capability traits.
//!
//! A camera is not a class hierarchy: it is any type implementing the three
//! capability traits below. The local vendor binding and the software camera
//! are distinct variants selected at construction by a `DeviceFactory`.

use std::{any::Any, sync::Arc, time::Duration};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::{
    DeviceEvent,
    types::{CameraCapabilities, CameraProperties, FanMode, Image, ShutterMode, Switch, TemperatureReading},
};

/// Device error.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// Error reported by the vendor driver.
    #[error("{operation} failed with vendor code {code}: {message}")]
    Vendor {
        code: u32,
        operation: String,
        message: String,
    },
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Device has been disposed")]
    Disposed,
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
    #[error("Invalid settings payload: {0}")]
    InvalidPayload(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeviceError {
    /// Create a vendor error.
    pub fn vendor(code: u32, operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Vendor {
            code,
            operation: operation.into(),
            message: message.into(),
        }
    }
}

/// Mutable, serializable configuration object bound to one device.
pub trait CameraSettings: Send + Sync {
    /// Serialize to the opaque byte payload exchanged with clients.
    ///
    /// # Errors
    /// Returns error if the settings cannot be encoded.
    fn to_bytes(&self) -> Result<Vec<u8>, DeviceError>;

    /// Replace the contents with a payload produced by `to_bytes`.
    ///
    /// # Errors
    /// Returns error if the payload is malformed.
    fn load_bytes(&mut self, payload: &[u8]) -> Result<(), DeviceError>;

    /// Release resources held by the settings object.
    ///
    /// # Errors
    /// Returns error if the underlying driver refuses the release.
    fn dispose(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any;
}

/// Synchronous control and property calls.
///
/// These may block briefly on hardware I/O.
#[allow(clippy::missing_errors_doc)]
pub trait ControlOps: Send + Sync {
    fn camera_model(&self) -> Result<String, DeviceError>;
    fn serial_number(&self) -> Result<String, DeviceError>;
    fn capabilities(&self) -> Result<CameraCapabilities, DeviceError>;
    fn properties(&self) -> Result<CameraProperties, DeviceError>;
    fn is_active(&self) -> bool;
    fn is_initialized(&self) -> bool;
    fn is_acquiring(&self) -> bool;

    fn current_temperature(&self) -> Result<TemperatureReading, DeviceError>;
    fn fan_control(&self, mode: FanMode) -> Result<(), DeviceError>;
    fn cooler_control(&self, mode: Switch) -> Result<(), DeviceError>;
    fn set_temperature(&self, temperature: f32) -> Result<(), DeviceError>;
    fn shutter_control(
        &self,
        internal: ShutterMode,
        external: Option<ShutterMode>,
    ) -> Result<(), DeviceError>;
    /// Start or stop periodic `TemperatureStatusChecked` events.
    fn temperature_monitor(&self, mode: Switch, interval: Duration) -> Result<(), DeviceError>;

    fn abort_acquisition(&self) -> Result<(), DeviceError>;
    /// Arm saving of subsequent frames under `folder/prefix_N`.
    fn start_image_saving_sequence(&self, folder: &str, prefix: &str) -> Result<(), DeviceError>;

    fn create_settings(&self) -> Result<Box<dyn CameraSettings>, DeviceError>;
    fn apply_settings(&self, settings: &dyn CameraSettings) -> Result<(), DeviceError>;

    /// Shut the device down. Further calls fail with `DeviceError::Disposed`.
    fn dispose(&self) -> Result<(), DeviceError>;
}

/// Long-running operations.
///
/// Implementations must observe `cancel` at suitable points and return
/// `DeviceError::Cancelled` once it fires.
#[async_trait]
pub trait AcquisitionOps: Send + Sync {
    /// Run one acquisition to completion.
    async fn start_acquisition(&self, cancel: CancellationToken) -> Result<(), DeviceError>;

    /// Drain every frame currently held in the camera buffer.
    async fn pull_all_images(&self, cancel: CancellationToken) -> Result<Vec<Image>, DeviceError>;

    /// Flush frames queued by `start_image_saving_sequence`, returning how many were saved.
    async fn finish_image_saving_sequence(&self, cancel: CancellationToken)
    -> Result<u32, DeviceError>;
}

/// Source of device notifications.
pub trait EventSource: Send + Sync {
    /// Subscribe to every notification the device raises from now on.
    fn subscribe(&self) -> broadcast::Receiver<DeviceEvent>;
}

/// Full capability set of a camera.
pub trait Device: ControlOps + AcquisitionOps + EventSource {}

impl<T: ControlOps + AcquisitionOps + EventSource> Device for T {}

/// Constructs devices by integer index.
#[async_trait]
pub trait DeviceFactory: Send + Sync {
    /// Number of cameras the driver can see.
    ///
    /// # Errors
    /// Returns error if the driver cannot be queried.
    fn available(&self) -> Result<u32, DeviceError>;

    /// Open and fully initialize the camera at `index`.
    async fn create(&self, index: i32) -> Result<Arc<dyn Device>, DeviceError>;
}
