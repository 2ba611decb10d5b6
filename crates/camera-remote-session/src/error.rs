//! Endpoint errors and their translation into faults.
//!
//! `EndpointError` never crosses the boundary. Every public endpoint method
//! converts it with `into_fault`.

use camera_remote_core::{DeviceError, Fault, ReasonCode};
use thiserror::Error;

/// Endpoint error.
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("Session is not connected")]
    NotConnected,
    #[error("Session has been disposed")]
    Disposed,
    #[error("Hosting context unavailable")]
    HostUnavailable,
    #[error("Camera not found: {0}")]
    CameraNotFound(i32),
    #[error("Camera already exists: {0}")]
    DuplicateCamera(i32),
    #[error("Settings not found: {0}")]
    SettingsNotFound(String),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("Teardown incomplete: {}", .0.join("; "))]
    Teardown(Vec<String>),
}

impl EndpointError {
    /// Translate into a typed fault for `method`.
    #[must_use]
    pub fn into_fault(self, method: &str) -> Fault {
        tracing::debug!(method, error = %self, "translating endpoint error");
        match self {
            Self::NotConnected | Self::Disposed | Self::HostUnavailable => Fault::service(
                method,
                ReasonCode::SessionUnavailable,
                self.to_string(),
                String::new(),
            ),
            Self::CameraNotFound(index) => Fault::service(
                method,
                ReasonCode::CameraCommunication,
                "Camera not found",
                format!("No camera registered at index {index}"),
            ),
            Self::DuplicateCamera(index) => Fault::service(
                method,
                ReasonCode::CameraCommunication,
                "Camera already exists",
                format!("A camera is already registered at index {index}"),
            ),
            Self::SettingsNotFound(id) => Fault::service(
                method,
                ReasonCode::SettingsUnavailable,
                "Settings not found",
                format!("No settings registered with id {id}"),
            ),
            Self::Device(err) => device_fault(method, err),
            Self::Teardown(failures) => Fault::service(
                method,
                ReasonCode::DisposalFailed,
                "One or more resources failed to release",
                failures.join("; "),
            ),
        }
    }
}

/// Translate a device error: vendor errors first, cancellation second,
/// everything else is a service fault.
#[must_use]
pub fn device_fault(method: &str, err: DeviceError) -> Fault {
    match err {
        DeviceError::Vendor {
            code,
            operation,
            message,
        } => Fault::device(method, message, operation, code),
        DeviceError::Cancelled => Fault::cancelled(method),
        other => Fault::service(
            method,
            ReasonCode::GeneralServiceError,
            other.to_string(),
            String::new(),
        ),
    }
}
