//! Device notifications and the client callback seam.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::types::{AcquisitionStatus, TemperatureReading};

/// Notification raised by a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DeviceEvent {
    /// A property changed as a side effect of a control call.
    PropertyChanged { property: String },
    TemperatureStatusChecked { reading: TemperatureReading },
    AcquisitionStarted { status: AcquisitionStatus },
    AcquisitionFinished { status: AcquisitionStatus, success: bool },
    AcquisitionStatusChecked { status: AcquisitionStatus },
    AcquisitionAborted { status: AcquisitionStatus },
    AcquisitionErrorReturned { status: AcquisitionStatus, message: String },
    NewImageReceived { index: u32, total: u32 },
    ImageSaved { index: u32, path: String },
}

impl DeviceEvent {
    /// Short name used in logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::PropertyChanged { .. } => "property_changed",
            Self::TemperatureStatusChecked { .. } => "temperature_status_checked",
            Self::AcquisitionStarted { .. } => "acquisition_started",
            Self::AcquisitionFinished { .. } => "acquisition_finished",
            Self::AcquisitionStatusChecked { .. } => "acquisition_status_checked",
            Self::AcquisitionAborted { .. } => "acquisition_aborted",
            Self::AcquisitionErrorReturned { .. } => "acquisition_error_returned",
            Self::NewImageReceived { .. } => "new_image_received",
            Self::ImageSaved { .. } => "image_saved",
        }
    }
}

/// Device event tagged for delivery to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackEvent {
    /// Session + device correlation id (see `camera_key`).
    pub camera_key: String,
    pub camera_index: i32,
    pub event: DeviceEvent,
}

/// Build the correlation id for a camera within a session.
#[must_use]
pub fn camera_key(session_id: &str, index: i32) -> String {
    format!("{session_id}:{index}")
}

/// Callback sink error.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Client channel closed")]
    Closed,
    #[error("Callback failed: {0}")]
    Failed(String),
}

/// Server-to-client callback channel.
///
/// `notify` must not block: it is called from event forwarding tasks.
pub trait EventSink: Send + Sync {
    /// Deliver one event to the client.
    ///
    /// # Errors
    /// Returns error if the client can no longer be reached.
    fn notify(&self, event: CallbackEvent) -> Result<(), SinkError>;
}

/// Sink used when no client is attached. Drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn notify(&self, _event: CallbackEvent) -> Result<(), SinkError> {
        Ok(())
    }
}

impl EventSink for mpsc::UnboundedSender<CallbackEvent> {
    fn notify(&self, event: CallbackEvent) -> Result<(), SinkError> {
        self.send(event).map_err(|_| SinkError::Closed)
    }
}
