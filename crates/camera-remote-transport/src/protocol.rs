//! Wire protocol for client-server communication.
//!
//! Every frame is one JSON object. Binary payloads (settings blobs and image
//! pixels) travel base64 encoded.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use bytes::Bytes;
use camera_remote_core::{
    CallbackEvent, CameraCapabilities, CameraProperties, FanMode, Fault, Image,
    RemoteCancellationToken, ShutterMode, Switch, TemperatureReading,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Payload decoding error.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("Image data is {actual} bytes, expected {expected}")]
    ImageSize { expected: usize, actual: usize },
    #[error("Unexpected response to {method}: {found}")]
    UnexpectedResponse { method: &'static str, found: String },
    #[error("Invalid frame: {0}")]
    Json(#[from] serde_json::Error),
}

/// Message from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Invoke one endpoint method. The reply carries the same `call_id`.
    Call { call_id: u64, request: Request },
    /// One-way cancellation of the operation started with `token`.
    CancelAsync { token: RemoteCancellationToken },
    /// Ping for keepalive.
    Ping,
}

/// Endpoint method and its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method")]
pub enum Request {
    Connect,
    Disconnect,
    GetNumberOfCameras,
    ListCameras,
    CreateCamera { index: i32 },
    RemoveCamera { index: i32 },
    CreateSettings { index: i32 },
    RemoveSettings { id: String },
    GetSettingsPayload { id: String },
    LoadSettingsPayload { id: String, payload: String },
    ApplySettings { id: String },
    GetCameraModel { index: i32 },
    GetSerialNumber { index: i32 },
    GetCapabilities { index: i32 },
    GetProperties { index: i32 },
    IsActive { index: i32 },
    IsInitialized { index: i32 },
    IsAcquiring { index: i32 },
    GetCurrentTemperature { index: i32 },
    FanControl { index: i32, mode: FanMode },
    CoolerControl { index: i32, mode: Switch },
    SetTemperature { index: i32, temperature: f32 },
    ShutterControl {
        index: i32,
        internal: ShutterMode,
        #[serde(default)]
        external: Option<ShutterMode>,
    },
    TemperatureMonitor { index: i32, mode: Switch, interval_ms: u64 },
    AbortAcquisition { index: i32 },
    StartImageSavingSequence { index: i32, folder: String, prefix: String },
    StartAcquisitionAsync {
        index: i32,
        #[serde(default)]
        token: RemoteCancellationToken,
    },
    PullAllImagesAsync {
        index: i32,
        #[serde(default)]
        token: RemoteCancellationToken,
    },
    FinishImageSavingSequenceAsync {
        index: i32,
        #[serde(default)]
        token: RemoteCancellationToken,
    },
}

impl Request {
    /// Method name as reported in faults.
    #[must_use]
    pub const fn method_name(&self) -> &'static str {
        match self {
            Self::Connect => "Connect",
            Self::Disconnect => "Disconnect",
            Self::GetNumberOfCameras => "GetNumberOfCameras",
            Self::ListCameras => "ListCameras",
            Self::CreateCamera { .. } => "CreateCamera",
            Self::RemoveCamera { .. } => "RemoveCamera",
            Self::CreateSettings { .. } => "CreateSettings",
            Self::RemoveSettings { .. } => "RemoveSettings",
            Self::GetSettingsPayload { .. } => "GetSettingsPayload",
            Self::LoadSettingsPayload { .. } => "LoadSettingsPayload",
            Self::ApplySettings { .. } => "ApplySettings",
            Self::GetCameraModel { .. } => "GetCameraModel",
            Self::GetSerialNumber { .. } => "GetSerialNumber",
            Self::GetCapabilities { .. } => "GetCapabilities",
            Self::GetProperties { .. } => "GetProperties",
            Self::IsActive { .. } => "IsActive",
            Self::IsInitialized { .. } => "IsInitialized",
            Self::IsAcquiring { .. } => "IsAcquiring",
            Self::GetCurrentTemperature { .. } => "GetCurrentTemperature",
            Self::FanControl { .. } => "FanControl",
            Self::CoolerControl { .. } => "CoolerControl",
            Self::SetTemperature { .. } => "SetTemperature",
            Self::ShutterControl { .. } => "ShutterControl",
            Self::TemperatureMonitor { .. } => "TemperatureMonitor",
            Self::AbortAcquisition { .. } => "AbortAcquisition",
            Self::StartImageSavingSequence { .. } => "StartImageSavingSequence",
            Self::StartAcquisitionAsync { .. } => "StartAcquisitionAsync",
            Self::PullAllImagesAsync { .. } => "PullAllImagesAsync",
            Self::FinishImageSavingSequenceAsync { .. } => "FinishImageSavingSequenceAsync",
        }
    }

    /// Create a settings upload from raw bytes.
    #[must_use]
    pub fn load_settings_payload(id: impl Into<String>, payload: &[u8]) -> Self {
        Self::LoadSettingsPayload {
            id: id.into(),
            payload: BASE64.encode(payload),
        }
    }
}

/// Successful reply value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Response {
    Unit,
    SessionId(String),
    SettingsId(String),
    Text(String),
    Bool(bool),
    Count(u32),
    Indices(Vec<i32>),
    /// Base64 encoded settings blob.
    Payload(String),
    Capabilities(CameraCapabilities),
    Properties(CameraProperties),
    Temperature(TemperatureReading),
    Images(Vec<WireImage>),
}

impl Response {
    /// Create a payload reply from raw bytes.
    #[must_use]
    pub fn payload(data: &[u8]) -> Self {
        Self::Payload(BASE64.encode(data))
    }

    /// Short variant name for diagnostics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Unit => "unit",
            Self::SessionId(_) => "session_id",
            Self::SettingsId(_) => "settings_id",
            Self::Text(_) => "text",
            Self::Bool(_) => "bool",
            Self::Count(_) => "count",
            Self::Indices(_) => "indices",
            Self::Payload(_) => "payload",
            Self::Capabilities(_) => "capabilities",
            Self::Properties(_) => "properties",
            Self::Temperature(_) => "temperature",
            Self::Images(_) => "images",
        }
    }
}

/// Result of one call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Ok(Response),
    Fault(Fault),
}

impl From<Result<Response, Fault>> for Outcome {
    fn from(result: Result<Response, Fault>) -> Self {
        match result {
            Ok(response) => Self::Ok(response),
            Err(fault) => Self::Fault(fault),
        }
    }
}

/// Message from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Reply to a `Call`.
    Reply { call_id: u64, outcome: Outcome },
    /// Device event relayed to the client.
    Callback { event: CallbackEvent },
    /// Frame the server could not parse.
    Error { message: String },
    /// Pong response.
    Pong,
}

/// Image frame with base64 pixel data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireImage {
    pub width: u32,
    pub height: u32,
    pub data: String,
}

impl From<&Image> for WireImage {
    fn from(image: &Image) -> Self {
        Self {
            width: image.width,
            height: image.height,
            data: BASE64.encode(&image.data),
        }
    }
}

impl TryFrom<WireImage> for Image {
    type Error = ProtocolError;

    fn try_from(wire: WireImage) -> Result<Self, Self::Error> {
        let image = Self {
            width: wire.width,
            height: wire.height,
            data: Bytes::from(BASE64.decode(wire.data)?),
        };
        let expected = image.pixel_count() * 2;
        if image.data.len() != expected {
            return Err(ProtocolError::ImageSize {
                expected,
                actual: image.data.len(),
            });
        }
        Ok(image)
    }
}

/// Decode a base64 payload.
///
/// # Errors
/// Returns error if `data` is not valid base64.
pub fn decode_payload(data: &str) -> Result<Vec<u8>, ProtocolError> {
    Ok(BASE64.decode(data)?)
}
