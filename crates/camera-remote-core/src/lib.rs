//! Core abstractions for remote camera control sessions.
//!
//! This crate provides the fundamental building blocks:
//! - `Device` - capability set (`ControlOps` + `AcquisitionOps` + `EventSource`)
//! - `DeviceEvent` / `EventSink` - device notifications and the client callback seam
//! - `Fault` - the typed fault payloads that cross the RPC boundary
//! - `RemoteCancellationToken` - correlation id for out-of-band cancellation
//! - `simulated` - a software camera variant (feature `simulated`)

pub mod device;
pub mod events;
pub mod fault;
pub mod token;
pub mod types;

#[cfg(feature = "simulated")]
pub mod simulated;

pub use device::{AcquisitionOps, CameraSettings, ControlOps, Device, DeviceError, DeviceFactory, EventSource};
pub use events::{CallbackEvent, DeviceEvent, EventSink, NullSink, SinkError, camera_key};
pub use fault::{Fault, FaultDetail, FaultKind, ReasonCode};
pub use token::RemoteCancellationToken;
pub use types::{
    AcquisitionStatus, CameraCapabilities, CameraProperties, FanMode, Image, ShutterMode, Switch,
    TemperatureReading, TemperatureStatus,
};
