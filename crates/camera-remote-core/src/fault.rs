//! Typed faults crossing the RPC boundary.
//!
//! Exactly three kinds exist. Nothing else may reach a client.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed set of fault reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReasonCode {
    /// Camera missing, duplicated or unreachable.
    CameraCommunication,
    /// Settings id does not resolve.
    SettingsUnavailable,
    /// Session not connected, already disposed, or hosting context missing.
    SessionUnavailable,
    /// One or more teardown steps failed.
    DisposalFailed,
    /// Vendor driver reported an error.
    VendorError,
    /// Operation ended via cancellation.
    OperationCancelled,
    GeneralServiceError,
}

/// Fault payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultDetail {
    pub message: String,
    pub details: String,
    /// Endpoint operation the fault originated from.
    pub method_name: String,
    pub reason: ReasonCode,
    /// Vendor error code, device faults only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor_code: Option<u32>,
}

/// Fault kind discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Device,
    Service,
    Cancelled,
}

/// Structured, typed error payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Fault {
    /// Hardware/vendor error.
    #[error("Device fault in {}: {}", .0.method_name, .0.message)]
    Device(FaultDetail),
    /// Infrastructure error: not-found, duplicate, disposal failure.
    #[error("Service fault in {}: {}", .0.method_name, .0.message)]
    Service(FaultDetail),
    /// Operation ended via cancellation.
    #[error("Operation {} was cancelled", .0.method_name)]
    Cancelled(FaultDetail),
}

impl Fault {
    /// Create a device fault from a vendor error.
    pub fn device(
        method_name: impl Into<String>,
        message: impl Into<String>,
        details: impl Into<String>,
        vendor_code: u32,
    ) -> Self {
        Self::Device(FaultDetail {
            message: message.into(),
            details: details.into(),
            method_name: method_name.into(),
            reason: ReasonCode::VendorError,
            vendor_code: Some(vendor_code),
        })
    }

    /// Create a service fault.
    pub fn service(
        method_name: impl Into<String>,
        reason: ReasonCode,
        message: impl Into<String>,
        details: impl Into<String>,
    ) -> Self {
        Self::Service(FaultDetail {
            message: message.into(),
            details: details.into(),
            method_name: method_name.into(),
            reason,
            vendor_code: None,
        })
    }

    /// Create a cancellation fault.
    pub fn cancelled(method_name: impl Into<String>) -> Self {
        Self::Cancelled(FaultDetail {
            message: "Operation was cancelled".to_string(),
            details: String::new(),
            method_name: method_name.into(),
            reason: ReasonCode::OperationCancelled,
            vendor_code: None,
        })
    }

    #[must_use]
    pub const fn kind(&self) -> FaultKind {
        match self {
            Self::Device(_) => FaultKind::Device,
            Self::Service(_) => FaultKind::Service,
            Self::Cancelled(_) => FaultKind::Cancelled,
        }
    }

    #[must_use]
    pub const fn detail(&self) -> &FaultDetail {
        match self {
            Self::Device(d) | Self::Service(d) | Self::Cancelled(d) => d,
        }
    }

    #[must_use]
    pub const fn reason(&self) -> ReasonCode {
        self.detail().reason
    }

    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_wire_shape() {
        let fault = Fault::service(
            "GetCameraModel",
            ReasonCode::CameraCommunication,
            "Camera not found",
            "index 0",
        );
        let json = serde_json::to_value(&fault).unwrap();
        assert_eq!(json["kind"], "service");
        assert_eq!(json["reason"], "camera-communication");
        assert_eq!(json["method_name"], "GetCameraModel");
        assert!(json.get("vendor_code").is_none());

        let parsed: Fault = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, fault);
    }

    #[test]
    fn test_device_fault_carries_vendor_code() {
        let fault = Fault::device("SetTemperature", "out of range", "", 20_004);
        assert_eq!(fault.kind(), FaultKind::Device);
        assert_eq!(fault.detail().vendor_code, Some(20_004));
        assert_eq!(fault.reason(), ReasonCode::VendorError);
    }

    #[test]
    fn test_cancelled_is_distinct() {
        let fault = Fault::cancelled("StartAcquisitionAsync");
        assert!(fault.is_cancelled());
        assert_eq!(fault.kind(), FaultKind::Cancelled);
        assert_eq!(fault.to_string(), "Operation StartAcquisitionAsync was cancelled");
    }
}
