//! Per-connection session endpoint for remote camera control.
//!
//! Provides:
//! - `SessionEndpoint` - owns the registries and implements the RPC surface
//! - Device and settings registries
//! - `AsyncOperation` - cancellable background task with a single awaitable result
//! - `CancellationBus` - out-of-band, token-correlated cancellation requests
//! - `EventForwarder` - relays device events to the client callback sink
//! - Fault translation (`EndpointError::into_fault`)

pub mod bridge;
pub mod cancellation;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod forwarder;
pub mod registry;

pub use bridge::{AsyncOperation, Cancellation, CompletionCallback, OperationState};
pub use cancellation::CancellationBus;
pub use config::{EndpointConfig, HostContext};
pub use endpoint::{PendingOperation, SessionEndpoint};
pub use error::EndpointError;
pub use forwarder::{EventForwarder, ForwarderHandle};
