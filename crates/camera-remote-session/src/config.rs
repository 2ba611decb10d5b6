//! Endpoint configuration and hosting context.

use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Tunables for a `SessionEndpoint`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Buffered cancellation requests per endpoint before slow bridges lag.
    pub cancellation_capacity: usize,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            cancellation_capacity: 64,
        }
    }
}

/// Addresses the endpoint is hosted on.
///
/// An empty context means the endpoint runs outside any host, and
/// `Connect` is refused.
#[derive(Debug, Clone, Default)]
pub struct HostContext {
    addresses: Vec<SocketAddr>,
}

impl HostContext {
    #[must_use]
    pub fn new(addresses: Vec<SocketAddr>) -> Self {
        Self { addresses }
    }

    #[must_use]
    pub fn addresses(&self) -> &[SocketAddr] {
        &self.addresses
    }

    #[must_use]
    pub fn is_available(&self) -> bool {
        !self.addresses.is_empty()
    }

    /// Derive a session id: SHA-256 of the bound addresses followed by the
    /// UTC timestamp, all hex digits. Used for correlation only.
    #[must_use]
    pub fn derive_session_id(&self, now: DateTime<Utc>) -> Option<String> {
        if !self.is_available() {
            return None;
        }
        let mut hasher = Sha256::new();
        for addr in &self.addresses {
            hasher.update(addr.to_string().as_bytes());
            hasher.update(b";");
        }
        let digest = hasher.finalize();
        Some(format!("{digest:x}{}", now.format("%Y%m%d%H%M%S%f")))
    }
}
