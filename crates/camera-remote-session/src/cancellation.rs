//! Out-of-band cancellation requests.
//!
//! One bus per endpoint. `CancelAsync(token)` publishes the token; every live
//! `AsyncOperation` with a cancellable token holds a subscription and checks
//! for a match. There is no token → operation table.

use camera_remote_core::RemoteCancellationToken;
use tokio::sync::broadcast;

/// Broadcast of cancellation requests.
#[derive(Debug, Clone)]
pub struct CancellationBus {
    sender: broadcast::Sender<RemoteCancellationToken>,
}

impl Default for CancellationBus {
    fn default() -> Self {
        Self::new(64)
    }
}

impl CancellationBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish a cancellation request. Fire-and-forget.
    ///
    /// Returns how many subscribers saw the request. `NotCancellable` is never
    /// published.
    pub fn request(&self, token: RemoteCancellationToken) -> usize {
        if !token.is_cancellable() {
            return 0;
        }
        let receivers = self.sender.send(token).unwrap_or(0);
        tracing::debug!(%token, receivers, "cancellation requested");
        receivers
    }

    /// Subscribe to future requests.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RemoteCancellationToken> {
        self.sender.subscribe()
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
