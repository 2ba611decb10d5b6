//! Device event → client callback forwarding.

use std::sync::Arc;

use camera_remote_core::{CallbackEvent, DeviceEvent, EventSink};
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};

/// Handle to a running forwarder. Stops forwarding when dropped.
pub struct ForwarderHandle {
    task: tokio::task::JoinHandle<()>,
}

impl ForwarderHandle {
    /// Stop forwarding. Events not yet relayed are dropped.
    pub fn stop(&self) {
        self.task.abort();
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for ForwarderHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Relays one device's events to the client.
pub struct EventForwarder;

impl EventForwarder {
    /// Spawn a forwarder for an already-taken subscription.
    ///
    /// Events are relayed in the order the device raised them. A failing sink
    /// never affects the device: failures are logged and the event dropped.
    #[must_use]
    pub fn spawn(
        camera_key: String,
        camera_index: i32,
        receiver: broadcast::Receiver<DeviceEvent>,
        sink: Arc<dyn EventSink>,
    ) -> ForwarderHandle {
        let task = tokio::spawn(async move {
            let mut stream = BroadcastStream::new(receiver);
            let mut failures = 0u64;

            while let Some(next) = stream.next().await {
                let event = match next {
                    Ok(event) => event,
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        tracing::warn!(%camera_key, skipped, "event forwarder lagged behind device");
                        continue;
                    }
                };
                let name = event.name();
                let callback = CallbackEvent {
                    camera_key: camera_key.clone(),
                    camera_index,
                    event,
                };
                if let Err(e) = sink.notify(callback) {
                    failures += 1;
                    if failures == 1 {
                        tracing::warn!(%camera_key, event = name, error = %e, "failed to forward event");
                    } else {
                        tracing::debug!(%camera_key, event = name, failures, "dropping event for unreachable client");
                    }
                }
            }
            tracing::debug!(%camera_key, "device event stream closed");
        });
        ForwarderHandle { task }
    }
}
