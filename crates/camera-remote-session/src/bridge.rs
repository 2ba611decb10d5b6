//! Async operation bridge.
//!
//! Wraps one cancellable background task so that a caller can await a single
//! translated result: a value, a `CancelledFault`, or another fault. The task
//! never blocks the calling RPC; only its start and finish are synchronized.

use std::{
    future::Future,
    sync::{Arc, Mutex, PoisonError},
};

use camera_remote_core::{DeviceError, Fault, ReasonCode, RemoteCancellationToken};
use tokio::{sync::broadcast::error::RecvError, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{CancellationBus, error::device_fault};

/// Lifecycle of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Running,
    Completed,
    Faulted,
    Cancelled,
}

/// Invoked once when the wrapped task reaches a terminal state.
pub type CompletionCallback = Box<dyn FnOnce(OperationState) + Send>;

/// Local cancellation source paired with the client's remote token.
#[derive(Debug, Clone)]
pub struct Cancellation {
    pub source: CancellationToken,
    pub token: RemoteCancellationToken,
}

/// Records the terminal state when the task ends, however it ends.
///
/// A task that unwinds is `Faulted`; one aborted before finishing is
/// `Cancelled`.
struct Completion {
    state: Arc<Mutex<OperationState>>,
    on_complete: Option<CompletionCallback>,
    finished: CancellationToken,
    terminal: Option<OperationState>,
}

impl Drop for Completion {
    fn drop(&mut self) {
        let terminal = self.terminal.unwrap_or_else(|| {
            if std::thread::panicking() {
                OperationState::Faulted
            } else {
                OperationState::Cancelled
            }
        });
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = terminal;
        if let Some(callback) = self.on_complete.take() {
            callback(terminal);
        }
        self.finished.cancel();
    }
}

/// One in-flight operation.
pub struct AsyncOperation<T> {
    method: &'static str,
    token: RemoteCancellationToken,
    source: CancellationToken,
    state: Arc<Mutex<OperationState>>,
    task: Option<JoinHandle<Result<T, DeviceError>>>,
    watcher: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> AsyncOperation<T> {
    /// Start `work` in the background.
    ///
    /// With a cancellable token, the operation listens on `bus` and cancels
    /// its source on the first matching request, then stops listening. Later
    /// matches are no-ops.
    pub fn spawn<F>(
        method: &'static str,
        work: F,
        cancellation: Option<Cancellation>,
        bus: &CancellationBus,
        on_complete: Option<CompletionCallback>,
    ) -> Self
    where
        F: Future<Output = Result<T, DeviceError>> + Send + 'static,
    {
        let Cancellation { source, token } = cancellation.unwrap_or_else(|| Cancellation {
            source: CancellationToken::new(),
            token: RemoteCancellationToken::NotCancellable,
        });
        let state = Arc::new(Mutex::new(OperationState::Running));
        let finished = CancellationToken::new();

        // Subscribe before the task starts so no request can slip between.
        let watcher = token.is_cancellable().then(|| {
            let mut requests = bus.subscribe();
            let source = source.clone();
            let finished = finished.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        () = finished.cancelled() => break,
                        request = requests.recv() => match request {
                            Ok(requested) if token.matches(&requested) => {
                                tracing::debug!(method, %token, "remote cancellation matched");
                                source.cancel();
                                break;
                            }
                            Ok(_) => {}
                            Err(RecvError::Lagged(skipped)) => {
                                tracing::warn!(method, %token, skipped, "cancellation requests dropped");
                            }
                            Err(RecvError::Closed) => break,
                        },
                    }
                }
            })
        });

        let task = {
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                let mut completion = Completion {
                    state,
                    on_complete,
                    finished,
                    terminal: None,
                };
                let result = work.await;
                completion.terminal = Some(match &result {
                    Ok(_) => OperationState::Completed,
                    Err(DeviceError::Cancelled) => OperationState::Cancelled,
                    Err(_) => OperationState::Faulted,
                });
                result
            })
        };

        Self {
            method,
            token,
            source,
            state,
            task: Some(task),
            watcher,
        }
    }

    /// Wait for the task and translate its outcome. Disposes the operation.
    ///
    /// # Errors
    /// Returns `Fault::Cancelled` if the task ended via cancellation, a device
    /// fault for vendor errors, or a service fault otherwise.
    pub async fn end(mut self) -> Result<T, Fault> {
        let Some(task) = self.task.take() else {
            return Err(Fault::service(
                self.method,
                ReasonCode::GeneralServiceError,
                "Operation already finalized",
                String::new(),
            ));
        };
        let outcome = task.await;
        self.dispose();

        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(device_fault(self.method, err)),
            Err(join) if join.is_cancelled() => Err(Fault::cancelled(self.method)),
            Err(join) => Err(Fault::service(
                self.method,
                ReasonCode::GeneralServiceError,
                "Operation task failed",
                join.to_string(),
            )),
        }
    }
}

impl<T> AsyncOperation<T> {
    #[must_use]
    pub fn state(&self) -> OperationState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub const fn token(&self) -> RemoteCancellationToken {
        self.token
    }

    /// Request cooperative cancellation locally.
    pub fn cancel(&self) {
        self.source.cancel();
    }

    /// Release the task and the cancellation subscription. Idempotent.
    pub fn dispose(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl<T> Drop for AsyncOperation<T> {
    fn drop(&mut self) {
        self.dispose();
    }
}
