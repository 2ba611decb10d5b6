//! Client proxy.
//!
//! `RemoteControlClient` presents the endpoint's call surface over any duplex
//! message channel. Replies are matched to calls by call id; callbacks are
//! re-broadcast locally and routed per camera key by `RemoteCamera::events`.
//!
//! Cancellable calls take an optional local `CancellationToken`. When it
//! fires, the client sends a one-way `CancelAsync` and keeps waiting for the
//! server's verdict, which surfaces as `ClientError::Cancelled`.

use std::{
    sync::{
        Arc, OnceLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use camera_remote_core::{
    CallbackEvent, CameraCapabilities, CameraProperties, FanMode, Fault, Image,
    RemoteCancellationToken, ShutterMode, Switch, TemperatureReading, camera_key,
};
use dashmap::DashMap;
use futures::{Stream, StreamExt};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_stream::wrappers::{BroadcastStream, UnboundedReceiverStream};
use tokio_util::sync::CancellationToken;

use crate::{
    dispatch::{ServerContext, spawn_local},
    protocol::{ClientMessage, Outcome, ProtocolError, Request, Response, ServerMessage},
};

const CALLBACK_CAPACITY: usize = 1024;

/// Client-side error.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The operation ended via cancellation.
    #[error("Operation {0} was cancelled")]
    Cancelled(String),
    #[error(transparent)]
    Fault(Fault),
    #[error("Connection closed")]
    Disconnected,
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl ClientError {
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// The server fault, if the call was faulted.
    #[must_use]
    pub const fn fault(&self) -> Option<&Fault> {
        match self {
            Self::Fault(fault) => Some(fault),
            _ => None,
        }
    }
}

impl From<Fault> for ClientError {
    fn from(fault: Fault) -> Self {
        if fault.is_cancelled() {
            Self::Cancelled(fault.detail().method_name.clone())
        } else {
            Self::Fault(fault)
        }
    }
}

macro_rules! reply {
    ($method:literal, $response:expr, $pattern:pat => $value:expr) => {
        match $response {
            $pattern => Ok($value),
            other => Err(ClientError::Protocol(ProtocolError::UnexpectedResponse {
                method: $method,
                found: other.kind().to_string(),
            })),
        }
    };
}

/// State shared with the reader task.
struct Router {
    pending: DashMap<u64, oneshot::Sender<Outcome>>,
    callbacks: broadcast::Sender<CallbackEvent>,
    closed: CancellationToken,
}

impl Router {
    fn route(&self, message: ServerMessage) {
        match message {
            ServerMessage::Reply { call_id, outcome } => {
                if let Some((_, reply)) = self.pending.remove(&call_id) {
                    let _ = reply.send(outcome);
                } else {
                    tracing::debug!(call_id, "reply for unknown call");
                }
            }
            ServerMessage::Callback { event } => {
                let _ = self.callbacks.send(event);
            }
            ServerMessage::Error { message } => {
                tracing::warn!(%message, "server rejected frame");
            }
            ServerMessage::Pong => tracing::trace!("pong"),
        }
    }

    fn close(&self) {
        self.closed.cancel();
        // Dropping the senders fails every pending call with `Disconnected`.
        self.pending.clear();
    }
}

struct Inner {
    outbound: mpsc::UnboundedSender<ClientMessage>,
    router: Arc<Router>,
    next_call: AtomicU64,
    session_id: OnceLock<String>,
}

/// Remote control client. Cheap to clone; the connection closes when the
/// last clone is dropped.
#[derive(Clone)]
pub struct RemoteControlClient {
    inner: Arc<Inner>,
}

impl RemoteControlClient {
    /// Create a client over a duplex channel.
    pub fn new<S>(outbound: mpsc::UnboundedSender<ClientMessage>, mut inbound: S) -> Self
    where
        S: Stream<Item = ServerMessage> + Send + Unpin + 'static,
    {
        let (callbacks, _) = broadcast::channel(CALLBACK_CAPACITY);
        let router = Arc::new(Router {
            pending: DashMap::new(),
            callbacks,
            closed: CancellationToken::new(),
        });

        let reader = Arc::clone(&router);
        tokio::spawn(async move {
            while let Some(message) = inbound.next().await {
                reader.route(message);
            }
            tracing::debug!("server stream closed");
            reader.close();
        });

        Self {
            inner: Arc::new(Inner {
                outbound,
                router,
                next_call: AtomicU64::new(1),
                session_id: OnceLock::new(),
            }),
        }
    }

    /// Open an in-process session against `context`.
    #[must_use]
    pub fn local(context: ServerContext) -> Self {
        let (outbound, inbound) = spawn_local(context);
        Self::new(outbound, UnboundedReceiverStream::new(inbound))
    }

    /// Connect to a WebSocket server, e.g. `ws://127.0.0.1:3000/ws`.
    ///
    /// # Errors
    /// Returns error if the WebSocket handshake fails.
    #[cfg(feature = "ws-client")]
    pub async fn connect_ws(url: &str) -> Result<Self, ClientError> {
        use futures::SinkExt;
        use tokio_tungstenite::{connect_async, tungstenite::Message};

        let (socket, _) = connect_async(url)
            .await
            .map_err(|e| ClientError::Connect(e.to_string()))?;
        let (mut sink, stream) = socket.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<ClientMessage>();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let json = match serde_json::to_string(&msg) {
                    Ok(j) => j,
                    Err(e) => {
                        tracing::error!("Failed to serialize message: {e}");
                        continue;
                    }
                };
                if sink.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let inbound = stream
            .take_while(|msg| futures::future::ready(matches!(msg, Ok(m) if !m.is_close())))
            .filter_map(|msg| {
                let parsed = match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str(text.as_str()) {
                        Ok(message) => Some(message),
                        Err(e) => {
                            tracing::warn!("Invalid server message: {e}");
                            None
                        }
                    },
                    _ => None,
                };
                futures::future::ready(parsed)
            });
        Ok(Self::new(tx, Box::pin(inbound)))
    }

    /// Whether the server side of the channel has closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.router.closed.is_cancelled()
    }

    /// Session id returned by `connect`.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.inner.session_id.get().map(String::as_str)
    }

    /// Every callback on this connection, for all cameras.
    #[must_use]
    pub fn callbacks(&self) -> broadcast::Receiver<CallbackEvent> {
        self.inner.router.callbacks.subscribe()
    }

    /// Send a keepalive ping.
    ///
    /// # Errors
    /// Returns error if the connection is closed.
    pub fn ping(&self) -> Result<(), ClientError> {
        self.send(ClientMessage::Ping)
    }

    /// # Errors
    /// Returns the server fault if the session cannot be opened.
    pub async fn connect(&self) -> Result<String, ClientError> {
        let id = reply!("Connect", self.call(Request::Connect).await?, Response::SessionId(id) => id)?;
        let _ = self.inner.session_id.set(id.clone());
        Ok(id)
    }

    /// # Errors
    /// Returns the server fault if teardown was incomplete.
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        reply!("Disconnect", self.call(Request::Disconnect).await?, Response::Unit => ())
    }

    /// # Errors
    /// Returns the server fault on failure.
    pub async fn number_of_cameras(&self) -> Result<u32, ClientError> {
        reply!("GetNumberOfCameras", self.call(Request::GetNumberOfCameras).await?, Response::Count(n) => n)
    }

    /// # Errors
    /// Returns the server fault on failure.
    pub async fn list_cameras(&self) -> Result<Vec<i32>, ClientError> {
        reply!("ListCameras", self.call(Request::ListCameras).await?, Response::Indices(v) => v)
    }

    /// Open camera `index` and return its handle.
    ///
    /// # Errors
    /// Returns the server fault if the camera cannot be created.
    pub async fn create_camera(&self, index: i32) -> Result<RemoteCamera, ClientError> {
        reply!("CreateCamera", self.call(Request::CreateCamera { index }).await?, Response::Unit => ())?;
        self.camera(index).ok_or(ClientError::Disconnected)
    }

    /// Handle to an already created camera. `None` before `connect`.
    #[must_use]
    pub fn camera(&self, index: i32) -> Option<RemoteCamera> {
        self.session_id().map(|session_id| RemoteCamera {
            client: self.clone(),
            index,
            key: camera_key(session_id, index),
        })
    }

    /// Handle to an existing settings object.
    #[must_use]
    pub fn settings(&self, id: impl Into<String>) -> RemoteSettings {
        RemoteSettings {
            client: self.clone(),
            id: id.into(),
        }
    }

    fn send(&self, message: ClientMessage) -> Result<(), ClientError> {
        self.inner
            .outbound
            .send(message)
            .map_err(|_| ClientError::Disconnected)
    }

    async fn call(&self, request: Request) -> Result<Response, ClientError> {
        let method = request.method_name();
        let call_id = self.inner.next_call.fetch_add(1, Ordering::Relaxed);
        let (reply, outcome) = oneshot::channel();
        self.inner.router.pending.insert(call_id, reply);

        if self.is_closed() || self.send(ClientMessage::Call { call_id, request }).is_err() {
            self.inner.router.pending.remove(&call_id);
            return Err(ClientError::Disconnected);
        }
        tracing::trace!(call_id, method, "call sent");

        match outcome.await {
            Ok(Outcome::Ok(response)) => Ok(response),
            Ok(Outcome::Fault(fault)) => Err(fault.into()),
            Err(_) => Err(ClientError::Disconnected),
        }
    }

    /// Run a cancellable call, relaying local cancellation to the server.
    async fn call_cancellable(
        &self,
        cancel: Option<&CancellationToken>,
        build: impl FnOnce(RemoteCancellationToken) -> Request,
    ) -> Result<Response, ClientError> {
        let token = RemoteCancellationToken::for_source(cancel);
        let request = build(token);
        let Some(cancel) = cancel else {
            return self.call(request).await;
        };
        if cancel.is_cancelled() {
            return Err(ClientError::Cancelled(request.method_name().to_string()));
        }

        let call = self.call(request);
        tokio::pin!(call);
        tokio::select! {
            result = &mut call => result,
            () = cancel.cancelled() => {
                tracing::debug!(%token, "sending cancel request");
                if self.send(ClientMessage::CancelAsync { token }).is_err() {
                    return Err(ClientError::Disconnected);
                }
                call.await
            }
        }
    }
}

/// Handle to one camera in a remote session.
#[derive(Clone)]
pub struct RemoteCamera {
    client: RemoteControlClient,
    index: i32,
    key: String,
}

impl std::fmt::Debug for RemoteCamera {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteCamera")
            .field("index", &self.index)
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl RemoteCamera {
    #[must_use]
    pub const fn index(&self) -> i32 {
        self.index
    }

    /// Correlation id carried by this camera's callbacks.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// This camera's callbacks, in the order the device raised them.
    pub fn events(&self) -> impl Stream<Item = CallbackEvent> + Send + 'static {
        let key = self.key.clone();
        BroadcastStream::new(self.client.callbacks()).filter_map(move |next| {
            let event = match next {
                Ok(event) if event.camera_key == key => Some(event),
                Ok(_) => None,
                Err(e) => {
                    tracing::warn!(camera_key = %key, error = %e, "callback stream lagged");
                    None
                }
            };
            futures::future::ready(event)
        })
    }

    /// # Errors
    /// Returns the server fault on failure.
    pub async fn remove(self) -> Result<(), ClientError> {
        let index = self.index;
        reply!("RemoveCamera", self.client.call(Request::RemoveCamera { index }).await?, Response::Unit => ())
    }

    /// # Errors
    /// Returns the server fault on failure.
    pub async fn model(&self) -> Result<String, ClientError> {
        let index = self.index;
        reply!("GetCameraModel", self.client.call(Request::GetCameraModel { index }).await?, Response::Text(s) => s)
    }

    /// # Errors
    /// Returns the server fault on failure.
    pub async fn serial_number(&self) -> Result<String, ClientError> {
        let index = self.index;
        reply!("GetSerialNumber", self.client.call(Request::GetSerialNumber { index }).await?, Response::Text(s) => s)
    }

    /// # Errors
    /// Returns the server fault on failure.
    pub async fn capabilities(&self) -> Result<CameraCapabilities, ClientError> {
        let index = self.index;
        reply!("GetCapabilities", self.client.call(Request::GetCapabilities { index }).await?, Response::Capabilities(c) => c)
    }

    /// # Errors
    /// Returns the server fault on failure.
    pub async fn properties(&self) -> Result<CameraProperties, ClientError> {
        let index = self.index;
        reply!("GetProperties", self.client.call(Request::GetProperties { index }).await?, Response::Properties(p) => p)
    }

    /// # Errors
    /// Returns the server fault on failure.
    pub async fn is_active(&self) -> Result<bool, ClientError> {
        let index = self.index;
        reply!("IsActive", self.client.call(Request::IsActive { index }).await?, Response::Bool(b) => b)
    }

    /// # Errors
    /// Returns the server fault on failure.
    pub async fn is_initialized(&self) -> Result<bool, ClientError> {
        let index = self.index;
        reply!("IsInitialized", self.client.call(Request::IsInitialized { index }).await?, Response::Bool(b) => b)
    }

    /// # Errors
    /// Returns the server fault on failure.
    pub async fn is_acquiring(&self) -> Result<bool, ClientError> {
        let index = self.index;
        reply!("IsAcquiring", self.client.call(Request::IsAcquiring { index }).await?, Response::Bool(b) => b)
    }

    /// # Errors
    /// Returns the server fault on failure.
    pub async fn current_temperature(&self) -> Result<TemperatureReading, ClientError> {
        let index = self.index;
        reply!("GetCurrentTemperature", self.client.call(Request::GetCurrentTemperature { index }).await?, Response::Temperature(t) => t)
    }

    /// # Errors
    /// Returns the server fault on failure.
    pub async fn fan_control(&self, mode: FanMode) -> Result<(), ClientError> {
        let index = self.index;
        reply!("FanControl", self.client.call(Request::FanControl { index, mode }).await?, Response::Unit => ())
    }

    /// # Errors
    /// Returns the server fault on failure.
    pub async fn cooler_control(&self, mode: Switch) -> Result<(), ClientError> {
        let index = self.index;
        reply!("CoolerControl", self.client.call(Request::CoolerControl { index, mode }).await?, Response::Unit => ())
    }

    /// # Errors
    /// Returns the server fault on failure.
    pub async fn set_temperature(&self, temperature: f32) -> Result<(), ClientError> {
        let index = self.index;
        reply!("SetTemperature", self.client.call(Request::SetTemperature { index, temperature }).await?, Response::Unit => ())
    }

    /// # Errors
    /// Returns the server fault on failure.
    pub async fn shutter_control(
        &self,
        internal: ShutterMode,
        external: Option<ShutterMode>,
    ) -> Result<(), ClientError> {
        let request = Request::ShutterControl {
            index: self.index,
            internal,
            external,
        };
        reply!("ShutterControl", self.client.call(request).await?, Response::Unit => ())
    }

    /// # Errors
    /// Returns the server fault on failure.
    pub async fn temperature_monitor(
        &self,
        mode: Switch,
        interval: Duration,
    ) -> Result<(), ClientError> {
        let request = Request::TemperatureMonitor {
            index: self.index,
            mode,
            interval_ms: u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
        };
        reply!("TemperatureMonitor", self.client.call(request).await?, Response::Unit => ())
    }

    /// # Errors
    /// Returns the server fault on failure.
    pub async fn abort_acquisition(&self) -> Result<(), ClientError> {
        let index = self.index;
        reply!("AbortAcquisition", self.client.call(Request::AbortAcquisition { index }).await?, Response::Unit => ())
    }

    /// # Errors
    /// Returns the server fault on failure.
    pub async fn start_image_saving_sequence(
        &self,
        folder: &str,
        prefix: &str,
    ) -> Result<(), ClientError> {
        let request = Request::StartImageSavingSequence {
            index: self.index,
            folder: folder.to_string(),
            prefix: prefix.to_string(),
        };
        reply!("StartImageSavingSequence", self.client.call(request).await?, Response::Unit => ())
    }

    /// Create a settings object bound to this camera.
    ///
    /// # Errors
    /// Returns the server fault on failure.
    pub async fn create_settings(&self) -> Result<RemoteSettings, ClientError> {
        let index = self.index;
        let id = reply!("CreateSettings", self.client.call(Request::CreateSettings { index }).await?, Response::SettingsId(id) => id)?;
        Ok(self.client.settings(id))
    }

    /// Run one acquisition.
    ///
    /// # Errors
    /// Returns `ClientError::Cancelled` if `cancel` fires and the server
    /// honours it, or the server fault on failure.
    pub async fn start_acquisition(
        &self,
        cancel: Option<&CancellationToken>,
    ) -> Result<(), ClientError> {
        let index = self.index;
        let response = self
            .client
            .call_cancellable(cancel, |token| Request::StartAcquisitionAsync { index, token })
            .await?;
        reply!("StartAcquisitionAsync", response, Response::Unit => ())
    }

    /// Pull every buffered frame.
    ///
    /// # Errors
    /// Returns `ClientError::Cancelled` on cancellation, the server fault on
    /// failure, or a protocol error for a malformed frame.
    pub async fn pull_all_images(
        &self,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<Image>, ClientError> {
        let index = self.index;
        let response = self
            .client
            .call_cancellable(cancel, |token| Request::PullAllImagesAsync { index, token })
            .await?;
        let frames = reply!("PullAllImagesAsync", response, Response::Images(frames) => frames)?;
        Ok(frames
            .into_iter()
            .map(Image::try_from)
            .collect::<Result<_, _>>()?)
    }

    /// Flush the image saving sequence, returning how many frames were saved.
    ///
    /// # Errors
    /// Returns `ClientError::Cancelled` on cancellation or the server fault on failure.
    pub async fn finish_image_saving_sequence(
        &self,
        cancel: Option<&CancellationToken>,
    ) -> Result<u32, ClientError> {
        let index = self.index;
        let response = self
            .client
            .call_cancellable(cancel, |token| Request::FinishImageSavingSequenceAsync {
                index,
                token,
            })
            .await?;
        reply!("FinishImageSavingSequenceAsync", response, Response::Count(n) => n)
    }
}

/// Handle to one settings object in a remote session.
#[derive(Clone)]
pub struct RemoteSettings {
    client: RemoteControlClient,
    id: String,
}

impl RemoteSettings {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Download the serialized settings.
    ///
    /// # Errors
    /// Returns the server fault on failure or a protocol error for bad base64.
    pub async fn payload(&self) -> Result<Vec<u8>, ClientError> {
        let request = Request::GetSettingsPayload {
            id: self.id.clone(),
        };
        let encoded = reply!("GetSettingsPayload", self.client.call(request).await?, Response::Payload(p) => p)?;
        Ok(crate::protocol::decode_payload(&encoded)?)
    }

    /// Upload serialized settings.
    ///
    /// # Errors
    /// Returns the server fault if the payload is rejected.
    pub async fn load_payload(&self, payload: &[u8]) -> Result<(), ClientError> {
        let request = Request::load_settings_payload(self.id.clone(), payload);
        reply!("LoadSettingsPayload", self.client.call(request).await?, Response::Unit => ())
    }

    /// Apply these settings to the owning camera.
    ///
    /// # Errors
    /// Returns the server fault if the camera rejects them.
    pub async fn apply(&self) -> Result<(), ClientError> {
        let request = Request::ApplySettings {
            id: self.id.clone(),
        };
        reply!("ApplySettings", self.client.call(request).await?, Response::Unit => ())
    }

    /// # Errors
    /// Returns the server fault on failure.
    pub async fn remove(self) -> Result<(), ClientError> {
        let request = Request::RemoveSettings { id: self.id };
        reply!("RemoveSettings", self.client.call(request).await?, Response::Unit => ())
    }
}
