//! Connection dispatcher.
//!
//! Drives one `SessionEndpoint` from a duplex message channel. Every `Call`
//! finishes on its own task so long-running operations never hold up the
//! connection. Long-running operations are started inline, before the next
//! frame is read, so a `CancelAsync` that follows its call always finds the
//! operation listening. The session is disconnected when the inbound side
//! closes.

use std::{sync::Arc, time::Duration};

use camera_remote_core::{
    CallbackEvent, DeviceFactory, EventSink, Fault, ReasonCode, SinkError,
};
use camera_remote_session::{EndpointConfig, HostContext, SessionEndpoint};
use futures::{FutureExt, Stream, StreamExt, future::BoxFuture};
use tokio::{sync::mpsc, task::JoinSet};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::protocol::{
    ClientMessage, Outcome, Request, Response, ServerMessage, WireImage, decode_payload,
};

/// Everything needed to open a session for a new connection.
#[derive(Clone)]
pub struct ServerContext {
    pub factory: Arc<dyn DeviceFactory>,
    pub host: HostContext,
    pub config: EndpointConfig,
}

impl ServerContext {
    #[must_use]
    pub fn new(factory: Arc<dyn DeviceFactory>, host: HostContext) -> Self {
        Self {
            factory,
            host,
            config: EndpointConfig::default(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: EndpointConfig) -> Self {
        self.config = config;
        self
    }

    fn open_session(&self, outbound: mpsc::UnboundedSender<ServerMessage>) -> SessionEndpoint {
        SessionEndpoint::new(Arc::clone(&self.factory), self.host.clone())
            .with_config(&self.config)
            .with_sink(Arc::new(ChannelSink::new(outbound)))
    }
}

/// Event sink writing callbacks into a connection's outbound queue.
pub struct ChannelSink {
    outbound: mpsc::UnboundedSender<ServerMessage>,
}

impl ChannelSink {
    #[must_use]
    pub const fn new(outbound: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self { outbound }
    }
}

impl EventSink for ChannelSink {
    fn notify(&self, event: CallbackEvent) -> Result<(), SinkError> {
        self.outbound
            .send(ServerMessage::Callback { event })
            .map_err(|_| SinkError::Closed)
    }
}

/// Serve one connection until `inbound` ends.
pub async fn serve_connection<S>(
    mut inbound: S,
    outbound: mpsc::UnboundedSender<ServerMessage>,
    context: ServerContext,
) where
    S: Stream<Item = ClientMessage> + Unpin,
{
    let endpoint = Arc::new(context.open_session(outbound.clone()));
    let mut calls = JoinSet::new();

    while let Some(message) = inbound.next().await {
        match message {
            ClientMessage::Call { call_id, request } => {
                let method = request.method_name();
                let reply = prepare(&endpoint, request);
                let outbound = outbound.clone();
                calls.spawn(async move {
                    let outcome = Outcome::from(reply.await);
                    if outbound
                        .send(ServerMessage::Reply { call_id, outcome })
                        .is_err()
                    {
                        tracing::debug!(call_id, method, "reply dropped, connection closed");
                    }
                });
            }
            ClientMessage::CancelAsync { token } => endpoint.cancel_async(token),
            ClientMessage::Ping => {
                let _ = outbound.send(ServerMessage::Pong);
            }
        }
        while calls.try_join_next().is_some() {}
    }

    tracing::info!(session_id = ?endpoint.session_id(), "connection closed");
    if let Err(fault) = endpoint.disconnect() {
        tracing::warn!(%fault, "session teardown incomplete");
    }
    while calls.join_next().await.is_some() {}
}

/// Serve a connection over in-process channels.
///
/// Returns the client's ends: the sender for client frames and the receiver
/// for server frames. Dropping the sender closes the session.
#[must_use]
pub fn spawn_local(
    context: ServerContext,
) -> (
    mpsc::UnboundedSender<ClientMessage>,
    mpsc::UnboundedReceiver<ServerMessage>,
) {
    let (client_tx, client_rx) = mpsc::unbounded_channel();
    let (server_tx, server_rx) = mpsc::unbounded_channel();
    tokio::spawn(serve_connection(
        UnboundedReceiverStream::new(client_rx),
        server_tx,
        context,
    ));
    (client_tx, server_rx)
}

/// Start one request against the endpoint.
///
/// Long-running operations are registered with the endpoint and subscribed
/// to cancellation before this returns; the returned future only waits for
/// them. Every other request runs when the future is polled.
#[must_use]
pub fn prepare(
    endpoint: &Arc<SessionEndpoint>,
    request: Request,
) -> BoxFuture<'static, Result<Response, Fault>> {
    match request {
        Request::StartAcquisitionAsync { index, token } => {
            let pending = endpoint.begin_acquisition(index, token);
            async move { pending?.end().await.map(|()| Response::Unit) }.boxed()
        }
        Request::PullAllImagesAsync { index, token } => {
            let pending = endpoint.begin_pull_all_images(index, token);
            async move {
                let images = pending?.end().await?;
                Ok(Response::Images(images.iter().map(WireImage::from).collect()))
            }
            .boxed()
        }
        Request::FinishImageSavingSequenceAsync { index, token } => {
            let pending = endpoint.begin_finish_image_saving_sequence(index, token);
            async move { pending?.end().await.map(Response::Count) }.boxed()
        }
        request => {
            let endpoint = Arc::clone(endpoint);
            async move { execute(&endpoint, request).await }.boxed()
        }
    }
}

/// Run one request against the endpoint.
///
/// # Errors
/// Returns the endpoint's fault, or a service fault for an undecodable payload.
pub async fn execute(endpoint: &SessionEndpoint, request: Request) -> Result<Response, Fault> {
    let method = request.method_name();
    let unit = |()| Response::Unit;

    match request {
        Request::Connect => endpoint.connect().map(Response::SessionId),
        Request::Disconnect => endpoint.disconnect().map(unit),
        Request::GetNumberOfCameras => endpoint.number_of_cameras().map(Response::Count),
        Request::ListCameras => endpoint.list_cameras().map(Response::Indices),
        Request::CreateCamera { index } => endpoint.create_camera(index).await.map(unit),
        Request::RemoveCamera { index } => endpoint.remove_camera(index).map(unit),
        Request::CreateSettings { index } => {
            endpoint.create_settings(index).map(Response::SettingsId)
        }
        Request::RemoveSettings { id } => endpoint.remove_settings(&id).map(unit),
        Request::GetSettingsPayload { id } => endpoint
            .settings_payload(&id)
            .map(|payload| Response::payload(&payload)),
        Request::LoadSettingsPayload { id, payload } => {
            endpoint.check_session(method)?;
            let payload = decode_payload(&payload).map_err(|e| {
                Fault::service(
                    method,
                    ReasonCode::GeneralServiceError,
                    "Invalid settings payload",
                    e.to_string(),
                )
            })?;
            endpoint.load_settings_payload(&id, &payload).map(unit)
        }
        Request::ApplySettings { id } => endpoint.apply_settings(&id).map(unit),
        Request::GetCameraModel { index } => endpoint.camera_model(index).map(Response::Text),
        Request::GetSerialNumber { index } => endpoint.serial_number(index).map(Response::Text),
        Request::GetCapabilities { index } => {
            endpoint.capabilities(index).map(Response::Capabilities)
        }
        Request::GetProperties { index } => endpoint.properties(index).map(Response::Properties),
        Request::IsActive { index } => endpoint.is_active(index).map(Response::Bool),
        Request::IsInitialized { index } => endpoint.is_initialized(index).map(Response::Bool),
        Request::IsAcquiring { index } => endpoint.is_acquiring(index).map(Response::Bool),
        Request::GetCurrentTemperature { index } => endpoint
            .current_temperature(index)
            .map(Response::Temperature),
        Request::FanControl { index, mode } => endpoint.fan_control(index, mode).map(unit),
        Request::CoolerControl { index, mode } => endpoint.cooler_control(index, mode).map(unit),
        Request::SetTemperature { index, temperature } => {
            endpoint.set_temperature(index, temperature).map(unit)
        }
        Request::ShutterControl {
            index,
            internal,
            external,
        } => endpoint.shutter_control(index, internal, external).map(unit),
        Request::TemperatureMonitor {
            index,
            mode,
            interval_ms,
        } => endpoint
            .temperature_monitor(index, mode, Duration::from_millis(interval_ms))
            .map(unit),
        Request::AbortAcquisition { index } => endpoint.abort_acquisition(index).map(unit),
        Request::StartImageSavingSequence {
            index,
            folder,
            prefix,
        } => endpoint
            .start_image_saving_sequence(index, &folder, &prefix)
            .map(unit),
        Request::StartAcquisitionAsync { index, token } => {
            endpoint.start_acquisition(index, token).await.map(unit)
        }
        Request::PullAllImagesAsync { index, token } => endpoint
            .pull_all_images(index, token)
            .await
            .map(|images| Response::Images(images.iter().map(WireImage::from).collect())),
        Request::FinishImageSavingSequenceAsync { index, token } => endpoint
            .finish_image_saving_sequence(index, token)
            .await
            .map(Response::Count),
    }
}
