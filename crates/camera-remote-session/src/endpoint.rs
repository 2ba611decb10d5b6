//! Session endpoint.
//!
//! One endpoint per client connection. It owns the device and settings
//! registries, the cancellation bus, and the forwarders relaying device events
//! to the client. Every public method returns `Result<_, Fault>`.

use std::{
    future::Future,
    sync::{
        Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use camera_remote_core::{
    AcquisitionOps, CameraCapabilities, CameraProperties, ControlOps, Device, DeviceError,
    DeviceFactory, EventSink, EventSource, FanMode, Fault, Image, NullSink, RemoteCancellationToken, ShutterMode, Switch,
    TemperatureReading, camera_key,
};
use chrono::Utc;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::{
    AsyncOperation, Cancellation, CancellationBus, CompletionCallback, EndpointConfig,
    EndpointError, EventForwarder, HostContext,
    registry::{DeviceEntry, DeviceRegistry, SettingsEntry, SettingsHandle, SettingsRegistry},
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionState {
    Unconnected,
    Connected(String),
    Disposed,
}

/// Bookkeeping for an in-flight long-running operation.
struct InFlight {
    device_index: i32,
    device_generation: u64,
    method: &'static str,
    source: CancellationToken,
}

/// Removes an operation's bookkeeping when dropped.
struct Registration {
    id: u64,
    operations: Arc<DashMap<u64, InFlight>>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.operations.remove(&self.id);
    }
}

/// A started long-running operation, already listening for cancellation.
///
/// Dropping it without calling [`end`](Self::end) aborts the operation.
pub struct PendingOperation<T> {
    operation: AsyncOperation<T>,
    registration: Registration,
}

impl<T: Send + 'static> PendingOperation<T> {
    /// Wait for the operation's translated result.
    ///
    /// # Errors
    /// Returns `Fault::Cancelled` if cancelled via its token or camera removal.
    pub async fn end(self) -> Result<T, Fault> {
        let Self {
            operation,
            registration,
        } = self;
        let result = operation.end().await;
        drop(registration);
        result
    }
}

/// Per-connection session endpoint.
pub struct SessionEndpoint {
    factory: Arc<dyn DeviceFactory>,
    host: HostContext,
    sink: Arc<dyn EventSink>,
    state: RwLock<SessionState>,
    devices: DeviceRegistry,
    settings: SettingsRegistry,
    operations: Arc<DashMap<u64, InFlight>>,
    next_operation: AtomicU64,
    cancellation: CancellationBus,
}

impl SessionEndpoint {
    /// Create an endpoint that drops device events until a sink is attached.
    #[must_use]
    pub fn new(factory: Arc<dyn DeviceFactory>, host: HostContext) -> Self {
        Self {
            factory,
            host,
            sink: Arc::new(NullSink),
            state: RwLock::new(SessionState::Unconnected),
            devices: DeviceRegistry::new(),
            settings: SettingsRegistry::new(),
            operations: Arc::new(DashMap::new()),
            next_operation: AtomicU64::new(0),
            cancellation: CancellationBus::default(),
        }
    }

    /// Set the client callback channel.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: &EndpointConfig) -> Self {
        self.cancellation = CancellationBus::new(config.cancellation_capacity);
        self
    }

    // ---------------------------------------------------------------------
    // Session lifecycle
    // ---------------------------------------------------------------------

    /// Open the session and return its id. Connecting twice returns the same id.
    ///
    /// # Errors
    /// Returns a service fault if the hosting context is unavailable or the
    /// session was already disposed.
    pub fn connect(&self) -> Result<String, Fault> {
        const METHOD: &str = "Connect";
        let mut state = self.write_state();
        if let SessionState::Connected(id) = &*state {
            return Ok(id.clone());
        }
        if *state == SessionState::Disposed {
            return Err(EndpointError::Disposed.into_fault(METHOD));
        }
        let id = self
            .host
            .derive_session_id(Utc::now())
            .ok_or_else(|| EndpointError::HostUnavailable.into_fault(METHOD))?;
        tracing::info!(session_id = %id, "session connected");
        *state = SessionState::Connected(id.clone());
        Ok(id)
    }

    /// Tear down every owned resource and dispose the session.
    ///
    /// Teardown is best-effort: all steps run even if some fail. Calling this
    /// again after the session is disposed has no effect.
    ///
    /// # Errors
    /// Returns a `DisposalFailed` service fault listing the failed steps.
    pub fn disconnect(&self) -> Result<(), Fault> {
        let previous = std::mem::replace(&mut *self.write_state(), SessionState::Disposed);
        let session_id = match previous {
            SessionState::Disposed => {
                tracing::debug!("disconnect on disposed session ignored");
                return Ok(());
            }
            SessionState::Connected(id) => id,
            SessionState::Unconnected => String::new(),
        };
        tracing::info!(%session_id, cameras = self.devices.len(), "session disconnecting");

        let mut failures = Vec::new();
        for index in self.devices.indices() {
            match self.teardown_camera(index) {
                Ok(()) | Err(EndpointError::CameraNotFound(_)) => {}
                Err(EndpointError::Teardown(mut steps)) => failures.append(&mut steps),
                Err(e) => failures.push(e.to_string()),
            }
        }
        for (id, entry) in self.settings.drain() {
            if let Err(e) = entry.dispose() {
                failures.push(format!("settings {id}: {e}"));
            }
        }
        self.cancel_operations(|_| true);

        if failures.is_empty() {
            tracing::info!(%session_id, "session disposed");
            Ok(())
        } else {
            tracing::warn!(%session_id, failures = failures.len(), "session disposed with failures");
            Err(EndpointError::Teardown(failures).into_fault("Disconnect"))
        }
    }

    /// Session id, once connected.
    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        match &*self.read_state() {
            SessionState::Connected(id) => Some(id.clone()),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        *self.read_state() == SessionState::Disposed
    }

    /// Correlation id attached to callbacks from camera `index`.
    #[must_use]
    pub fn camera_key(&self, index: i32) -> Option<String> {
        self.session_id().map(|id| camera_key(&id, index))
    }

    /// Publish a cancellation request for the operation carrying `token`.
    ///
    /// One-way: nothing is reported back, and a request that matches nothing
    /// is silently dropped.
    pub fn cancel_async(&self, token: RemoteCancellationToken) {
        self.cancellation.request(token);
    }

    /// Check that `method` may run in the current session state.
    ///
    /// # Errors
    /// Returns a `session-unavailable` service fault before `connect` or after
    /// `disconnect`.
    pub fn check_session(&self, method: &str) -> Result<(), Fault> {
        self.guarded(method, || Ok(()))
    }

    #[must_use]
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    #[must_use]
    pub fn settings_count(&self) -> usize {
        self.settings.len()
    }

    #[must_use]
    pub fn operation_count(&self) -> usize {
        self.operations.len()
    }

    // ---------------------------------------------------------------------
    // Device registry
    // ---------------------------------------------------------------------

    /// Number of cameras visible to the driver.
    ///
    /// # Errors
    /// Returns a fault if the session is not connected or the driver fails.
    pub fn number_of_cameras(&self) -> Result<u32, Fault> {
        self.guarded("GetNumberOfCameras", || Ok(self.factory.available()?))
    }

    /// Indices of the cameras registered in this session.
    ///
    /// # Errors
    /// Returns a fault if the session is not connected.
    pub fn list_cameras(&self) -> Result<Vec<i32>, Fault> {
        self.guarded("ListCameras", || Ok(self.devices.indices()))
    }

    /// Open camera `index`, subscribe to its events and register it.
    ///
    /// # Errors
    /// Returns a service fault if the index is already registered, a device
    /// fault if the driver fails to open the camera.
    pub async fn create_camera(&self, index: i32) -> Result<(), Fault> {
        self.create_camera_inner(index)
            .await
            .map_err(|e| e.into_fault("CreateCamera"))
    }

    async fn create_camera_inner(&self, index: i32) -> Result<(), EndpointError> {
        let session_id = self.connected_id()?;
        if self.devices.contains(index) {
            return Err(EndpointError::DuplicateCamera(index));
        }

        let device = self.factory.create(index).await?;
        let forwarder = EventForwarder::spawn(
            camera_key(&session_id, index),
            index,
            device.subscribe(),
            Arc::clone(&self.sink),
        );

        let generation = match self.devices.try_insert(index, Arc::clone(&device), forwarder) {
            Ok(generation) => generation,
            Err((rejected, forwarder)) => {
                forwarder.stop();
                if let Err(e) = rejected.dispose() {
                    tracing::warn!(camera_index = index, error = %e, "failed to dispose duplicate camera");
                }
                return Err(EndpointError::DuplicateCamera(index));
            }
        };

        if self.connected_id().is_err() {
            // Disconnect ran while the camera was opening.
            if let Some(entry) = self.devices.remove_generation(index, generation) {
                if let Err(e) = self.release_camera(index, entry) {
                    tracing::warn!(camera_index = index, error = %e, "failed to release camera after disconnect");
                }
            }
            return Err(EndpointError::Disposed);
        }

        tracing::info!(%session_id, camera_index = index, generation, "camera created");
        Ok(())
    }

    /// Remove camera `index`: its settings and operations first, then the device.
    ///
    /// # Errors
    /// Returns a service fault if the camera does not exist or a teardown step failed.
    pub fn remove_camera(&self, index: i32) -> Result<(), Fault> {
        self.guarded("RemoveCamera", || self.teardown_camera(index))
    }

    fn teardown_camera(&self, index: i32) -> Result<(), EndpointError> {
        let entry = self
            .devices
            .remove(index)
            .ok_or(EndpointError::CameraNotFound(index))?;
        self.release_camera(index, entry)
    }

    fn release_camera(&self, index: i32, entry: DeviceEntry) -> Result<(), EndpointError> {
        let mut failures = Vec::new();

        let settings = self.settings.remove_for_device(index, entry.generation);
        let settings_count = settings.len();
        for (id, settings) in settings {
            if let Err(e) = settings.dispose() {
                tracing::warn!(settings_id = %id, error = %e, "failed to dispose settings");
                failures.push(format!("settings {id}: {e}"));
            }
        }

        let operations = self.cancel_operations(|op| {
            op.device_index == index && op.device_generation == entry.generation
        });

        if let Err(e) = entry.device.dispose() {
            tracing::warn!(camera_index = index, error = %e, "failed to dispose camera");
            failures.push(format!("camera {index}: {e}"));
        }
        entry.forwarder.stop();

        tracing::debug!(
            camera_index = index,
            settings = settings_count,
            operations,
            "camera released"
        );
        if failures.is_empty() {
            Ok(())
        } else {
            Err(EndpointError::Teardown(failures))
        }
    }

    fn cancel_operations(&self, predicate: impl Fn(&InFlight) -> bool) -> usize {
        let ids: Vec<u64> = self
            .operations
            .iter()
            .filter(|e| predicate(e.value()))
            .map(|e| *e.key())
            .collect();
        ids.into_iter()
            .filter_map(|id| self.operations.remove(&id))
            .map(|(id, op)| {
                tracing::debug!(operation = id, method = op.method, "cancelling operation");
                op.source.cancel();
            })
            .count()
    }

    // ---------------------------------------------------------------------
    // Settings registry
    // ---------------------------------------------------------------------

    /// Create a settings object bound to camera `index`.
    ///
    /// # Errors
    /// Returns a service fault if the camera does not exist.
    pub fn create_settings(&self, index: i32) -> Result<String, Fault> {
        self.guarded("CreateSettings", || {
            let (device, generation) = self.device(index)?;
            let settings = device.create_settings()?;
            let id = self
                .settings
                .insert(SettingsEntry::new(index, generation, settings));

            if self.devices.generation(index) != Some(generation) {
                // The camera was removed while the settings were being created.
                if let Some(entry) = self.settings.remove(&id) {
                    if let Err(e) = entry.dispose() {
                        tracing::warn!(settings_id = %id, camera_index = index, error = %e, "failed to dispose settings of removed camera");
                    }
                }
                return Err(EndpointError::CameraNotFound(index));
            }
            Ok(id)
        })
    }

    /// Remove and dispose a settings object.
    ///
    /// # Errors
    /// Returns a service fault if the id does not resolve or disposal fails.
    pub fn remove_settings(&self, id: &str) -> Result<(), Fault> {
        self.guarded("RemoveSettings", || {
            let entry = self
                .settings
                .remove(id)
                .ok_or_else(|| EndpointError::SettingsNotFound(id.to_string()))?;
            entry
                .dispose()
                .map_err(|e| EndpointError::Teardown(vec![format!("settings {id}: {e}")]))
        })
    }

    /// Serialized settings payload.
    ///
    /// # Errors
    /// Returns a service fault if the id does not resolve.
    pub fn settings_payload(&self, id: &str) -> Result<Vec<u8>, Fault> {
        self.guarded("GetSettingsPayload", || {
            let (_, handle) = self.settings_handle(id)?;
            let payload = handle.lock().to_bytes()?;
            Ok(payload)
        })
    }

    /// Replace a settings object's contents with a client payload.
    ///
    /// # Errors
    /// Returns a service fault if the id does not resolve or the payload is malformed.
    pub fn load_settings_payload(&self, id: &str, payload: &[u8]) -> Result<(), Fault> {
        self.guarded("LoadSettingsPayload", || {
            let (_, handle) = self.settings_handle(id)?;
            handle.lock().load_bytes(payload)?;
            Ok(())
        })
    }

    /// Apply a settings object to its camera.
    ///
    /// # Errors
    /// Returns a device fault if the camera rejects the settings.
    pub fn apply_settings(&self, id: &str) -> Result<(), Fault> {
        self.guarded("ApplySettings", || {
            let (index, handle) = self.settings_handle(id)?;
            let (device, _) = self.device(index)?;
            let settings = handle.lock();
            device.apply_settings(&**settings)?;
            Ok(())
        })
    }

    // ---------------------------------------------------------------------
    // Properties and control calls
    // ---------------------------------------------------------------------

    /// # Errors
    /// Returns a fault if the camera is missing or the driver fails.
    pub fn camera_model(&self, index: i32) -> Result<String, Fault> {
        self.with_device("GetCameraModel", index, |d| d.camera_model())
    }

    /// # Errors
    /// Returns a fault if the camera is missing or the driver fails.
    pub fn serial_number(&self, index: i32) -> Result<String, Fault> {
        self.with_device("GetSerialNumber", index, |d| d.serial_number())
    }

    /// # Errors
    /// Returns a fault if the camera is missing or the driver fails.
    pub fn capabilities(&self, index: i32) -> Result<CameraCapabilities, Fault> {
        self.with_device("GetCapabilities", index, |d| d.capabilities())
    }

    /// # Errors
    /// Returns a fault if the camera is missing or the driver fails.
    pub fn properties(&self, index: i32) -> Result<CameraProperties, Fault> {
        self.with_device("GetProperties", index, |d| d.properties())
    }

    /// # Errors
    /// Returns a fault if the camera is missing.
    pub fn is_active(&self, index: i32) -> Result<bool, Fault> {
        self.with_device("IsActive", index, |d| Ok(d.is_active()))
    }

    /// # Errors
    /// Returns a fault if the camera is missing.
    pub fn is_initialized(&self, index: i32) -> Result<bool, Fault> {
        self.with_device("IsInitialized", index, |d| Ok(d.is_initialized()))
    }

    /// # Errors
    /// Returns a fault if the camera is missing.
    pub fn is_acquiring(&self, index: i32) -> Result<bool, Fault> {
        self.with_device("IsAcquiring", index, |d| Ok(d.is_acquiring()))
    }

    /// # Errors
    /// Returns a fault if the camera is missing or the driver fails.
    pub fn current_temperature(&self, index: i32) -> Result<TemperatureReading, Fault> {
        self.with_device("GetCurrentTemperature", index, |d| d.current_temperature())
    }

    /// # Errors
    /// Returns a fault if the camera is missing or the driver fails.
    pub fn fan_control(&self, index: i32, mode: FanMode) -> Result<(), Fault> {
        self.with_device("FanControl", index, |d| d.fan_control(mode))
    }

    /// # Errors
    /// Returns a fault if the camera is missing or the driver fails.
    pub fn cooler_control(&self, index: i32, mode: Switch) -> Result<(), Fault> {
        self.with_device("CoolerControl", index, |d| d.cooler_control(mode))
    }

    /// # Errors
    /// Returns a fault if the camera is missing or the driver fails.
    pub fn set_temperature(&self, index: i32, temperature: f32) -> Result<(), Fault> {
        self.with_device("SetTemperature", index, |d| d.set_temperature(temperature))
    }

    /// # Errors
    /// Returns a fault if the camera is missing or the driver fails.
    pub fn shutter_control(
        &self,
        index: i32,
        internal: ShutterMode,
        external: Option<ShutterMode>,
    ) -> Result<(), Fault> {
        self.with_device("ShutterControl", index, |d| {
            d.shutter_control(internal, external)
        })
    }

    /// # Errors
    /// Returns a fault if the camera is missing or the driver fails.
    pub fn temperature_monitor(
        &self,
        index: i32,
        mode: Switch,
        interval: Duration,
    ) -> Result<(), Fault> {
        self.with_device("TemperatureMonitor", index, |d| {
            d.temperature_monitor(mode, interval)
        })
    }

    /// # Errors
    /// Returns a fault if the camera is missing or not acquiring.
    pub fn abort_acquisition(&self, index: i32) -> Result<(), Fault> {
        self.with_device("AbortAcquisition", index, |d| d.abort_acquisition())
    }

    /// # Errors
    /// Returns a fault if the camera is missing or the driver fails.
    pub fn start_image_saving_sequence(
        &self,
        index: i32,
        folder: &str,
        prefix: &str,
    ) -> Result<(), Fault> {
        self.with_device("StartImageSavingSequence", index, |d| {
            d.start_image_saving_sequence(folder, prefix)
        })
    }

    // ---------------------------------------------------------------------
    // Long-running operations
    // ---------------------------------------------------------------------

    /// Run one acquisition.
    ///
    /// # Errors
    /// Returns `Fault::Cancelled` if cancelled via `token` or camera removal.
    pub async fn start_acquisition(
        &self,
        index: i32,
        token: RemoteCancellationToken,
    ) -> Result<(), Fault> {
        self.begin_acquisition(index, token)?.end().await
    }

    /// Start an acquisition without waiting for it.
    ///
    /// # Errors
    /// Returns a service fault if the session or camera is unavailable.
    pub fn begin_acquisition(
        &self,
        index: i32,
        token: RemoteCancellationToken,
    ) -> Result<PendingOperation<()>, Fault> {
        self.begin_operation("StartAcquisitionAsync", index, token, |device, cancel| async move {
            device.start_acquisition(cancel).await
        })
    }

    /// Pull every buffered frame.
    ///
    /// # Errors
    /// Returns `Fault::Cancelled` if cancelled via `token` or camera removal.
    pub async fn pull_all_images(
        &self,
        index: i32,
        token: RemoteCancellationToken,
    ) -> Result<Vec<Image>, Fault> {
        self.begin_pull_all_images(index, token)?.end().await
    }

    /// # Errors
    /// Returns a service fault if the session or camera is unavailable.
    pub fn begin_pull_all_images(
        &self,
        index: i32,
        token: RemoteCancellationToken,
    ) -> Result<PendingOperation<Vec<Image>>, Fault> {
        self.begin_operation("PullAllImagesAsync", index, token, |device, cancel| async move {
            device.pull_all_images(cancel).await
        })
    }

    /// Flush the image saving sequence, returning how many frames were saved.
    ///
    /// # Errors
    /// Returns `Fault::Cancelled` if cancelled via `token` or camera removal.
    pub async fn finish_image_saving_sequence(
        &self,
        index: i32,
        token: RemoteCancellationToken,
    ) -> Result<u32, Fault> {
        self.begin_finish_image_saving_sequence(index, token)?
            .end()
            .await
    }

    /// # Errors
    /// Returns a service fault if the session or camera is unavailable.
    pub fn begin_finish_image_saving_sequence(
        &self,
        index: i32,
        token: RemoteCancellationToken,
    ) -> Result<PendingOperation<u32>, Fault> {
        self.begin_operation(
            "FinishImageSavingSequenceAsync",
            index,
            token,
            |device, cancel| async move { device.finish_image_saving_sequence(cancel).await },
        )
    }

    /// Register the operation and subscribe it to the cancellation bus before
    /// returning. A `cancel_async` issued after this returns reaches it.
    fn begin_operation<T, F, Fut>(
        &self,
        method: &'static str,
        index: i32,
        token: RemoteCancellationToken,
        work: F,
    ) -> Result<PendingOperation<T>, Fault>
    where
        T: Send + 'static,
        F: FnOnce(Arc<dyn Device>, CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, DeviceError>> + Send + 'static,
    {
        let (device, generation) = self
            .ensure_connected()
            .and_then(|()| self.device(index))
            .map_err(|e| e.into_fault(method))?;

        let source = CancellationToken::new();
        let id = self.next_operation.fetch_add(1, Ordering::Relaxed);
        self.operations.insert(
            id,
            InFlight {
                device_index: index,
                device_generation: generation,
                method,
                source: source.clone(),
            },
        );
        let registration = Registration {
            id,
            operations: Arc::clone(&self.operations),
        };
        if self.devices.generation(index) != Some(generation) {
            return Err(EndpointError::CameraNotFound(index).into_fault(method));
        }

        let operations = Arc::clone(&self.operations);
        let on_complete: CompletionCallback = Box::new(move |state| {
            operations.remove(&id);
            tracing::debug!(method, operation = id, ?state, "operation finished");
        });

        tracing::debug!(method, operation = id, camera_index = index, %token, "operation started");
        let operation = AsyncOperation::spawn(
            method,
            work(device, source.clone()),
            Some(Cancellation { source, token }),
            &self.cancellation,
            Some(on_complete),
        );
        Ok(PendingOperation {
            operation,
            registration,
        })
    }

    // ---------------------------------------------------------------------
    // Helpers
    // ---------------------------------------------------------------------

    fn read_state(&self) -> RwLockReadGuard<'_, SessionState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, SessionState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn connected_id(&self) -> Result<String, EndpointError> {
        match &*self.read_state() {
            SessionState::Connected(id) => Ok(id.clone()),
            SessionState::Unconnected => Err(EndpointError::NotConnected),
            SessionState::Disposed => Err(EndpointError::Disposed),
        }
    }

    fn ensure_connected(&self) -> Result<(), EndpointError> {
        self.connected_id().map(|_| ())
    }

    fn device(&self, index: i32) -> Result<(Arc<dyn Device>, u64), EndpointError> {
        self.devices
            .get(index)
            .ok_or(EndpointError::CameraNotFound(index))
    }

    fn settings_handle(
        &self,
        id: &str,
    ) -> Result<(i32, SettingsHandle), EndpointError> {
        self.settings
            .get(id)
            .ok_or_else(|| EndpointError::SettingsNotFound(id.to_string()))
    }

    fn guarded<T>(
        &self,
        method: &str,
        f: impl FnOnce() -> Result<T, EndpointError>,
    ) -> Result<T, Fault> {
        self.ensure_connected()
            .and_then(|()| f())
            .map_err(|e| e.into_fault(method))
    }

    fn with_device<T>(
        &self,
        method: &str,
        index: i32,
        f: impl FnOnce(&dyn Device) -> Result<T, DeviceError>,
    ) -> Result<T, Fault> {
        self.guarded(method, || {
            let (device, _) = self.device(index)?;
            Ok(f(&*device)?)
        })
    }
}

impl Drop for SessionEndpoint {
    fn drop(&mut self) {
        if !self.is_disposed() {
            if let Err(fault) = self.disconnect() {
                tracing::warn!(%fault, "teardown on drop incomplete");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        any::Any,
        sync::{Mutex, OnceLock, Weak},
        time::Instant,
    };

    use async_trait::async_trait;
    use camera_remote_core::{
        AcquisitionOps, AcquisitionStatus, CallbackEvent, CameraSettings, ControlOps, DeviceEvent,
        FaultKind, ReasonCode,
        simulated::{
            SimulatedCamera, SimulatedCameraConfig, SimulatedFactory, SimulatedSettings,
        },
    };
    use tokio::sync::{broadcast, mpsc};
    use tokio_test::{assert_err, assert_ok};

    use super::*;

    fn host() -> HostContext {
        HostContext::new(vec!["127.0.0.1:3000".parse().unwrap()])
    }

    fn fast_config(frame_ms: u64) -> SimulatedCameraConfig {
        SimulatedCameraConfig {
            frame_interval: Duration::from_millis(frame_ms),
            ..SimulatedCameraConfig::default()
        }
    }

    fn connected(frame_ms: u64) -> SessionEndpoint {
        let factory = SimulatedFactory::new(4).with_config(fast_config(frame_ms));
        let endpoint = SessionEndpoint::new(Arc::new(factory), host());
        assert_ok!(endpoint.connect());
        endpoint
    }

    async fn wait_for_operations(endpoint: &SessionEndpoint, count: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while endpoint.operation_count() != count {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
    }

    /// Factory that keeps the cameras it creates so tests can fire events.
    #[derive(Default)]
    struct KeepingFactory {
        created: Mutex<Vec<Arc<SimulatedCamera>>>,
    }

    #[async_trait]
    impl DeviceFactory for KeepingFactory {
        fn available(&self) -> Result<u32, DeviceError> {
            Ok(1)
        }

        async fn create(&self, index: i32) -> Result<Arc<dyn Device>, DeviceError> {
            let camera = Arc::new(SimulatedCamera::new(index, fast_config(1)));
            self.created.lock().unwrap().push(Arc::clone(&camera));
            Ok(camera)
        }
    }

    /// Late-bound endpoint a camera removes itself from.
    type Evictor = Arc<OnceLock<Weak<SessionEndpoint>>>;

    /// Camera that records teardown order.
    struct ScriptedCamera {
        index: i32,
        inner: SimulatedCamera,
        log: Arc<Mutex<Vec<String>>>,
        acquisition: Mutex<Option<CancellationToken>>,
        fail_dispose: bool,
        evict_on_settings: Option<Evictor>,
    }

    struct ScriptedSettings {
        inner: SimulatedSettings,
        log: Arc<Mutex<Vec<String>>>,
        fail_dispose: bool,
    }

    impl CameraSettings for ScriptedSettings {
        fn to_bytes(&self) -> Result<Vec<u8>, DeviceError> {
            self.inner.to_bytes()
        }

        fn load_bytes(&mut self, payload: &[u8]) -> Result<(), DeviceError> {
            self.inner.load_bytes(payload)
        }

        fn dispose(&mut self) -> Result<(), DeviceError> {
            self.log.lock().unwrap().push("settings disposed".into());
            if self.fail_dispose {
                return Err(DeviceError::vendor(20_099, "DisposeSettings", "release failed"));
            }
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            &self.inner
        }
    }

    impl ControlOps for ScriptedCamera {
        fn camera_model(&self) -> Result<String, DeviceError> {
            self.inner.camera_model()
        }
        fn serial_number(&self) -> Result<String, DeviceError> {
            self.inner.serial_number()
        }
        fn capabilities(&self) -> Result<CameraCapabilities, DeviceError> {
            self.inner.capabilities()
        }
        fn properties(&self) -> Result<CameraProperties, DeviceError> {
            self.inner.properties()
        }
        fn is_active(&self) -> bool {
            self.inner.is_active()
        }
        fn is_initialized(&self) -> bool {
            self.inner.is_initialized()
        }
        fn is_acquiring(&self) -> bool {
            self.inner.is_acquiring()
        }
        fn current_temperature(&self) -> Result<TemperatureReading, DeviceError> {
            self.inner.current_temperature()
        }
        fn fan_control(&self, mode: FanMode) -> Result<(), DeviceError> {
            self.inner.fan_control(mode)
        }
        fn cooler_control(&self, mode: Switch) -> Result<(), DeviceError> {
            self.inner.cooler_control(mode)
        }
        fn set_temperature(&self, temperature: f32) -> Result<(), DeviceError> {
            self.inner.set_temperature(temperature)
        }
        fn shutter_control(
            &self,
            internal: ShutterMode,
            external: Option<ShutterMode>,
        ) -> Result<(), DeviceError> {
            self.inner.shutter_control(internal, external)
        }
        fn temperature_monitor(&self, mode: Switch, interval: Duration) -> Result<(), DeviceError> {
            self.inner.temperature_monitor(mode, interval)
        }
        fn abort_acquisition(&self) -> Result<(), DeviceError> {
            self.inner.abort_acquisition()
        }
        fn start_image_saving_sequence(&self, folder: &str, prefix: &str) -> Result<(), DeviceError> {
            self.inner.start_image_saving_sequence(folder, prefix)
        }
        fn create_settings(&self) -> Result<Box<dyn CameraSettings>, DeviceError> {
            // Simulates a RemoveCamera landing while the settings are created.
            if let Some(endpoint) = self
                .evict_on_settings
                .as_ref()
                .and_then(|cell| cell.get())
                .and_then(Weak::upgrade)
            {
                let _ = endpoint.remove_camera(self.index);
            }
            Ok(Box::new(ScriptedSettings {
                inner: SimulatedSettings::default(),
                log: Arc::clone(&self.log),
                fail_dispose: self.fail_dispose,
            }))
        }
        fn apply_settings(&self, settings: &dyn CameraSettings) -> Result<(), DeviceError> {
            self.inner.apply_settings(settings)
        }
        fn dispose(&self) -> Result<(), DeviceError> {
            let cancelled = self
                .acquisition
                .lock()
                .unwrap()
                .as_ref()
                .is_some_and(CancellationToken::is_cancelled);
            self.log
                .lock()
                .unwrap()
                .push(format!("device disposed, acquisition cancelled: {cancelled}"));
            if self.fail_dispose {
                return Err(DeviceError::vendor(20_099, "Dispose", "shutdown failed"));
            }
            self.inner.dispose()
        }
    }

    #[async_trait]
    impl AcquisitionOps for ScriptedCamera {
        async fn start_acquisition(&self, cancel: CancellationToken) -> Result<(), DeviceError> {
            *self.acquisition.lock().unwrap() = Some(cancel.clone());
            cancel.cancelled().await;
            Err(DeviceError::Cancelled)
        }
        async fn pull_all_images(&self, cancel: CancellationToken) -> Result<Vec<Image>, DeviceError> {
            self.inner.pull_all_images(cancel).await
        }
        async fn finish_image_saving_sequence(
            &self,
            cancel: CancellationToken,
        ) -> Result<u32, DeviceError> {
            self.inner.finish_image_saving_sequence(cancel).await
        }
    }

    impl EventSource for ScriptedCamera {
        fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
            self.inner.subscribe()
        }
    }

    struct ScriptedFactory {
        log: Arc<Mutex<Vec<String>>>,
        fail_dispose: bool,
        evict_on_settings: Option<Evictor>,
    }

    #[async_trait]
    impl DeviceFactory for ScriptedFactory {
        fn available(&self) -> Result<u32, DeviceError> {
            Ok(2)
        }

        async fn create(&self, index: i32) -> Result<Arc<dyn Device>, DeviceError> {
            Ok(Arc::new(ScriptedCamera {
                index,
                inner: SimulatedCamera::new(index, fast_config(1)),
                log: Arc::clone(&self.log),
                acquisition: Mutex::new(None),
                fail_dispose: self.fail_dispose,
                evict_on_settings: self.evict_on_settings.clone(),
            }))
        }
    }

    #[test]
    fn test_connect_requires_host() {
        let endpoint =
            SessionEndpoint::new(Arc::new(SimulatedFactory::new(1)), HostContext::default());
        let fault = assert_err!(endpoint.connect());
        assert_eq!(fault.reason(), ReasonCode::SessionUnavailable);
    }

    #[test]
    fn test_calls_before_connect_fail() {
        let endpoint = SessionEndpoint::new(Arc::new(SimulatedFactory::new(1)), host());
        let fault = assert_err!(endpoint.list_cameras());
        assert_eq!(fault.kind(), FaultKind::Service);
        assert_eq!(fault.reason(), ReasonCode::SessionUnavailable);
    }

    #[test]
    fn test_check_session_follows_lifecycle() {
        let endpoint = SessionEndpoint::new(Arc::new(SimulatedFactory::new(1)), host());
        let fault = assert_err!(endpoint.check_session("LoadSettingsPayload"));
        assert_eq!(fault.reason(), ReasonCode::SessionUnavailable);
        assert_eq!(fault.detail().method_name, "LoadSettingsPayload");

        assert_ok!(endpoint.connect());
        assert_ok!(endpoint.check_session("LoadSettingsPayload"));

        assert_ok!(endpoint.disconnect());
        let fault = assert_err!(endpoint.check_session("LoadSettingsPayload"));
        assert_eq!(fault.reason(), ReasonCode::SessionUnavailable);
    }

    #[test]
    fn test_connect_is_stable() {
        let endpoint = SessionEndpoint::new(Arc::new(SimulatedFactory::new(1)), host());
        let first = assert_ok!(endpoint.connect());
        let second = assert_ok!(endpoint.connect());
        assert_eq!(first, second);
        assert_eq!(endpoint.camera_key(3), Some(format!("{first}:3")));
    }

    #[tokio::test]
    async fn test_disconnect_leaves_registries_empty() {
        let endpoint = Arc::new(connected(50));
        assert_ok!(endpoint.create_camera(0).await);
        assert_ok!(endpoint.create_camera(1).await);
        assert_ok!(endpoint.create_settings(0));
        assert_ok!(endpoint.create_settings(1));

        let running = {
            let endpoint = Arc::clone(&endpoint);
            tokio::spawn(async move {
                endpoint
                    .start_acquisition(0, RemoteCancellationToken::NotCancellable)
                    .await
            })
        };
        wait_for_operations(&endpoint, 1).await;

        assert_ok!(endpoint.disconnect());
        assert_eq!(endpoint.device_count(), 0);
        assert_eq!(endpoint.settings_count(), 0);
        assert_eq!(endpoint.operation_count(), 0);

        let fault = running.await.unwrap().unwrap_err();
        assert!(fault.is_cancelled());
    }

    #[tokio::test]
    async fn test_disconnect_twice_and_calls_after_disposal() {
        let endpoint = connected(1);
        assert_ok!(endpoint.disconnect());
        assert_ok!(endpoint.disconnect());

        let fault = assert_err!(endpoint.create_camera(0).await);
        assert_eq!(fault.reason(), ReasonCode::SessionUnavailable);
        assert_eq!(
            assert_err!(endpoint.connect()).reason(),
            ReasonCode::SessionUnavailable
        );
    }

    #[tokio::test]
    async fn test_remove_camera_cascades_before_dispose() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let factory = ScriptedFactory {
            log: Arc::clone(&log),
            fail_dispose: false,
            evict_on_settings: None,
        };
        let endpoint = Arc::new(SessionEndpoint::new(Arc::new(factory), host()));
        assert_ok!(endpoint.connect());
        assert_ok!(endpoint.create_camera(0).await);
        assert_ok!(endpoint.create_camera(1).await);
        assert_ok!(endpoint.create_settings(0));
        assert_ok!(endpoint.create_settings(0));
        let survivor = assert_ok!(endpoint.create_settings(1));

        let running = {
            let endpoint = Arc::clone(&endpoint);
            tokio::spawn(async move {
                endpoint
                    .start_acquisition(0, RemoteCancellationToken::mint())
                    .await
            })
        };
        wait_for_operations(&endpoint, 1).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_ok!(endpoint.remove_camera(0));

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "settings disposed".to_string(),
                "settings disposed".to_string(),
                "device disposed, acquisition cancelled: true".to_string(),
            ]
        );
        assert!(running.await.unwrap().unwrap_err().is_cancelled());
        assert_eq!(endpoint.list_cameras().unwrap(), vec![1]);
        assert_ok!(endpoint.settings_payload(&survivor));
    }

    #[tokio::test]
    async fn test_teardown_failures_are_aggregated() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let factory = ScriptedFactory {
            log: Arc::clone(&log),
            fail_dispose: true,
            evict_on_settings: None,
        };
        let endpoint = SessionEndpoint::new(Arc::new(factory), host());
        assert_ok!(endpoint.connect());
        assert_ok!(endpoint.create_camera(0).await);
        assert_ok!(endpoint.create_camera(1).await);

        let fault = assert_err!(endpoint.disconnect());
        assert_eq!(fault.kind(), FaultKind::Service);
        assert_eq!(fault.reason(), ReasonCode::DisposalFailed);
        assert!(fault.detail().details.contains("camera 0"));
        assert!(fault.detail().details.contains("camera 1"));
        assert_eq!(endpoint.device_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_create_keeps_one_device() {
        let endpoint = connected(1);
        assert_ok!(endpoint.create_camera(0).await);
        let fault = assert_err!(endpoint.create_camera(0).await);
        assert_eq!(fault.kind(), FaultKind::Service);
        assert_eq!(fault.reason(), ReasonCode::CameraCommunication);
        assert_eq!(endpoint.list_cameras().unwrap(), vec![0]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_create_registers_once() {
        let endpoint = Arc::new(connected(1));
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let endpoint = Arc::clone(&endpoint);
                tokio::spawn(async move { endpoint.create_camera(2).await })
            })
            .collect();

        let mut successes = 0;
        for task in tasks {
            if task.await.unwrap().is_ok() {
                successes += 1;
            }
        }
        assert_eq!(successes, 1);
        assert_eq!(endpoint.device_count(), 1);
    }

    #[tokio::test]
    async fn test_cancel_async_targets_only_matching_operation() {
        let endpoint = Arc::new(connected(10));
        assert_ok!(endpoint.create_camera(0).await);
        assert_ok!(endpoint.create_camera(1).await);
        for index in [0, 1] {
            let id = endpoint.create_settings(index).unwrap();
            let payload = serde_json::to_vec(&SimulatedSettings {
                kinetic_count: 20,
                ..SimulatedSettings::default()
            })
            .unwrap();
            assert_ok!(endpoint.load_settings_payload(&id, &payload));
            assert_ok!(endpoint.apply_settings(&id));
        }

        let target = RemoteCancellationToken::mint();
        let bystander = RemoteCancellationToken::mint();
        let spawn = |index: i32, token: RemoteCancellationToken| {
            let endpoint = Arc::clone(&endpoint);
            tokio::spawn(async move { endpoint.start_acquisition(index, token).await })
        };
        let cancelled = spawn(0, target);
        let completed = spawn(1, bystander);
        wait_for_operations(&endpoint, 2).await;

        endpoint.cancel_async(RemoteCancellationToken::mint());
        endpoint.cancel_async(RemoteCancellationToken::NotCancellable);
        endpoint.cancel_async(target);

        let fault = cancelled.await.unwrap().unwrap_err();
        assert_eq!(fault.kind(), FaultKind::Cancelled);
        assert_eq!(fault.detail().method_name, "StartAcquisitionAsync");
        assert_ok!(completed.await.unwrap());

        let images = assert_ok!(
            endpoint
                .pull_all_images(1, RemoteCancellationToken::NotCancellable)
                .await
        );
        assert_eq!(images.len(), 20);
    }

    #[tokio::test]
    async fn test_cancel_right_after_begin_is_not_lost() {
        let endpoint = connected(200);
        assert_ok!(endpoint.create_camera(0).await);

        let token = RemoteCancellationToken::mint();
        let pending = assert_ok!(endpoint.begin_acquisition(0, token));
        endpoint.cancel_async(token);

        let started = Instant::now();
        let fault = assert_err!(pending.end().await);
        assert!(fault.is_cancelled());
        assert!(started.elapsed() < Duration::from_millis(200));
        assert_eq!(endpoint.operation_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_pending_operation_is_released() {
        let endpoint = connected(200);
        assert_ok!(endpoint.create_camera(0).await);

        let pending = assert_ok!(endpoint.begin_acquisition(0, RemoteCancellationToken::mint()));
        assert_eq!(endpoint.operation_count(), 1);
        drop(pending);
        assert_eq!(endpoint.operation_count(), 0);

        assert_ok!(
            endpoint
                .start_acquisition(0, RemoteCancellationToken::NotCancellable)
                .await
        );
    }

    #[tokio::test]
    async fn test_vendor_errors_become_device_faults() {
        let endpoint = connected(1);
        assert_ok!(endpoint.create_camera(0).await);

        let fault = assert_err!(endpoint.set_temperature(0, -200.0));
        assert_eq!(fault.kind(), FaultKind::Device);
        assert_eq!(fault.detail().method_name, "SetTemperature");
        assert!(fault.detail().vendor_code.is_some());

        let fault = assert_err!(endpoint.create_camera(9).await);
        assert_eq!(fault.kind(), FaultKind::Device);

        let fault = assert_err!(
            endpoint
                .finish_image_saving_sequence(0, RemoteCancellationToken::NotCancellable)
                .await
        );
        assert_eq!(fault.kind(), FaultKind::Device);
    }

    #[tokio::test]
    async fn test_removed_camera_then_recreated() {
        let endpoint = connected(1);
        assert_ok!(endpoint.create_camera(0).await);
        let old_settings = assert_ok!(endpoint.create_settings(0));
        assert_ok!(endpoint.remove_camera(0));

        let fault = assert_err!(endpoint.camera_model(0));
        assert_eq!(fault.kind(), FaultKind::Service);
        assert_eq!(fault.detail().message, "Camera not found");

        assert_ok!(endpoint.create_camera(0).await);
        assert_eq!(endpoint.settings_count(), 0);
        let fault = assert_err!(endpoint.settings_payload(&old_settings));
        assert_eq!(fault.reason(), ReasonCode::SettingsUnavailable);
        assert_eq!(assert_ok!(endpoint.camera_model(0)), "SIM-888");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_create_settings() {
        let endpoint = Arc::new(connected(1));
        assert_ok!(endpoint.create_camera(0).await);

        let a = {
            let endpoint = Arc::clone(&endpoint);
            tokio::spawn(async move { endpoint.create_settings(0) })
        };
        let b = {
            let endpoint = Arc::clone(&endpoint);
            tokio::spawn(async move { endpoint.create_settings(0) })
        };
        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();
        assert_ne!(a, b);

        assert_ok!(endpoint.remove_settings(&a));
        assert_ok!(endpoint.settings_payload(&b));
        assert_ok!(endpoint.remove_settings(&b));
        assert!(endpoint.remove_settings(&b).is_err());
    }

    #[tokio::test]
    async fn test_settings_of_camera_removed_mid_create_are_disposed() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let evictor: Evictor = Arc::new(OnceLock::new());
        let factory = ScriptedFactory {
            log: Arc::clone(&log),
            fail_dispose: true,
            evict_on_settings: Some(Arc::clone(&evictor)),
        };
        let endpoint = Arc::new(SessionEndpoint::new(Arc::new(factory), host()));
        assert!(evictor.set(Arc::downgrade(&endpoint)).is_ok());
        assert_ok!(endpoint.connect());
        assert_ok!(endpoint.create_camera(0).await);

        let fault = assert_err!(endpoint.create_settings(0));
        assert_eq!(fault.reason(), ReasonCode::CameraCommunication);
        assert_eq!(fault.detail().message, "Camera not found");
        assert_eq!(endpoint.settings_count(), 0);
        assert_eq!(endpoint.device_count(), 0);
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "device disposed, acquisition cancelled: false".to_string(),
                "settings disposed".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_event_without_clients_does_not_block() {
        let factory = Arc::new(KeepingFactory::default());
        let (tx, rx) = mpsc::unbounded_channel::<CallbackEvent>();
        drop(rx);
        let endpoint = SessionEndpoint::new(Arc::clone(&factory) as Arc<dyn DeviceFactory>, host())
            .with_sink(Arc::new(tx));
        assert_ok!(endpoint.connect());
        assert_ok!(endpoint.create_camera(0).await);

        let camera = Arc::clone(&factory.created.lock().unwrap()[0]);
        let started = Instant::now();
        for _ in 0..1_000 {
            camera.fire(DeviceEvent::AcquisitionStarted {
                status: AcquisitionStatus::default(),
            });
        }
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_events_are_forwarded_with_camera_key() {
        let (tx, mut rx) = mpsc::unbounded_channel::<CallbackEvent>();
        let factory = SimulatedFactory::new(2).with_config(fast_config(1));
        let endpoint = SessionEndpoint::new(Arc::new(factory), host()).with_sink(Arc::new(tx));
        let session_id = assert_ok!(endpoint.connect());
        assert_ok!(endpoint.create_camera(1).await);

        assert_ok!(endpoint.fan_control(1, FanMode::LowSpeed));
        let callback = rx.recv().await.unwrap();
        assert_eq!(callback.camera_key, format!("{session_id}:1"));
        assert_eq!(callback.camera_index, 1);
        assert_eq!(
            callback.event,
            DeviceEvent::PropertyChanged {
                property: "FanMode".into()
            }
        );
    }

    #[tokio::test]
    async fn test_settings_payload_flow() {
        let endpoint = connected(1);
        assert_ok!(endpoint.create_camera(0).await);
        let id = assert_ok!(endpoint.create_settings(0));

        let payload = assert_ok!(endpoint.settings_payload(&id));
        let mut settings: SimulatedSettings = serde_json::from_slice(&payload).unwrap();
        settings.kinetic_count = 0;
        assert_ok!(endpoint.load_settings_payload(&id, &serde_json::to_vec(&settings).unwrap()));
        assert_eq!(assert_err!(endpoint.apply_settings(&id)).kind(), FaultKind::Device);

        let fault = assert_err!(endpoint.load_settings_payload(&id, b"not json"));
        assert_eq!(fault.reason(), ReasonCode::GeneralServiceError);
    }

    #[tokio::test]
    async fn test_missing_resources() {
        let endpoint = connected(1);
        let fault = assert_err!(endpoint.remove_camera(4));
        assert_eq!(fault.reason(), ReasonCode::CameraCommunication);
        let fault = assert_err!(endpoint.create_settings(4));
        assert_eq!(fault.reason(), ReasonCode::CameraCommunication);
        let fault = assert_err!(endpoint.remove_settings("nope"));
        assert_eq!(fault.reason(), ReasonCode::SettingsUnavailable);
        let fault = assert_err!(
            endpoint
                .pull_all_images(4, RemoteCancellationToken::NotCancellable)
                .await
        );
        assert_eq!(fault.kind(), FaultKind::Service);
        assert_eq!(assert_ok!(endpoint.number_of_cameras()), 4);
    }
}
