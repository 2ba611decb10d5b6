//! Software camera.
//!
//! Behaves like a cooled CCD without hardware: acquisitions produce synthetic
//! frames on a timer, control calls raise `PropertyChanged`, and invalid
//! requests fail with vendor error codes.

use std::{
    any::Any,
    collections::VecDeque,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::{
    AcquisitionOps, CameraSettings, ControlOps, Device, DeviceError, DeviceEvent, DeviceFactory,
    EventSource,
    types::{
        AcquisitionStatus, CameraCapabilities, CameraProperties, FanMode, Image, ShutterMode,
        Switch, TemperatureReading, TemperatureStatus,
    },
};

/// Invalid parameter.
pub const ERR_INVALID_PARAMETER: u32 = 20_066;
/// Acquisition already running.
pub const ERR_ACQUIRING: u32 = 20_072;
/// No acquisition running.
pub const ERR_IDLE: u32 = 20_073;

const MIN_TEMPERATURE: f32 = -80.0;
const MAX_TEMPERATURE: f32 = 20.0;
const AMBIENT_TEMPERATURE: f32 = 20.0;

/// Simulated camera configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatedCameraConfig {
    /// Time between frames.
    pub frame_interval: Duration,
    pub width: u32,
    pub height: u32,
    /// Broadcast buffer for device events.
    pub event_capacity: usize,
}

impl Default for SimulatedCameraConfig {
    fn default() -> Self {
        Self {
            frame_interval: Duration::from_millis(20),
            width: 64,
            height: 64,
            event_capacity: 256,
        }
    }
}

/// Settings object for the simulated camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatedSettings {
    pub exposure_time_s: f32,
    /// Frames per acquisition.
    pub kinetic_count: u32,
    pub horizontal_binning: u32,
    pub vertical_binning: u32,
}

impl Default for SimulatedSettings {
    fn default() -> Self {
        Self {
            exposure_time_s: 0.1,
            kinetic_count: 3,
            horizontal_binning: 1,
            vertical_binning: 1,
        }
    }
}

impl CameraSettings for SimulatedSettings {
    fn to_bytes(&self) -> Result<Vec<u8>, DeviceError> {
        serde_json::to_vec(self).map_err(|e| DeviceError::InvalidPayload(e.to_string()))
    }

    fn load_bytes(&mut self, payload: &[u8]) -> Result<(), DeviceError> {
        *self =
            serde_json::from_slice(payload).map_err(|e| DeviceError::InvalidPayload(e.to_string()))?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct SavingSequence {
    folder: String,
    prefix: String,
    unsaved: u32,
}

struct State {
    fan: FanMode,
    cooler: Switch,
    target_temperature: f32,
    temperature: f32,
    shutter: (ShutterMode, Option<ShutterMode>),
    settings: SimulatedSettings,
    buffer: VecDeque<Image>,
    saving: Option<SavingSequence>,
    monitor: Option<CancellationToken>,
    abort: Option<CancellationToken>,
}

impl State {
    /// Advance the simulated sensor one step toward the target and read it.
    fn sample_temperature(&mut self) -> TemperatureReading {
        let goal = if self.cooler.is_enabled() {
            self.target_temperature
        } else {
            AMBIENT_TEMPERATURE
        };
        let delta = (goal - self.temperature).clamp(-5.0, 5.0);
        self.temperature += delta;

        let status = if !self.cooler.is_enabled() {
            TemperatureStatus::Off
        } else if (self.temperature - self.target_temperature).abs() < 0.5 {
            TemperatureStatus::Stabilized
        } else {
            TemperatureStatus::NotReached
        };
        TemperatureReading {
            temperature: self.temperature,
            status,
        }
    }
}

/// Camera implemented in software.
pub struct SimulatedCamera {
    index: i32,
    config: SimulatedCameraConfig,
    events: broadcast::Sender<DeviceEvent>,
    state: Arc<Mutex<State>>,
    acquiring: AtomicBool,
    disposed: AtomicBool,
}

impl SimulatedCamera {
    /// Create a camera at `index`.
    #[must_use]
    pub fn new(index: i32, config: SimulatedCameraConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            index,
            config,
            events,
            state: Arc::new(Mutex::new(State {
                fan: FanMode::FullSpeed,
                cooler: Switch::Disabled,
                target_temperature: AMBIENT_TEMPERATURE,
                temperature: AMBIENT_TEMPERATURE,
                shutter: (ShutterMode::PermanentlyClosed, None),
                settings: SimulatedSettings::default(),
                buffer: VecDeque::new(),
                saving: None,
                monitor: None,
                abort: None,
            })),
            acquiring: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }

    /// Raise an event as if the hardware had produced it.
    ///
    /// Never blocks and never fails, whether or not anyone listens.
    pub fn fire(&self, event: DeviceEvent) {
        let _ = self.events.send(event);
    }

    #[must_use]
    pub const fn index(&self) -> i32 {
        self.index
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_live(&self) -> Result<(), DeviceError> {
        if self.is_disposed() {
            Err(DeviceError::Disposed)
        } else {
            Ok(())
        }
    }

    fn property_changed(&self, property: &str) {
        self.fire(DeviceEvent::PropertyChanged {
            property: property.to_string(),
        });
    }

    fn synthetic_frame(&self, frame: u32) -> Image {
        let pixels = self.config.width as usize * self.config.height as usize;
        let value = u16::try_from(frame).unwrap_or(u16::MAX).to_le_bytes();
        let data: Vec<u8> = std::iter::repeat_n(value, pixels).flatten().collect();
        Image {
            width: self.config.width,
            height: self.config.height,
            data: Bytes::from(data),
        }
    }
}

struct AcquiringGuard<'a>(&'a AtomicBool);

impl Drop for AcquiringGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl ControlOps for SimulatedCamera {
    fn camera_model(&self) -> Result<String, DeviceError> {
        self.ensure_live()?;
        Ok("SIM-888".to_string())
    }

    fn serial_number(&self) -> Result<String, DeviceError> {
        self.ensure_live()?;
        Ok(format!("SIM{:05}", self.index))
    }

    fn capabilities(&self) -> Result<CameraCapabilities, DeviceError> {
        self.ensure_live()?;
        Ok(CameraCapabilities {
            can_set_temperature: true,
            can_control_fan: true,
            has_internal_shutter: true,
            has_external_shutter: false,
            min_temperature: MIN_TEMPERATURE,
            max_temperature: MAX_TEMPERATURE,
        })
    }

    fn properties(&self) -> Result<CameraProperties, DeviceError> {
        self.ensure_live()?;
        Ok(CameraProperties {
            detector_width: self.config.width,
            detector_height: self.config.height,
            pixel_size_um: 13.0,
            bit_depth: 16,
        })
    }

    fn is_active(&self) -> bool {
        !self.is_disposed()
    }

    fn is_initialized(&self) -> bool {
        !self.is_disposed()
    }

    fn is_acquiring(&self) -> bool {
        self.acquiring.load(Ordering::SeqCst)
    }

    fn current_temperature(&self) -> Result<TemperatureReading, DeviceError> {
        self.ensure_live()?;
        Ok(self.state().sample_temperature())
    }

    fn fan_control(&self, mode: FanMode) -> Result<(), DeviceError> {
        self.ensure_live()?;
        self.state().fan = mode;
        self.property_changed("FanMode");
        Ok(())
    }

    fn cooler_control(&self, mode: Switch) -> Result<(), DeviceError> {
        self.ensure_live()?;
        self.state().cooler = mode;
        self.property_changed("CoolerMode");
        Ok(())
    }

    fn set_temperature(&self, temperature: f32) -> Result<(), DeviceError> {
        self.ensure_live()?;
        if !(MIN_TEMPERATURE..=MAX_TEMPERATURE).contains(&temperature) {
            return Err(DeviceError::vendor(
                ERR_INVALID_PARAMETER,
                "SetTemperature",
                format!("{temperature} outside [{MIN_TEMPERATURE}, {MAX_TEMPERATURE}]"),
            ));
        }
        self.state().target_temperature = temperature;
        self.property_changed("TargetTemperature");
        Ok(())
    }

    fn shutter_control(
        &self,
        internal: ShutterMode,
        external: Option<ShutterMode>,
    ) -> Result<(), DeviceError> {
        self.ensure_live()?;
        if external.is_some() {
            return Err(DeviceError::vendor(
                ERR_INVALID_PARAMETER,
                "ShutterControl",
                "camera has no external shutter",
            ));
        }
        self.state().shutter = (internal, external);
        self.property_changed("Shutter");
        Ok(())
    }

    fn temperature_monitor(&self, mode: Switch, interval: Duration) -> Result<(), DeviceError> {
        self.ensure_live()?;
        let mut state = self.state();
        if let Some(previous) = state.monitor.take() {
            previous.cancel();
        }
        if !mode.is_enabled() {
            return Ok(());
        }
        if interval.is_zero() {
            return Err(DeviceError::vendor(
                ERR_INVALID_PARAMETER,
                "TemperatureMonitor",
                "interval must be positive",
            ));
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| DeviceError::Unsupported(format!("temperature monitor: {e}")))?;
        let stop = CancellationToken::new();
        state.monitor = Some(stop.clone());
        drop(state);

        let events = self.events.clone();
        let shared = Arc::clone(&self.state);
        runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    () = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let reading = shared
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .sample_temperature();
                        let _ = events.send(DeviceEvent::TemperatureStatusChecked { reading });
                    }
                }
            }
        });
        Ok(())
    }

    fn abort_acquisition(&self) -> Result<(), DeviceError> {
        self.ensure_live()?;
        match self.state().abort.take() {
            Some(abort) if self.is_acquiring() => {
                abort.cancel();
                Ok(())
            }
            _ => Err(DeviceError::vendor(
                ERR_IDLE,
                "AbortAcquisition",
                "no acquisition in progress",
            )),
        }
    }

    fn start_image_saving_sequence(&self, folder: &str, prefix: &str) -> Result<(), DeviceError> {
        self.ensure_live()?;
        if folder.is_empty() || prefix.is_empty() {
            return Err(DeviceError::vendor(
                ERR_INVALID_PARAMETER,
                "StartImageSavingSequence",
                "folder and prefix are required",
            ));
        }
        self.state().saving = Some(SavingSequence {
            folder: folder.to_string(),
            prefix: prefix.to_string(),
            unsaved: 0,
        });
        Ok(())
    }

    fn create_settings(&self) -> Result<Box<dyn CameraSettings>, DeviceError> {
        self.ensure_live()?;
        Ok(Box::new(self.state().settings.clone()))
    }

    fn apply_settings(&self, settings: &dyn CameraSettings) -> Result<(), DeviceError> {
        self.ensure_live()?;
        let settings = match settings.as_any().downcast_ref::<SimulatedSettings>() {
            Some(s) => s.clone(),
            None => {
                let mut decoded = SimulatedSettings::default();
                decoded.load_bytes(&settings.to_bytes()?)?;
                decoded
            }
        };
        if settings.kinetic_count == 0 {
            return Err(DeviceError::vendor(
                ERR_INVALID_PARAMETER,
                "ApplySettings",
                "kinetic count must be positive",
            ));
        }
        self.state().settings = settings;
        self.property_changed("Settings");
        Ok(())
    }

    fn dispose(&self) -> Result<(), DeviceError> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut state = self.state();
        if let Some(monitor) = state.monitor.take() {
            monitor.cancel();
        }
        if let Some(abort) = state.abort.take() {
            abort.cancel();
        }
        state.buffer.clear();
        tracing::debug!(camera_index = self.index, "simulated camera disposed");
        Ok(())
    }
}

#[async_trait]
impl AcquisitionOps for SimulatedCamera {
    async fn start_acquisition(&self, cancel: CancellationToken) -> Result<(), DeviceError> {
        self.ensure_live()?;
        if self.acquiring.swap(true, Ordering::SeqCst) {
            return Err(DeviceError::vendor(
                ERR_ACQUIRING,
                "StartAcquisition",
                "acquisition already in progress",
            ));
        }
        let _guard = AcquiringGuard(&self.acquiring);

        let run = cancel.child_token();
        let total = {
            let mut state = self.state();
            state.abort = Some(run.clone());
            state.settings.kinetic_count
        };

        let mut status = AcquisitionStatus {
            images_acquired: 0,
            images_total: total,
        };
        self.fire(DeviceEvent::AcquisitionStarted { status });

        for frame in 1..=total {
            tokio::select! {
                () = run.cancelled() => {
                    self.state().abort = None;
                    self.fire(DeviceEvent::AcquisitionAborted { status });
                    return Err(DeviceError::Cancelled);
                }
                () = tokio::time::sleep(self.config.frame_interval) => {}
            }

            let image = self.synthetic_frame(frame);
            {
                let mut state = self.state();
                state.buffer.push_back(image);
                if let Some(saving) = state.saving.as_mut() {
                    saving.unsaved += 1;
                }
            }
            status.images_acquired = frame;
            self.fire(DeviceEvent::NewImageReceived {
                index: frame,
                total,
            });
            self.fire(DeviceEvent::AcquisitionStatusChecked { status });
        }

        self.state().abort = None;
        self.fire(DeviceEvent::AcquisitionFinished {
            status,
            success: true,
        });
        Ok(())
    }

    async fn pull_all_images(&self, cancel: CancellationToken) -> Result<Vec<Image>, DeviceError> {
        self.ensure_live()?;
        if cancel.is_cancelled() {
            return Err(DeviceError::Cancelled);
        }
        tokio::task::yield_now().await;
        if cancel.is_cancelled() {
            return Err(DeviceError::Cancelled);
        }
        Ok(self.state().buffer.drain(..).collect())
    }

    async fn finish_image_saving_sequence(
        &self,
        cancel: CancellationToken,
    ) -> Result<u32, DeviceError> {
        self.ensure_live()?;
        let Some(sequence) = self.state().saving.take() else {
            return Err(DeviceError::vendor(
                ERR_INVALID_PARAMETER,
                "FinishImageSavingSequence",
                "no image saving sequence started",
            ));
        };

        for index in 1..=sequence.unsaved {
            tokio::select! {
                () = cancel.cancelled() => return Err(DeviceError::Cancelled),
                () = tokio::time::sleep(self.config.frame_interval) => {}
            }
            self.fire(DeviceEvent::ImageSaved {
                index,
                path: format!("{}/{}_{index}.fits", sequence.folder, sequence.prefix),
            });
        }
        Ok(sequence.unsaved)
    }
}

impl EventSource for SimulatedCamera {
    fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }
}

/// Factory producing `SimulatedCamera`s for indices `0..count`.
#[derive(Debug, Clone, Default)]
pub struct SimulatedFactory {
    count: u32,
    config: SimulatedCameraConfig,
}

impl SimulatedFactory {
    #[must_use]
    pub fn new(count: u32) -> Self {
        Self {
            count,
            config: SimulatedCameraConfig::default(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: SimulatedCameraConfig) -> Self {
        self.config = config;
        self
    }
}

#[async_trait]
impl DeviceFactory for SimulatedFactory {
    fn available(&self) -> Result<u32, DeviceError> {
        Ok(self.count)
    }

    async fn create(&self, index: i32) -> Result<Arc<dyn Device>, DeviceError> {
        let in_range = u32::try_from(index).is_ok_and(|i| i < self.count);
        if !in_range {
            return Err(DeviceError::vendor(
                ERR_INVALID_PARAMETER,
                "CreateCamera",
                format!("no camera at index {index}"),
            ));
        }
        Ok(Arc::new(SimulatedCamera::new(index, self.config.clone())))
    }
}

#[cfg(test)]
mod tests {
    use tokio_test::{assert_err, assert_ok};

    use super::*;

    fn fast_camera() -> SimulatedCamera {
        SimulatedCamera::new(
            0,
            SimulatedCameraConfig {
                frame_interval: Duration::from_millis(1),
                ..SimulatedCameraConfig::default()
            },
        )
    }

    #[test]
    fn test_fire_without_listeners() {
        let camera = fast_camera();
        camera.fire(DeviceEvent::AcquisitionStarted {
            status: AcquisitionStatus::default(),
        });
    }

    #[tokio::test]
    async fn test_acquisition_emits_events_in_order() {
        let camera = fast_camera();
        let mut rx = camera.subscribe();

        assert_ok!(camera.start_acquisition(CancellationToken::new()).await);

        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(event.name());
        }
        assert_eq!(names.first(), Some(&"acquisition_started"));
        assert_eq!(names.last(), Some(&"acquisition_finished"));
        assert_eq!(names.iter().filter(|n| **n == "new_image_received").count(), 3);

        let images = assert_ok!(camera.pull_all_images(CancellationToken::new()).await);
        assert_eq!(images.len(), 3);
        assert_eq!(images[0].data.len(), images[0].pixel_count() * 2);
    }

    #[tokio::test]
    async fn test_cancelled_acquisition() {
        let camera = fast_camera();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = camera.start_acquisition(cancel).await;
        assert!(matches!(result, Err(DeviceError::Cancelled)));
        assert!(!camera.is_acquiring());
    }

    #[test]
    fn test_set_temperature_out_of_range() {
        let camera = fast_camera();
        let err = assert_err!(camera.set_temperature(-120.0));
        assert!(matches!(
            err,
            DeviceError::Vendor {
                code: ERR_INVALID_PARAMETER,
                ..
            }
        ));
    }

    #[test]
    fn test_settings_payload_roundtrip_applies_kinetic_count() {
        let camera = fast_camera();
        let mut settings = assert_ok!(camera.create_settings());
        let payload = serde_json::to_vec(&SimulatedSettings {
            kinetic_count: 5,
            ..SimulatedSettings::default()
        })
        .unwrap();
        assert_ok!(settings.load_bytes(&payload));
        assert_ok!(camera.apply_settings(&*settings));
        assert_eq!(camera.state().settings.kinetic_count, 5);
    }

    #[test]
    fn test_disposed_camera_rejects_calls() {
        let camera = fast_camera();
        assert_ok!(camera.dispose());
        assert_ok!(camera.dispose());
        assert!(matches!(camera.camera_model(), Err(DeviceError::Disposed)));
        assert!(!camera.is_active());
    }

    #[tokio::test]
    async fn test_factory_rejects_unknown_index() {
        let factory = SimulatedFactory::new(1);
        assert!(factory.create(0).await.is_ok());
        assert!(matches!(
            factory.create(1).await,
            Err(DeviceError::Vendor { .. })
        ));
        assert!(factory.create(-1).await.is_err());
    }
}
