//! Settings registry: opaque id → settings object bound to one device.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use camera_remote_core::{CameraSettings, DeviceError};
use dashmap::DashMap;
use uuid::Uuid;

/// A registered settings object.
pub struct SettingsEntry {
    pub device_index: i32,
    /// Generation of the owning device at creation time.
    pub device_generation: u64,
    settings: Arc<Mutex<Box<dyn CameraSettings>>>,
}

impl SettingsEntry {
    #[must_use]
    pub fn new(device_index: i32, device_generation: u64, settings: Box<dyn CameraSettings>) -> Self {
        Self {
            device_index,
            device_generation,
            settings: Arc::new(Mutex::new(settings)),
        }
    }

    /// Shared handle to the settings object.
    #[must_use]
    pub fn handle(&self) -> SettingsHandle {
        SettingsHandle(Arc::clone(&self.settings))
    }

    /// Dispose the settings object.
    ///
    /// # Errors
    /// Returns error if the settings object refuses disposal.
    pub fn dispose(self) -> Result<(), DeviceError> {
        let handle = self.handle();
        let mut settings = handle.lock();
        settings.dispose()
    }
}

/// Lockable reference to a settings object that outlives registry guards.
#[derive(Clone)]
pub struct SettingsHandle(Arc<Mutex<Box<dyn CameraSettings>>>);

impl SettingsHandle {
    #[must_use]
    pub fn lock(&self) -> MutexGuard<'_, Box<dyn CameraSettings>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Concurrent settings registry.
#[derive(Default)]
pub struct SettingsRegistry {
    settings: DashMap<String, SettingsEntry>,
}

impl SettingsRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register settings under a fresh id.
    pub fn insert(&self, entry: SettingsEntry) -> String {
        let id = Uuid::new_v4().to_string();
        tracing::debug!(settings_id = %id, camera_index = entry.device_index, "settings registered");
        self.settings.insert(id.clone(), entry);
        id
    }

    /// Look up the owning device index and a handle.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<(i32, SettingsHandle)> {
        self.settings
            .get(id)
            .map(|e| (e.device_index, e.handle()))
    }

    /// Remove settings. Of two concurrent removals only one gets the entry.
    pub fn remove(&self, id: &str) -> Option<SettingsEntry> {
        self.settings.remove(id).map(|(_, entry)| entry)
    }

    /// Remove every settings entry owned by one device generation.
    pub fn remove_for_device(&self, index: i32, generation: u64) -> Vec<(String, SettingsEntry)> {
        let ids: Vec<String> = self
            .settings
            .iter()
            .filter(|e| e.device_index == index && e.device_generation == generation)
            .map(|e| e.key().clone())
            .collect();
        ids.into_iter()
            .filter_map(|id| self.settings.remove(&id))
            .collect()
    }

    /// Remove everything.
    pub fn drain(&self) -> Vec<(String, SettingsEntry)> {
        let ids: Vec<String> = self.settings.iter().map(|e| e.key().clone()).collect();
        ids.into_iter()
            .filter_map(|id| self.settings.remove(&id))
            .collect()
    }

    #[must_use]
    pub fn ids_for_device(&self, index: i32) -> Vec<String> {
        self.settings
            .iter()
            .filter(|e| e.device_index == index)
            .map(|e| e.key().clone())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.settings.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.settings.is_empty()
    }
}
