//! Device registry: integer index → live device handle.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use camera_remote_core::Device;
use dashmap::{DashMap, mapref::entry::Entry};

use crate::ForwarderHandle;

/// A registered device.
pub struct DeviceEntry {
    pub device: Arc<dyn Device>,
    /// Distinguishes successive devices registered under the same index.
    pub generation: u64,
    pub forwarder: ForwarderHandle,
}

/// Concurrent device registry.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: DashMap<i32, DeviceEntry>,
    next_generation: AtomicU64,
}

impl DeviceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn contains(&self, index: i32) -> bool {
        self.devices.contains_key(&index)
    }

    /// Look up a device and its generation.
    #[must_use]
    pub fn get(&self, index: i32) -> Option<(Arc<dyn Device>, u64)> {
        self.devices
            .get(&index)
            .map(|e| (Arc::clone(&e.device), e.generation))
    }

    #[must_use]
    pub fn generation(&self, index: i32) -> Option<u64> {
        self.devices.get(&index).map(|e| e.generation)
    }

    /// Register a device unless the index is taken.
    ///
    /// # Errors
    /// Returns the device and forwarder back if `index` is already registered.
    pub fn try_insert(
        &self,
        index: i32,
        device: Arc<dyn Device>,
        forwarder: ForwarderHandle,
    ) -> Result<u64, (Arc<dyn Device>, ForwarderHandle)> {
        match self.devices.entry(index) {
            Entry::Occupied(_) => Err((device, forwarder)),
            Entry::Vacant(slot) => {
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                slot.insert(DeviceEntry {
                    device,
                    generation,
                    forwarder,
                });
                tracing::debug!(camera_index = index, generation, "device registered");
                Ok(generation)
            }
        }
    }

    /// Remove a device. Of two concurrent removals only one gets the entry.
    pub fn remove(&self, index: i32) -> Option<DeviceEntry> {
        self.devices.remove(&index).map(|(_, entry)| entry)
    }

    /// Remove a device only if it is still the given generation.
    pub fn remove_generation(&self, index: i32, generation: u64) -> Option<DeviceEntry> {
        self.devices
            .remove_if(&index, |_, e| e.generation == generation)
            .map(|(_, entry)| entry)
    }

    /// Live indices, sorted.
    #[must_use]
    pub fn indices(&self) -> Vec<i32> {
        let mut indices: Vec<i32> = self.devices.iter().map(|e| *e.key()).collect();
        indices.sort_unstable();
        indices
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use camera_remote_core::{DeviceFactory, EventSource, NullSink, simulated::SimulatedFactory};

    use super::*;
    use crate::EventForwarder;

    async fn device(index: i32) -> (Arc<dyn Device>, ForwarderHandle) {
        let device = SimulatedFactory::new(4).create(index).await.unwrap();
        let forwarder =
            EventForwarder::spawn(format!("s:{index}"), index, device.subscribe(), Arc::new(NullSink));
        (device, forwarder)
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let registry = DeviceRegistry::new();
        let (d1, f1) = device(0).await;
        let (d2, f2) = device(0).await;

        let Ok(generation) = registry.try_insert(0, Arc::clone(&d1), f1) else {
            panic!("first insert rejected");
        };
        assert!(registry.try_insert(0, d2, f2).is_err());
        assert_eq!(registry.len(), 1);

        let (found, found_generation) = registry.get(0).unwrap();
        assert!(Arc::ptr_eq(&found, &d1));
        assert_eq!(found_generation, generation);
    }

    #[tokio::test]
    async fn test_remove_is_exclusive() {
        let registry = DeviceRegistry::new();
        let (d, f) = device(1).await;
        assert!(registry.try_insert(1, d, f).is_ok());

        assert!(registry.remove(1).is_some());
        assert!(registry.remove(1).is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_remove_generation_ignores_newer_device() {
        let registry = DeviceRegistry::new();
        let (d, f) = device(2).await;
        let Ok(old) = registry.try_insert(2, d, f) else {
            panic!("insert rejected");
        };
        registry.remove(2);
        let (d, f) = device(2).await;
        let Ok(new) = registry.try_insert(2, d, f) else {
            panic!("insert rejected");
        };

        assert_ne!(old, new);
        assert!(registry.remove_generation(2, old).is_none());
        assert!(registry.remove_generation(2, new).is_some());
    }

    #[tokio::test]
    async fn test_indices_sorted() {
        let registry = DeviceRegistry::new();
        for index in [3, 0, 2] {
            let (d, f) = device(index).await;
            assert!(registry.try_insert(index, d, f).is_ok());
        }
        assert_eq!(registry.indices(), vec![0, 2, 3]);
    }
}
