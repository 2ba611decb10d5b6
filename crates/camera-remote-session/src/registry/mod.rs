//! Per-session resource registries.
//!
//! Both registries are sharded concurrent maps: every insert, lookup and
//! removal is atomic per key, and no lock spans unrelated devices.

pub mod devices;
pub mod settings;

pub use devices::{DeviceEntry, DeviceRegistry};
pub use settings::{SettingsEntry, SettingsHandle, SettingsRegistry};
