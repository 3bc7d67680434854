//! Device/session layer: a uniform contract for hardware (spec.md
//! §4.3–4.6, §9 design notes).
//!
//! A deep virtual hierarchy (base device -> camera/WFS/WFC -> vendor
//! subclasses) is collapsed here to a narrow [`Device`] trait plus
//! per-kind structs that compose a vendor driver object rather than
//! inheriting from one, per spec.md §9.

pub mod camera;
pub mod telescope;
pub mod wfc;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::error::{AoError, AoResult};

/// Per-device online/offline and error-count bookkeeping (SPEC_FULL.md
/// supplement #2).
#[derive(Debug, Clone, Default)]
pub struct DeviceStatus {
    pub online: bool,
    pub error_count: u64,
    pub last_error: Option<String>,
}

impl DeviceStatus {
    pub fn record_error(&mut self, msg: impl Into<String>) {
        self.error_count += 1;
        self.last_error = Some(msg.into());
    }
}

/// Narrow capability every networked device exposes: discoverable
/// commands and a textual status line, per spec.md §4.8 "Commands
/// common to all devices".
pub trait Device: Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> &'static str;
    /// Semicolon-separated command descriptors for `get commands`.
    fn commands(&self) -> Vec<String>;
    fn status(&self) -> DeviceStatus;
}

/// Process-wide name -> device registry backing `get devices` and
/// reverse lookup (spec.md §4.8). Devices are looked up by stable
/// string name rather than held via long-lived back-pointers, per the
/// spec.md §9 design note on cyclic references.
#[derive(Default)]
pub struct Registry {
    devices: RwLock<HashMap<String, Arc<dyn Device>>>,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, device: Arc<dyn Device>) -> AoResult<()> {
        let name = device.name().to_string();
        let mut map = self.devices.write().unwrap();
        if map.contains_key(&name) {
            return Err(AoError::DuplicateDevice(name));
        }
        map.insert(name, device);
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Option<Arc<dyn Device>> {
        self.devices.write().unwrap().remove(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Device>> {
        self.devices.read().unwrap().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.devices.read().unwrap().keys().cloned().collect()
    }
}

pub type SharedRegistry = Arc<Registry>;

/// Coarse command mutex every mutable device owns (spec.md §5 "Shared-
/// resource discipline"): all command handlers and state mutators
/// acquire it, serialising configuration changes against actuation on
/// the same device.
pub type CommandLock = Mutex<()>;

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy(String);
    impl Device for Dummy {
        fn name(&self) -> &str {
            &self.0
        }
        fn kind(&self) -> &'static str {
            "dummy"
        }
        fn commands(&self) -> Vec<String> {
            vec!["get status".into()]
        }
        fn status(&self) -> DeviceStatus {
            DeviceStatus::default()
        }
    }

    #[test]
    fn duplicate_insert_fails() {
        let reg = Registry::new();
        reg.insert(Arc::new(Dummy("cam0".into()))).unwrap();
        assert!(reg.insert(Arc::new(Dummy("cam0".into()))).is_err());
    }

    #[test]
    fn remove_then_reinsert_succeeds() {
        let reg = Registry::new();
        reg.insert(Arc::new(Dummy("cam0".into()))).unwrap();
        reg.remove("cam0");
        assert!(reg.insert(Arc::new(Dummy("cam0".into()))).is_ok());
    }
}
