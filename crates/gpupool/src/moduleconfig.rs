//! Process-wide snapshot store for the `gpu` module configuration.
//!
//! The controller watch feeds new settings in; reconcilers and webhooks
//! read immutable snapshots out. The lock is never held across I/O.

use std::sync::{Arc, RwLock};

use kube::ResourceExt;

use crate::api::{ModuleConfig, ModuleSettings};

/// Name of the ModuleConfig object this process consumes.
pub const MODULE_NAME: &str = "gpu";

#[derive(Clone, Default)]
pub struct SettingsStore {
    inner: Arc<RwLock<ModuleSettings>>,
}

impl SettingsStore {
    pub fn new(initial: ModuleSettings) -> Self {
        SettingsStore {
            inner: Arc::new(RwLock::new(initial)),
        }
    }

    /// Immutable snapshot of the current settings.
    pub fn current(&self) -> ModuleSettings {
        self.inner.read().expect("settings lock poisoned").clone()
    }

    /// Replaces the snapshot. Returns true when the settings changed, so the
    /// caller knows to re-enqueue every pool.
    pub fn replace(&self, settings: ModuleSettings) -> bool {
        let mut guard = self.inner.write().expect("settings lock poisoned");
        if *guard == settings {
            return false;
        }
        *guard = settings;
        true
    }

    /// Applies a watched ModuleConfig event. Objects other than the `gpu`
    /// module are ignored.
    pub fn observe(&self, config: &ModuleConfig) -> bool {
        if config.name() != MODULE_NAME {
            return false;
        }
        self.replace(config.spec.settings.clone())
    }

    /// Clears the snapshot when the module config is deleted.
    pub fn observe_deleted(&self, config: &ModuleConfig) -> bool {
        if config.name() != MODULE_NAME {
            return false;
        }
        self.replace(ModuleSettings::default())
    }
}
