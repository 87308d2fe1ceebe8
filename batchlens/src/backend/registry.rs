//! Registry of classification backends keyed by name.

use super::{Backend, BackendSettings};
use crate::errors::PipelineError;
use dashmap::DashMap;
use std::sync::Arc;

/// Holds the available backends and their settings.
#[derive(Default)]
pub struct BackendRegistry {
    backends: DashMap<String, Arc<dyn Backend>>,
    settings: DashMap<String, BackendSettings>,
}

impl BackendRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a backend with default settings.
    pub fn register(&self, backend: Arc<dyn Backend>) {
        self.register_with_settings(backend, BackendSettings::default());
    }

    /// Registers a backend with explicit settings. Re-registering a name
    /// replaces the previous entry.
    pub fn register_with_settings(&self, backend: Arc<dyn Backend>, settings: BackendSettings) {
        let name = backend.name().to_string();
        self.settings.insert(name.clone(), settings);
        self.backends.insert(name, backend);
    }

    /// Looks up a backend by name.
    ///
    /// # Errors
    ///
    /// Returns a config error if the name is not registered.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Backend>, PipelineError> {
        self.backends
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| PipelineError::config(format!("no backend registered as '{name}'")))
    }

    /// Returns the settings for a backend, or defaults if none were set.
    #[must_use]
    pub fn settings(&self, name: &str) -> BackendSettings {
        self.settings
            .get(name)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    /// Overrides the concurrency limit for a backend.
    pub fn set_concurrency(&self, name: &str, concurrency: usize) {
        let mut settings = self.settings(name);
        settings.concurrency = concurrency.max(1);
        self.settings.insert(name.to_string(), settings);
    }

    /// Returns the registered backend names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .backends
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Returns true if no backends are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.names())
            .finish()
    }
}
