//! Batch run configuration, loadable from a JSON file.

use crate::backend::BackendSettings;
use crate::breaker::BreakerSettings;
use crate::budget::BudgetLimits;
use crate::errors::{PipelineError, Result};
use crate::guard::GuardSettings;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Everything a batch run needs beyond the work items themselves.
///
/// Every field has a sensible default, so an empty `{}` file (or no file
/// at all) yields a working configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Per-backend overrides, keyed by registry name. Backends absent
    /// from the map run with [`BackendSettings::default`].
    pub backends: HashMap<String, BackendSettings>,
    /// Retry schedule shared by all backends.
    pub retry: RetryPolicy,
    /// Circuit breaker thresholds shared by all backends.
    pub breaker: BreakerSettings,
    /// Spend ceilings.
    pub budget: BudgetLimits,
    /// Seconds between periodic progress log lines.
    pub progress_interval_secs: u64,
    /// Total budget for shutdown hooks.
    pub shutdown_timeout_secs: u64,
    /// Memory sampling cadence for the resource guard.
    pub memory_sample_interval_secs: u64,
    /// RSS above which a pressure warning fires, in megabytes.
    pub memory_warn_mb: Option<u64>,
    /// RSS above which graceful shutdown starts, in megabytes.
    pub memory_fatal_mb: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            backends: HashMap::new(),
            retry: RetryPolicy::default(),
            breaker: BreakerSettings::default(),
            budget: BudgetLimits::new(),
            progress_interval_secs: 10,
            shutdown_timeout_secs: 30,
            memory_sample_interval_secs: 5,
            memory_warn_mb: None,
            memory_fatal_mb: None,
        }
    }
}

impl PipelineConfig {
    /// Creates a configuration with all defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Io`] if the file cannot be read and
    /// [`PipelineError::Serialization`] if it is not valid JSON.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints a plain deserialize cannot.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.budget.warning_threshold) {
            return Err(PipelineError::config(format!(
                "budget.warning_threshold must be within [0, 1], got {}",
                self.budget.warning_threshold
            )));
        }
        if self.retry.multiplier < 1.0 {
            return Err(PipelineError::config(format!(
                "retry.multiplier must be at least 1, got {}",
                self.retry.multiplier
            )));
        }
        for (name, settings) in &self.backends {
            if settings.cost_per_item_usd < 0.0 {
                return Err(PipelineError::config(format!(
                    "backends.{name}.cost_per_item_usd must not be negative"
                )));
            }
        }
        Ok(())
    }

    /// Settings for `backend`, falling back to defaults when the config
    /// carries no entry for it.
    #[must_use]
    pub fn backend_settings(&self, backend: &str) -> BackendSettings {
        self.backends.get(backend).cloned().unwrap_or_default()
    }

    /// Guard settings derived from the memory fields.
    #[must_use]
    pub fn guard_settings(&self) -> GuardSettings {
        GuardSettings {
            warn_bytes: self.memory_warn_mb.map(|mb| mb * 1024 * 1024),
            fatal_bytes: self.memory_fatal_mb.map(|mb| mb * 1024 * 1024),
            sample_interval: Duration::from_secs(self.memory_sample_interval_secs),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
        }
    }

    /// Interval between periodic progress log lines.
    #[must_use]
    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.progress_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_empty_json_yields_defaults() {
        let config: PipelineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.progress_interval_secs, 10);
        assert_eq!(config.backend_settings("anything").concurrency, 4);
        assert!(config.budget.daily_usd.is_none());
    }

    #[test]
    fn test_partial_backend_override() {
        let config: PipelineConfig = serde_json::from_str(
            r#"{"backends": {"mock": {"concurrency": 8}}, "budget": {"daily_usd": 5.0}}"#,
        )
        .unwrap();
        assert_eq!(config.backend_settings("mock").concurrency, 8);
        assert_eq!(config.backend_settings("other").concurrency, 4);
        assert_eq!(config.budget.daily_usd, Some(5.0));
    }

    #[test]
    fn test_validate_rejects_bad_multiplier() {
        let mut config = PipelineConfig::new();
        config.retry.multiplier = 0.5;
        assert!(matches!(
            config.validate(),
            Err(PipelineError::Config(_))
        ));
    }

    #[test]
    fn test_validate_rejects_negative_cost() {
        let mut config = PipelineConfig::new();
        config.backends.insert(
            "mock".to_string(),
            BackendSettings::new().with_cost_per_item(-1.0),
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let result = PipelineConfig::load("/nonexistent/config.json");
        assert!(matches!(result, Err(PipelineError::Io(_))));
    }

    #[test]
    fn test_guard_settings_conversion() {
        let mut config = PipelineConfig::new();
        config.memory_warn_mb = Some(512);
        let guard = config.guard_settings();
        assert_eq!(guard.warn_bytes, Some(512 * 1024 * 1024));
        assert_eq!(guard.fatal_bytes, None);
    }
}
