//! Classification backends.
//!
//! A backend is an external classification service behind the opaque
//! [`Backend::classify`] contract. The pipeline is parameterized over
//! this trait and never branches on backend identity except to look up
//! per-backend settings.

mod registry;

#[cfg(feature = "http-backend")]
mod http;

pub use registry::BackendRegistry;

#[cfg(feature = "http-backend")]
pub use http::{HttpBackend, HttpBackendConfig};

use crate::core::{Classification, WorkItem};
use crate::errors::ClassifyError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Contract every classification backend implements.
#[async_trait]
pub trait Backend: Send + Sync {
    /// The registry key for this backend.
    fn name(&self) -> &str;

    /// Classifies one work item.
    ///
    /// Errors must carry an [`crate::errors::ErrorClass`] so the retry
    /// executor and circuit breaker can tell transient from terminal.
    async fn classify(&self, item: &WorkItem) -> Result<Classification, ClassifyError>;
}

/// Per-backend execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    /// Maximum concurrently in-flight calls.
    pub concurrency: usize,
    /// Estimated cost per call, used for budget reservation.
    pub cost_per_item_usd: f64,
    /// Per-call timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            cost_per_item_usd: 0.005,
            request_timeout_secs: 60,
        }
    }
}

impl BackendSettings {
    /// Creates settings with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the concurrency limit.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Sets the estimated per-call cost.
    #[must_use]
    pub fn with_cost_per_item(mut self, cost_usd: f64) -> Self {
        self.cost_per_item_usd = cost_usd;
        self
    }

    /// Sets the per-call timeout.
    #[must_use]
    pub fn with_request_timeout(mut self, secs: u64) -> Self {
        self.request_timeout_secs = secs;
        self
    }

    /// Returns the per-call timeout as a duration.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_defaults() {
        let settings = BackendSettings::default();
        assert_eq!(settings.concurrency, 4);
        assert_eq!(settings.request_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_concurrency_floor_is_one() {
        let settings = BackendSettings::new().with_concurrency(0);
        assert_eq!(settings.concurrency, 1);
    }

    #[test]
    fn test_settings_deserialize_partial() {
        let settings: BackendSettings = serde_json::from_str(r#"{"concurrency": 2}"#).unwrap();
        assert_eq!(settings.concurrency, 2);
        assert!((settings.cost_per_item_usd - 0.005).abs() < f64::EPSILON);
    }
}
