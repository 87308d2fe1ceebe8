//! Scripted mock backends.

use crate::backend::Backend;
use crate::core::{Classification, WorkItem};
use crate::errors::ClassifyError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Builds a plausible classification payload for tests.
#[must_use]
pub fn sample_classification(cost_usd: f64) -> Classification {
    Classification {
        category: "landscape".to_string(),
        confidence: 0.95,
        cost_usd,
        latency_ms: 42,
        tokens: Some(128),
    }
}

/// Backend that replays a scripted sequence of responses, then falls
/// back to a fixed success (if configured) or a validation error.
pub struct ScriptedBackend {
    name: String,
    script: Mutex<VecDeque<Result<Classification, ClassifyError>>>,
    fallback: Option<Classification>,
    delay: Option<Duration>,
    calls: AtomicU32,
}

impl ScriptedBackend {
    /// Creates a backend that replays `script` in order.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        script: impl IntoIterator<Item = Result<Classification, ClassifyError>>,
    ) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(script.into_iter().collect()),
            fallback: None,
            delay: None,
            calls: AtomicU32::new(0),
        }
    }

    /// Creates a backend that always succeeds with a sample payload.
    #[must_use]
    pub fn always_succeeding(name: impl Into<String>) -> Self {
        Self::new(name, Vec::new()).with_fallback(sample_classification(0.001))
    }

    /// Sets the response used once the script is exhausted.
    #[must_use]
    pub fn with_fallback(mut self, classification: Classification) -> Self {
        self.fallback = Some(classification);
        self
    }

    /// Adds a fixed latency to every call.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Total calls made so far.
    #[must_use]
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn classify(&self, _item: &WorkItem) -> Result<Classification, ClassifyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(response) = self.script.lock().pop_front() {
            return response;
        }
        match &self.fallback {
            Some(classification) => Ok(classification.clone()),
            None => Err(ClassifyError::validation("script exhausted")),
        }
    }
}

/// Backend that fails a fixed number of times, then succeeds.
pub struct FlakyBackend {
    name: String,
    failures_remaining: AtomicU32,
    error: ClassifyError,
    success: Classification,
    calls: AtomicU32,
}

impl FlakyBackend {
    /// Creates a backend that returns `error` for the first `failures`
    /// calls and `sample_classification` afterwards.
    #[must_use]
    pub fn new(name: impl Into<String>, failures: u32, error: ClassifyError) -> Self {
        Self {
            name: name.into(),
            failures_remaining: AtomicU32::new(failures),
            error,
            success: sample_classification(0.001),
            calls: AtomicU32::new(0),
        }
    }

    /// Total calls made so far.
    #[must_use]
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backend for FlakyBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn classify(&self, _item: &WorkItem) -> Result<Classification, ClassifyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let should_fail = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(self.error.clone());
        }
        Ok(self.success.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_backend_replays_then_falls_back() {
        let backend = ScriptedBackend::new(
            "mock",
            vec![Err(ClassifyError::rate_limited("429"))],
        )
        .with_fallback(sample_classification(0.01));

        let item = WorkItem::new("a.jpg");
        assert!(backend.classify(&item).await.is_err());
        assert!(backend.classify(&item).await.is_ok());
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn test_flaky_backend_recovers() {
        let backend = FlakyBackend::new("mock", 2, ClassifyError::network("reset"));
        let item = WorkItem::new("a.jpg");

        assert!(backend.classify(&item).await.is_err());
        assert!(backend.classify(&item).await.is_err());
        assert!(backend.classify(&item).await.is_ok());
    }
}
