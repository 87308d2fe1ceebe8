//! Per-backend circuit breakers.
//!
//! A breaker isolates a systemically failing backend: after enough
//! consecutive failures it rejects calls outright for a cooldown period,
//! then admits probes and closes again after enough consecutive probe
//! successes. Breakers are strictly per backend; a tripped breaker for
//! one backend never affects another.

use crate::errors::{ClassifyError, PipelineError};
use crate::events::{EventBus, PipelineEvent};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tracing::warn;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow normally.
    #[default]
    Closed,
    /// Calls are rejected without invoking the backend.
    Open,
    /// Probe calls are admitted to test recovery.
    HalfOpen,
}

impl CircuitState {
    /// Returns the state name used in events and logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Breaker thresholds and cooldown.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    /// Consecutive failures before the breaker opens.
    pub failure_threshold: u32,
    /// Consecutive half-open successes before it closes.
    pub success_threshold: u32,
    /// Seconds to stay open before admitting probes.
    pub reset_timeout_secs: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout_secs: 30,
        }
    }
}

impl BreakerSettings {
    /// Creates settings with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the failure threshold.
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Sets the half-open success threshold.
    #[must_use]
    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold.max(1);
        self
    }

    /// Sets the cooldown before probing.
    #[must_use]
    pub fn with_reset_timeout_secs(mut self, secs: u64) -> Self {
        self.reset_timeout_secs = secs;
        self
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    last_failure: Option<DateTime<Utc>>,
    retry_at: Option<DateTime<Utc>>,
}

/// Circuit breaker guarding one backend.
pub struct CircuitBreaker {
    backend: String,
    settings: BreakerSettings,
    inner: Mutex<BreakerInner>,
    events: Option<EventBus>,
}

impl CircuitBreaker {
    /// Creates a closed breaker for a backend.
    #[must_use]
    pub fn new(backend: impl Into<String>, settings: BreakerSettings) -> Self {
        Self {
            backend: backend.into(),
            settings,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                last_failure: None,
                retry_at: None,
            }),
            events: None,
        }
    }

    /// Attaches an event bus for transition notifications.
    #[must_use]
    pub fn with_events(mut self, bus: EventBus) -> Self {
        self.events = Some(bus);
        self
    }

    /// Returns the current state, accounting for cooldown expiry.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.state_at(Utc::now())
    }

    /// [`Self::state`] with an explicit clock.
    #[must_use]
    pub fn state_at(&self, now: DateTime<Utc>) -> CircuitState {
        let mut inner = self.inner.lock();
        self.admit_probe_if_due(&mut inner, now);
        inner.state
    }

    /// Executes the operation through the breaker.
    ///
    /// # Errors
    ///
    /// [`PipelineError::BreakerOpen`] in the open state, without invoking
    /// the operation; otherwise the operation's own error, after state
    /// bookkeeping.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T, PipelineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ClassifyError>>,
    {
        self.admit(Utc::now())?;

        match op().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(PipelineError::backend(err, 1))
            }
        }
    }

    /// Admits or rejects a call at `now` without executing anything.
    ///
    /// # Errors
    ///
    /// [`PipelineError::BreakerOpen`] while the breaker is open.
    pub fn admit(&self, now: DateTime<Utc>) -> Result<(), PipelineError> {
        let mut inner = self.inner.lock();
        self.admit_probe_if_due(&mut inner, now);

        if inner.state == CircuitState::Open {
            let retry_after = inner.retry_at.unwrap_or(now);
            return Err(PipelineError::BreakerOpen {
                backend: self.backend.clone(),
                retry_after,
            });
        }
        Ok(())
    }

    /// Records a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.settings.success_threshold {
                    self.transition(&mut inner, CircuitState::Closed);
                    inner.consecutive_failures = 0;
                    inner.retry_at = None;
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Records a failed call. Retry attempts count individually.
    pub fn record_failure(&self) {
        self.record_failure_at(Utc::now());
    }

    /// [`Self::record_failure`] with an explicit clock.
    pub fn record_failure_at(&self, now: DateTime<Utc>) {
        let mut inner = self.inner.lock();
        inner.last_failure = Some(now);

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.settings.failure_threshold {
                    self.trip(&mut inner, now);
                }
            }
            // Any failure while probing reopens immediately.
            CircuitState::HalfOpen => self.trip(&mut inner, now),
            CircuitState::Open => {}
        }
    }

    fn trip(&self, inner: &mut BreakerInner, now: DateTime<Utc>) {
        inner.retry_at =
            Some(now + ChronoDuration::seconds(self.settings.reset_timeout_secs as i64));
        inner.half_open_successes = 0;
        self.transition(inner, CircuitState::Open);
    }

    fn admit_probe_if_due(&self, inner: &mut BreakerInner, now: DateTime<Utc>) {
        if inner.state == CircuitState::Open {
            if let Some(retry_at) = inner.retry_at {
                if now >= retry_at {
                    inner.half_open_successes = 0;
                    self.transition(inner, CircuitState::HalfOpen);
                }
            }
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        warn!(
            backend = %self.backend,
            from = from.as_str(),
            to = to.as_str(),
            "circuit breaker transition"
        );
        if let Some(ref bus) = self.events {
            bus.emit(PipelineEvent::BreakerTransition {
                backend: self.backend.clone(),
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("backend", &self.backend)
            .field("state", &self.inner.lock().state)
            .finish()
    }
}

/// One breaker per backend, created on first use.
pub struct BreakerSet {
    settings: BreakerSettings,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    events: Option<EventBus>,
}

impl BreakerSet {
    /// Creates an empty set with shared settings.
    #[must_use]
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            breakers: DashMap::new(),
            events: None,
        }
    }

    /// Attaches an event bus propagated to every breaker.
    #[must_use]
    pub fn with_events(mut self, bus: EventBus) -> Self {
        self.events = Some(bus);
        self
    }

    /// Returns the breaker for a backend, creating it if needed.
    #[must_use]
    pub fn for_backend(&self, backend: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(backend.to_string())
            .or_insert_with(|| {
                let breaker = CircuitBreaker::new(backend, self.settings.clone());
                let breaker = match &self.events {
                    Some(bus) => breaker.with_events(bus.clone()),
                    None => breaker,
                };
                Arc::new(breaker)
            })
            .clone()
    }
}

impl std::fmt::Debug for BreakerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreakerSet")
            .field("settings", &self.settings)
            .field("backends", &self.breakers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn settings() -> BreakerSettings {
        BreakerSettings::new()
            .with_failure_threshold(3)
            .with_success_threshold(2)
            .with_reset_timeout_secs(30)
    }

    #[test]
    fn test_opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new("mock", settings());
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_success_resets_consecutive_count() {
        let breaker = CircuitBreaker::new("mock", settings());
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_open_rejects_without_invoking() {
        let breaker = CircuitBreaker::new("mock", settings());
        for _ in 0..3 {
            breaker.record_failure();
        }

        let calls = AtomicU32::new(0);
        let result: Result<(), _> = breaker
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;

        assert!(matches!(result, Err(PipelineError::BreakerOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_half_open_after_cooldown_then_closes() {
        let t0 = Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap();
        let breaker = CircuitBreaker::new("mock", settings());
        for _ in 0..3 {
            breaker.record_failure_at(t0);
        }
        assert_eq!(breaker.state_at(t0), CircuitState::Open);

        let probing = t0 + ChronoDuration::seconds(31);
        assert_eq!(breaker.state_at(probing), CircuitState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.state_at(probing), CircuitState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state_at(probing), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let t0 = Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap();
        let breaker = CircuitBreaker::new("mock", settings());
        for _ in 0..3 {
            breaker.record_failure_at(t0);
        }

        let probing = t0 + ChronoDuration::seconds(31);
        assert_eq!(breaker.state_at(probing), CircuitState::HalfOpen);
        breaker.record_failure_at(probing);
        assert_eq!(breaker.state_at(probing), CircuitState::Open);

        // The new cooldown starts from the probe failure.
        let later = probing + ChronoDuration::seconds(31);
        assert_eq!(breaker.state_at(later), CircuitState::HalfOpen);
    }

    #[test]
    fn test_breakers_are_isolated_per_backend() {
        let set = BreakerSet::new(settings());
        let strict = set.for_backend("strict");
        for _ in 0..3 {
            strict.record_failure();
        }

        assert_eq!(strict.state(), CircuitState::Open);
        assert_eq!(set.for_backend("lenient").state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_execute_updates_state_from_outcome() {
        let breaker = CircuitBreaker::new("mock", settings().with_failure_threshold(1));

        let result: Result<(), _> = breaker
            .execute(|| async { Err(ClassifyError::network("reset")) })
            .await;
        assert!(result.is_err());
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_transition_emits_event() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let breaker =
            CircuitBreaker::new("mock", settings().with_failure_threshold(1)).with_events(bus);

        breaker.record_failure();

        let event = rx.try_recv().unwrap();
        assert!(matches!(
            event,
            PipelineEvent::BreakerTransition { ref to, .. } if to == "open"
        ));
    }
}
