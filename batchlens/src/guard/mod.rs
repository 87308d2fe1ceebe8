//! Resource guard: memory monitoring and graceful shutdown.
//!
//! The guard samples process memory on an interval, emits pressure
//! events past a warning threshold, and initiates graceful shutdown past
//! the hard ceiling or on a termination signal. Shutdown hooks run in
//! registration order, each bounded by a share of the shutdown timeout;
//! a second shutdown request while one is in progress is a no-op.

mod hooks;
mod sampler;

pub use hooks::ShutdownHooks;
pub use sampler::{MemorySampler, ProcMemorySampler};

use crate::cancellation::CancelToken;
use crate::events::{EventBus, PipelineEvent, PressureLevel};
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, warn};

/// Memory thresholds and sampling cadence.
#[derive(Debug, Clone)]
pub struct GuardSettings {
    /// Emit a pressure warning above this RSS.
    pub warn_bytes: Option<u64>,
    /// Initiate shutdown above this RSS.
    pub fatal_bytes: Option<u64>,
    /// How often to sample.
    pub sample_interval: Duration,
    /// Overall budget for running shutdown hooks.
    pub shutdown_timeout: Duration,
}

impl Default for GuardSettings {
    fn default() -> Self {
        Self {
            warn_bytes: None,
            fatal_bytes: None,
            sample_interval: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

type ReclaimHint = Box<dyn Fn() + Send + Sync>;

/// Monitors process memory and owns the graceful-shutdown sequence.
pub struct ResourceGuard {
    settings: GuardSettings,
    sampler: Box<dyn MemorySampler>,
    hooks: ShutdownHooks,
    token: Arc<CancelToken>,
    events: Option<EventBus>,
    reclaim_hint: Mutex<Option<ReclaimHint>>,
    shutdown_started: AtomicBool,
    above_warning: AtomicBool,
}

impl ResourceGuard {
    /// Creates a guard with the default `/proc` sampler.
    #[must_use]
    pub fn new(settings: GuardSettings, token: Arc<CancelToken>) -> Self {
        Self::with_sampler(settings, token, Box::new(ProcMemorySampler))
    }

    /// Creates a guard with an explicit sampler (used in tests).
    #[must_use]
    pub fn with_sampler(
        settings: GuardSettings,
        token: Arc<CancelToken>,
        sampler: Box<dyn MemorySampler>,
    ) -> Self {
        Self {
            settings,
            sampler,
            hooks: ShutdownHooks::new(),
            token,
            events: None,
            reclaim_hint: Mutex::new(None),
            shutdown_started: AtomicBool::new(false),
            above_warning: AtomicBool::new(false),
        }
    }

    /// Attaches an event bus.
    #[must_use]
    pub fn with_events(mut self, bus: EventBus) -> Self {
        self.events = Some(bus);
        self
    }

    /// The shutdown hook registry. Hooks run in registration order.
    #[must_use]
    pub fn hooks(&self) -> &ShutdownHooks {
        &self.hooks
    }

    /// Sets a callback invoked when memory first crosses the warning
    /// threshold (e.g. dropping caches).
    pub fn set_reclaim_hint<F>(&self, hint: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.reclaim_hint.lock() = Some(Box::new(hint));
    }

    /// Returns true once shutdown has been initiated.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_started.load(Ordering::SeqCst)
    }

    /// Starts the periodic memory monitor. The task exits when the
    /// cancel token fires.
    pub fn spawn_monitor(self: &Arc<Self>) -> JoinHandle<()> {
        let guard = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(guard.settings.sample_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => guard.sample_once().await,
                    () = guard.token.cancelled() => break,
                }
            }
        })
    }

    async fn sample_once(self: &Arc<Self>) {
        let Some(rss) = self.sampler.rss_bytes() else {
            return;
        };

        if let Some(fatal) = self.settings.fatal_bytes {
            if rss >= fatal {
                error!(rss_bytes = rss, ceiling = fatal, "memory above hard ceiling");
                self.emit(PipelineEvent::MemoryPressure {
                    rss_bytes: rss,
                    level: PressureLevel::Fatal,
                });
                self.shutdown(format!("memory ceiling breached ({rss} bytes)"))
                    .await;
                return;
            }
        }

        if let Some(threshold) = self.settings.warn_bytes {
            let above = rss >= threshold;
            let was_above = self.above_warning.swap(above, Ordering::SeqCst);
            if above && !was_above {
                warn!(rss_bytes = rss, threshold, "memory above warning threshold");
                self.emit(PipelineEvent::MemoryPressure {
                    rss_bytes: rss,
                    level: PressureLevel::Warning,
                });
                if let Some(ref hint) = *self.reclaim_hint.lock() {
                    hint();
                }
            }
        }
    }

    /// Runs the graceful shutdown sequence: cancel the batch, then run
    /// every registered hook in order. Idempotent; concurrent and
    /// repeated calls return immediately.
    pub async fn shutdown(self: &Arc<Self>, reason: impl Into<String>) {
        if self.shutdown_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let reason = reason.into();

        self.emit(PipelineEvent::ShutdownStarted {
            reason: reason.clone(),
            at: Utc::now(),
        });
        self.token.cancel(reason);

        let (completed, failed) = self.hooks.run_all(self.settings.shutdown_timeout).await;
        if !failed.is_empty() {
            warn!(?completed, ?failed, "some shutdown hooks did not finish");
        }

        self.emit(PipelineEvent::ShutdownComplete);
    }

    fn emit(&self, event: PipelineEvent) {
        if let Some(ref bus) = self.events {
            bus.emit(event);
        }
    }
}

impl std::fmt::Debug for ResourceGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceGuard")
            .field("settings", &self.settings)
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    struct FixedSampler(AtomicU64);

    impl MemorySampler for FixedSampler {
        fn rss_bytes(&self) -> Option<u64> {
            Some(self.0.load(Ordering::SeqCst))
        }
    }

    fn fast_settings() -> GuardSettings {
        GuardSettings {
            warn_bytes: Some(100),
            fatal_bytes: Some(200),
            sample_interval: Duration::from_millis(5),
            shutdown_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn test_warning_fires_once_per_crossing() {
        let token = CancelToken::new();
        let bus = EventBus::new(32);
        let mut rx = bus.subscribe();

        let guard = Arc::new(
            ResourceGuard::with_sampler(
                fast_settings(),
                Arc::clone(&token),
                Box::new(FixedSampler(AtomicU64::new(150))),
            )
            .with_events(bus),
        );

        let monitor = guard.spawn_monitor();
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel("test over");
        let _ = monitor.await;

        let mut warnings = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(
                event,
                PipelineEvent::MemoryPressure {
                    level: PressureLevel::Warning,
                    ..
                }
            ) {
                warnings += 1;
            }
        }
        assert_eq!(warnings, 1);
    }

    #[tokio::test]
    async fn test_reclaim_hint_invoked_on_warning() {
        let token = CancelToken::new();
        let guard = Arc::new(ResourceGuard::with_sampler(
            fast_settings(),
            Arc::clone(&token),
            Box::new(FixedSampler(AtomicU64::new(150))),
        ));

        let hinted = Arc::new(AtomicBool::new(false));
        let hinted_clone = Arc::clone(&hinted);
        guard.set_reclaim_hint(move || {
            hinted_clone.store(true, Ordering::SeqCst);
        });

        let monitor = guard.spawn_monitor();
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel("test over");
        let _ = monitor.await;

        assert!(hinted.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_fatal_ceiling_initiates_shutdown() {
        let token = CancelToken::new();
        let guard = Arc::new(ResourceGuard::with_sampler(
            fast_settings(),
            Arc::clone(&token),
            Box::new(FixedSampler(AtomicU64::new(500))),
        ));

        let monitor = guard.spawn_monitor();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = monitor.await;

        assert!(guard.is_shutting_down());
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let token = CancelToken::new();
        let guard = Arc::new(ResourceGuard::with_sampler(
            GuardSettings::default(),
            token,
            Box::new(FixedSampler(AtomicU64::new(0))),
        ));

        let runs = Arc::new(AtomicU64::new(0));
        let runs_clone = Arc::clone(&runs);
        guard.hooks().register("count", move || {
            let runs = Arc::clone(&runs_clone);
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
            }
        });

        guard.shutdown("first").await;
        guard.shutdown("second").await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
