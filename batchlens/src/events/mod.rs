//! Typed pipeline event bus.
//!
//! The orchestrator, budget ledger, circuit breakers, and resource guard
//! publish [`PipelineEvent`]s to a broadcast channel. The progress
//! reporter and any external notifier are ordinary subscribers; emission
//! never blocks dispatch, and a lagged subscriber drops events instead
//! of applying backpressure to the pipeline.

use crate::core::OutcomeStatus;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Memory pressure level reported by the resource guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PressureLevel {
    /// Above the warning threshold.
    Warning,
    /// Above the hard ceiling.
    Fatal,
}

/// Events published by the pipeline.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// An item was handed to a backend dispatch queue.
    ItemStarted {
        /// Work item id.
        id: String,
        /// Target backend.
        backend: String,
    },
    /// An item reached a terminal outcome.
    ItemFinished {
        /// Work item id.
        id: String,
        /// Outcome status.
        status: OutcomeStatus,
        /// Attempts consumed.
        attempts: u32,
        /// Actual cost in USD.
        cost_usd: f64,
    },
    /// Spend crossed the warning threshold for a budget scope.
    BudgetWarning {
        /// Scope name (daily, weekly, monthly, backend, request).
        scope: String,
        /// Spend committed plus reserved, in USD.
        spent_usd: f64,
        /// The scope's ceiling in USD.
        ceiling_usd: f64,
    },
    /// A budget scope's ceiling was reached; further dispatch is denied.
    BudgetExhausted {
        /// Scope name.
        scope: String,
    },
    /// A circuit breaker changed state.
    BreakerTransition {
        /// Backend the breaker guards.
        backend: String,
        /// Previous state name.
        from: String,
        /// New state name.
        to: String,
    },
    /// Process memory crossed a configured threshold.
    MemoryPressure {
        /// Resident set size in bytes.
        rss_bytes: u64,
        /// Which threshold was crossed.
        level: PressureLevel,
    },
    /// Graceful shutdown began.
    ShutdownStarted {
        /// Why shutdown was requested.
        reason: String,
        /// When it began.
        at: DateTime<Utc>,
    },
    /// Graceful shutdown finished running all hooks.
    ShutdownComplete,
}

/// Broadcast bus for pipeline events.
///
/// Cloning is cheap; every clone publishes to the same channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    /// Creates a bus with the given per-subscriber buffer capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publishes an event. Never blocks; an event with no subscribers is
    /// silently discarded.
    pub fn emit(&self, event: PipelineEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribes to the bus.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    /// Returns the number of active subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Spawns a subscriber task that mirrors events to `tracing`.
///
/// State transitions log at `warn`, per-item events at `debug`. The task
/// exits when the bus is dropped.
pub fn spawn_logging_subscriber(bus: &EventBus) -> tokio::task::JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => log_event(&event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "event log subscriber lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn log_event(event: &PipelineEvent) {
    match event {
        PipelineEvent::ItemStarted { id, backend } => {
            debug!(item = %id, backend = %backend, "item dispatched");
        }
        PipelineEvent::ItemFinished {
            id,
            status,
            attempts,
            cost_usd,
        } => {
            debug!(item = %id, status = ?status, attempts, cost_usd, "item finished");
        }
        PipelineEvent::BudgetWarning {
            scope,
            spent_usd,
            ceiling_usd,
        } => {
            warn!(scope = %scope, spent_usd, ceiling_usd, "budget warning threshold crossed");
        }
        PipelineEvent::BudgetExhausted { scope } => {
            warn!(scope = %scope, "budget exhausted, dispatch denied for scope");
        }
        PipelineEvent::BreakerTransition { backend, from, to } => {
            warn!(backend = %backend, from = %from, to = %to, "circuit breaker transition");
        }
        PipelineEvent::MemoryPressure { rss_bytes, level } => {
            warn!(rss_bytes, level = ?level, "memory pressure");
        }
        PipelineEvent::ShutdownStarted { reason, at } => {
            warn!(reason = %reason, at = %at, "shutdown started");
        }
        PipelineEvent::ShutdownComplete => {
            debug!("shutdown complete");
        }
    }
}
