//! Live progress statistics derived from pipeline events.
//!
//! The reporter is a plain subscriber of the event bus and has no effect
//! on control flow. The rate is smoothed over the whole run (completed
//! divided by total elapsed) so the ETA does not whiplash on every
//! fast or slow item.

use crate::core::OutcomeStatus;
use crate::events::{EventBus, PipelineEvent};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::info;

/// Point-in-time view of batch progress.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    /// Items in the batch, including previously recorded ones.
    pub total: u64,
    /// Items with a recorded outcome.
    pub completed: u64,
    /// Successful items.
    pub succeeded: u64,
    /// Failed items.
    pub failed: u64,
    /// Skipped items.
    pub skipped: u64,
    /// Smoothed completion rate for this run.
    pub items_per_second: f64,
    /// Estimated seconds to completion; `None` until an item completes.
    pub eta_seconds: Option<f64>,
    /// Time since the reporter started.
    pub elapsed: Duration,
}

#[derive(Debug)]
struct State {
    total: u64,
    seeded: u64,
    succeeded: u64,
    failed: u64,
    skipped: u64,
    started: Instant,
}

impl State {
    fn run_completed(&self) -> u64 {
        self.succeeded + self.failed + self.skipped
    }

    fn snapshot(&self) -> ProgressSnapshot {
        let elapsed = self.started.elapsed();
        let completed = self.seeded + self.run_completed();

        let items_per_second = if elapsed.as_secs_f64() > 0.0 {
            self.run_completed() as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        let remaining = self.total.saturating_sub(completed);
        let eta_seconds = if items_per_second > 0.0 {
            Some(remaining as f64 / items_per_second)
        } else {
            None
        };

        ProgressSnapshot {
            total: self.total,
            completed,
            succeeded: self.succeeded,
            failed: self.failed,
            skipped: self.skipped,
            items_per_second,
            eta_seconds,
            elapsed,
        }
    }
}

/// Aggregates item completion events into live statistics.
pub struct ProgressReporter {
    state: Arc<RwLock<State>>,
    listener: JoinHandle<()>,
}

impl ProgressReporter {
    /// Subscribes to the bus and starts counting.
    ///
    /// `already_completed` seeds the completed count on resume; seeded
    /// items do not contribute to the rate.
    #[must_use]
    pub fn spawn(bus: &EventBus, total: u64, already_completed: u64) -> Self {
        let state = Arc::new(RwLock::new(State {
            total,
            seeded: already_completed,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            started: Instant::now(),
        }));

        let mut rx = bus.subscribe();
        let listener_state = Arc::clone(&state);
        let listener = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(PipelineEvent::ItemFinished { status, .. }) => {
                        let mut state = listener_state.write();
                        match status {
                            OutcomeStatus::Success => state.succeeded += 1,
                            OutcomeStatus::Failed => state.failed += 1,
                            OutcomeStatus::Skipped => state.skipped += 1,
                        }
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
            }
        });

        Self { state, listener }
    }

    /// Returns the current statistics.
    #[must_use]
    pub fn snapshot(&self) -> ProgressSnapshot {
        self.state.read().snapshot()
    }

    /// Logs a one-line progress summary.
    pub fn log_progress(&self) {
        let s = self.snapshot();
        info!(
            completed = s.completed,
            total = s.total,
            succeeded = s.succeeded,
            failed = s.failed,
            skipped = s.skipped,
            items_per_second = format!("{:.2}", s.items_per_second),
            eta_seconds = s.eta_seconds.map(|e| e.round()),
            "progress"
        );
    }

    /// Stops listening. Statistics remain readable.
    pub fn stop(&self) {
        self.listener.abort();
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn finished(status: OutcomeStatus) -> PipelineEvent {
        PipelineEvent::ItemFinished {
            id: "x".to_string(),
            status,
            attempts: 1,
            cost_usd: 0.0,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    #[tokio::test]
    async fn test_zero_completed_has_no_eta() {
        let bus = EventBus::new(8);
        let reporter = ProgressReporter::spawn(&bus, 10, 0);

        let snapshot = reporter.snapshot();
        assert_eq!(snapshot.completed, 0);
        assert!(snapshot.eta_seconds.is_none());
        assert_eq!(snapshot.items_per_second, 0.0);
    }

    #[tokio::test]
    async fn test_counts_follow_events() {
        let bus = EventBus::new(8);
        let reporter = ProgressReporter::spawn(&bus, 5, 0);

        bus.emit(finished(OutcomeStatus::Success));
        bus.emit(finished(OutcomeStatus::Success));
        bus.emit(finished(OutcomeStatus::Failed));
        bus.emit(finished(OutcomeStatus::Skipped));
        settle().await;

        let snapshot = reporter.snapshot();
        assert_eq!(snapshot.completed, 4);
        assert_eq!(snapshot.succeeded, 2);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.skipped, 1);
        assert!(snapshot.items_per_second > 0.0);
        assert!(snapshot.eta_seconds.is_some());
    }

    #[tokio::test]
    async fn test_seeded_items_count_as_completed_but_not_rate() {
        let bus = EventBus::new(8);
        let reporter = ProgressReporter::spawn(&bus, 10, 4);

        let snapshot = reporter.snapshot();
        assert_eq!(snapshot.completed, 4);
        // Seeds alone produce no rate, hence no ETA.
        assert!(snapshot.eta_seconds.is_none());

        bus.emit(finished(OutcomeStatus::Success));
        settle().await;
        let snapshot = reporter.snapshot();
        assert_eq!(snapshot.completed, 5);
        assert!(snapshot.eta_seconds.is_some());
    }

    #[tokio::test]
    async fn test_other_events_ignored() {
        let bus = EventBus::new(8);
        let reporter = ProgressReporter::spawn(&bus, 2, 0);

        bus.emit(PipelineEvent::BudgetExhausted {
            scope: "daily".to_string(),
        });
        bus.emit(PipelineEvent::ShutdownComplete);
        settle().await;

        assert_eq!(reporter.snapshot().completed, 0);
    }
}
