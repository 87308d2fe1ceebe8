//! Batch session counters and the checkpoint record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Outcome, OutcomeStatus};

/// Aggregate counters for one batch run.
///
/// Owned exclusively by the result ledger's writer task once the batch
/// starts; serialized as the checkpoint file after every outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Stable session identifier.
    pub session_id: Uuid,
    /// When the batch started.
    pub start_time: DateTime<Utc>,
    /// When the batch finished or shut down, if it has.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Items in the batch, including previously recorded ones on resume.
    pub total_items: u64,
    /// Items with a recorded outcome.
    pub completed_items: u64,
    /// Items recorded as success.
    pub successful_items: u64,
    /// Items recorded as failed.
    pub failed_items: u64,
    /// Items recorded as skipped.
    pub skipped_items: u64,
}

impl Session {
    /// Creates a fresh session for `total_items` items.
    #[must_use]
    pub fn new(total_items: u64) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            start_time: Utc::now(),
            end_time: None,
            total_items,
            completed_items: 0,
            successful_items: 0,
            failed_items: 0,
            skipped_items: 0,
        }
    }

    /// Seeds counters from outcomes recorded in a previous run.
    pub fn seed(&mut self, statuses: impl IntoIterator<Item = OutcomeStatus>) {
        for status in statuses {
            self.apply_status(status);
        }
    }

    /// Applies one outcome to the counters.
    pub fn apply(&mut self, outcome: &Outcome) {
        self.apply_status(outcome.status());
    }

    /// Applies one already-recorded status to the counters.
    pub fn apply_record(&mut self, status: OutcomeStatus) {
        self.apply_status(status);
    }

    fn apply_status(&mut self, status: OutcomeStatus) {
        self.completed_items += 1;
        match status {
            OutcomeStatus::Success => self.successful_items += 1,
            OutcomeStatus::Failed => self.failed_items += 1,
            OutcomeStatus::Skipped => self.skipped_items += 1,
        }
    }

    /// Sets the end timestamp. Idempotent.
    pub fn finalize(&mut self) {
        if self.end_time.is_none() {
            self.end_time = Some(Utc::now());
        }
    }

    /// Returns true once every item has a recorded outcome.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.completed_items >= self.total_items
    }

    /// Checks the counter invariant: completed equals the sum of the
    /// per-status counts and never exceeds the total.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.completed_items == self.successful_items + self.failed_items + self.skipped_items
            && self.completed_items <= self.total_items
    }
}
