//! Per-item outcomes and their wire form in the result log.

use crate::errors::ErrorClass;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::WorkItem;

/// The opaque classification payload returned by a backend.
///
/// The pipeline never inspects anything here beyond `cost_usd`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    /// Category label assigned by the backend.
    pub category: String,
    /// Backend-reported confidence in [0, 1].
    pub confidence: f64,
    /// Actual cost of the call in USD.
    pub cost_usd: f64,
    /// Call latency in milliseconds.
    pub latency_ms: u64,
    /// Token usage, if the backend reports it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u32>,
}

/// Terminal outcome of one work item. Immutable once created and
/// appended to the result ledger exactly once.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The backend classified the item.
    Success {
        /// Result payload.
        classification: Classification,
        /// Attempts consumed, including the successful one.
        attempts: u32,
    },
    /// The item failed terminally.
    Failure {
        /// Final error message.
        message: String,
        /// Error classification of the final error.
        class: ErrorClass,
        /// Attempts consumed.
        attempts: u32,
    },
    /// The item was never dispatched.
    Skipped {
        /// Why it was skipped (e.g. "budget exceeded").
        reason: String,
    },
}

impl Outcome {
    /// Returns the status tag for this outcome.
    #[must_use]
    pub fn status(&self) -> OutcomeStatus {
        match self {
            Self::Success { .. } => OutcomeStatus::Success,
            Self::Failure { .. } => OutcomeStatus::Failed,
            Self::Skipped { .. } => OutcomeStatus::Skipped,
        }
    }

    /// Returns the actual cost incurred, zero for failures and skips.
    #[must_use]
    pub fn cost_usd(&self) -> f64 {
        match self {
            Self::Success { classification, .. } => classification.cost_usd,
            _ => 0.0,
        }
    }
}

/// Status tag written to the result log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    /// Classified successfully.
    Success,
    /// Failed terminally.
    Failed,
    /// Skipped before dispatch.
    Skipped,
}

/// One line of the append-only result log.
///
/// Each record carries its own work item id so resume reconciliation is
/// independent of append order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeRecord {
    /// Work item id.
    pub id: String,
    /// Work item source reference.
    pub source: String,
    /// Outcome status.
    pub status: OutcomeStatus,
    /// Classification payload for successes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Classification>,
    /// Error or skip reason for failures and skips.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Error classification for failures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_class: Option<ErrorClass>,
    /// Attempts consumed (zero for skips).
    pub attempts: u32,
    /// When the outcome was recorded.
    pub timestamp: DateTime<Utc>,
}

impl OutcomeRecord {
    /// Builds the log record for an item's outcome.
    #[must_use]
    pub fn new(item: &WorkItem, outcome: &Outcome) -> Self {
        let (result, error, error_class, attempts) = match outcome {
            Outcome::Success {
                classification,
                attempts,
            } => (Some(classification.clone()), None, None, *attempts),
            Outcome::Failure {
                message,
                class,
                attempts,
            } => (None, Some(message.clone()), Some(*class), *attempts),
            Outcome::Skipped { reason } => (None, Some(reason.clone()), None, 0),
        };

        Self {
            id: item.id.clone(),
            source: item.source.clone(),
            status: outcome.status(),
            result,
            error,
            error_class,
            attempts,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_classification() -> Classification {
        Classification {
            category: "landscape".to_string(),
            confidence: 0.93,
            cost_usd: 0.002,
            latency_ms: 350,
            tokens: Some(420),
        }
    }

    #[test]
    fn test_status_mapping() {
        let success = Outcome::Success {
            classification: sample_classification(),
            attempts: 1,
        };
        assert_eq!(success.status(), OutcomeStatus::Success);
        assert!((success.cost_usd() - 0.002).abs() < f64::EPSILON);

        let failure = Outcome::Failure {
            message: "boom".to_string(),
            class: ErrorClass::Validation,
            attempts: 1,
        };
        assert_eq!(failure.status(), OutcomeStatus::Failed);
        assert_eq!(failure.cost_usd(), 0.0);
    }

    #[test]
    fn test_record_roundtrip_for_success() {
        let item = WorkItem::new("photos/cat.jpg");
        let outcome = Outcome::Success {
            classification: sample_classification(),
            attempts: 2,
        };
        let record = OutcomeRecord::new(&item, &outcome);

        let line = serde_json::to_string(&record).unwrap();
        let parsed: OutcomeRecord = serde_json::from_str(&line).unwrap();

        assert_eq!(parsed.id, item.id);
        assert_eq!(parsed.status, OutcomeStatus::Success);
        assert_eq!(parsed.attempts, 2);
        assert_eq!(parsed.result.unwrap().category, "landscape");
        assert!(parsed.error.is_none());
    }

    #[test]
    fn test_record_for_skip_has_zero_attempts() {
        let item = WorkItem::new("photos/cat.jpg");
        let outcome = Outcome::Skipped {
            reason: "budget exceeded".to_string(),
        };
        let record = OutcomeRecord::new(&item, &outcome);
        assert_eq!(record.attempts, 0);
        assert_eq!(record.error.as_deref(), Some("budget exceeded"));
        assert!(record.result.is_none());
    }

    #[test]
    fn test_record_for_failure_carries_class() {
        let item = WorkItem::new("photos/cat.jpg");
        let outcome = Outcome::Failure {
            message: "401 unauthorized".to_string(),
            class: ErrorClass::Authentication,
            attempts: 1,
        };
        let record = OutcomeRecord::new(&item, &outcome);
        assert_eq!(record.error_class, Some(ErrorClass::Authentication));
    }
}
