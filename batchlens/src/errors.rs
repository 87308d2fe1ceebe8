//! Error types for the batchlens pipeline.
//!
//! The taxonomy distinguishes transient backend noise (retried), terminal
//! per-item errors (recorded immediately), pre-flight rejections (budget,
//! open breaker), and fatal process-level conditions (ledger write
//! failure, shutdown).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of a backend call error.
///
/// Determines whether the retry executor will attempt the call again and
/// how the failure is reported in the result log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// The backend rejected the call due to rate limiting.
    RateLimited,
    /// The call timed out.
    Timeout,
    /// A transient network failure (connection reset, DNS, 5xx).
    Network,
    /// Authentication or authorization failure.
    Authentication,
    /// The request was rejected as invalid (bad input, unsupported format).
    Validation,
    /// Anything that could not be classified.
    Unknown,
}

impl ErrorClass {
    /// Returns true if errors of this class are worth retrying.
    #[must_use]
    pub fn is_transient(self) -> bool {
        matches!(self, Self::RateLimited | Self::Timeout | Self::Network)
    }

    /// Returns the wire name used in the result log.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::Authentication => "authentication",
            Self::Validation => "validation",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by a backend's `classify` call.
#[derive(Debug, Clone, Error)]
#[error("{class}: {message}")]
pub struct ClassifyError {
    /// Error classification.
    pub class: ErrorClass,
    /// Human-readable message.
    pub message: String,
    /// Overrides the class-derived transience when set (e.g. a 429
    /// whose `Retry-After` exceeds any sane backoff).
    pub retryable: Option<bool>,
}

impl ClassifyError {
    /// Creates a new classify error.
    #[must_use]
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
            retryable: None,
        }
    }

    /// Forces the retry decision regardless of class.
    #[must_use]
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = Some(retryable);
        self
    }

    /// Creates a rate-limited error.
    #[must_use]
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::RateLimited, message)
    }

    /// Creates a timeout error.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Timeout, message)
    }

    /// Creates a network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Network, message)
    }

    /// Creates an authentication error.
    #[must_use]
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Authentication, message)
    }

    /// Creates a validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Validation, message)
    }

    /// Creates an unknown error.
    #[must_use]
    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Unknown, message)
    }

    /// Returns true if the retry executor may attempt this call again.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.retryable.unwrap_or_else(|| self.class.is_transient())
    }
}

/// The main error type for pipeline operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The backend call failed after the recorded number of attempts.
    #[error("backend call failed after {attempts} attempt(s): {source}")]
    Backend {
        /// The final backend error.
        source: ClassifyError,
        /// How many attempts were made.
        attempts: u32,
    },

    /// The circuit breaker for the backend is open.
    #[error("circuit breaker open for backend '{backend}', retry after {retry_after}")]
    BreakerOpen {
        /// The backend whose breaker is open.
        backend: String,
        /// Earliest time a probe will be admitted.
        retry_after: DateTime<Utc>,
    },

    /// A budget ceiling would be exceeded by this dispatch.
    #[error("budget exceeded for scope '{scope}'")]
    BudgetExceeded {
        /// The scope whose ceiling was hit (daily, weekly, monthly, backend, request).
        scope: String,
    },

    /// Writing to the durable result log failed.
    #[error("result ledger write failed: {0}")]
    LedgerWrite(String),

    /// The batch was cancelled.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Configuration is missing or invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Creates a backend failure error.
    #[must_use]
    pub fn backend(source: ClassifyError, attempts: u32) -> Self {
        Self::Backend { source, attempts }
    }

    /// Creates a config error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Returns true if this is a pre-flight rejection rather than an
    /// execution failure (recorded as skipped, not failed).
    #[must_use]
    pub fn is_preflight(&self) -> bool {
        matches!(self, Self::BudgetExceeded { .. } | Self::BreakerOpen { .. })
    }

    /// Returns true if this error must abort the whole batch.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::LedgerWrite(_) | Self::Io(_))
    }
}

/// Convenience result alias for pipeline operations.
pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
