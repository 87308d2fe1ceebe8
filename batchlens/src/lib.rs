//! # Batchlens
//!
//! Resilient batch execution for image classification over external
//! backends.
//!
//! Batchlens drives large batches of classification calls through
//! rate-limited, intermittently failing services with:
//!
//! - **Bounded dispatch**: a per-backend worker pool so one saturated
//!   service never starves another
//! - **Retry with backoff**: transient errors retried on an exponential
//!   schedule, terminal errors recorded immediately
//! - **Circuit breaking**: a systemically failing backend is isolated
//!   after consecutive failures and probed for recovery
//! - **Budget enforcement**: atomic reserve-then-confirm spend
//!   accounting against daily, weekly, monthly, and per-backend ceilings
//! - **Durable results**: an append-only outcome log plus an atomic
//!   checkpoint, so an interrupted batch resumes where it stopped
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use batchlens::prelude::*;
//! use std::sync::Arc;
//!
//! let registry = Arc::new(BackendRegistry::new());
//! registry.register(Arc::new(my_backend));
//!
//! let orchestrator = Orchestrator::new(registry, PipelineConfig::load("batch.json")?);
//! let report = orchestrator
//!     .run("vision-api", items, Path::new("results.jsonl"), true)
//!     .await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]

pub mod backend;
pub mod breaker;
pub mod budget;
pub mod cancellation;
pub mod core;
pub mod dispatch;
pub mod errors;
pub mod events;
pub mod guard;
pub mod ledger;
pub mod pipeline;
pub mod progress;
pub mod retry;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::backend::{Backend, BackendRegistry, BackendSettings};
    pub use crate::breaker::{BreakerSettings, BreakerSet, CircuitBreaker, CircuitState};
    pub use crate::budget::{BudgetLedger, BudgetLimits};
    pub use crate::cancellation::CancelToken;
    pub use crate::core::{
        Classification, Outcome, OutcomeRecord, OutcomeStatus, Session, WorkItem,
    };
    pub use crate::dispatch::DispatchQueue;
    pub use crate::errors::{ClassifyError, ErrorClass, PipelineError, Result};
    pub use crate::events::{EventBus, PipelineEvent};
    pub use crate::guard::{GuardSettings, ResourceGuard};
    pub use crate::ledger::{load_previous_outcomes, ResultLedger};
    pub use crate::pipeline::{BatchReport, Orchestrator, PipelineConfig};
    pub use crate::progress::{ProgressReporter, ProgressSnapshot};
    pub use crate::retry::{run_with_retry, AttemptError, RetryPolicy};

    #[cfg(feature = "http-backend")]
    pub use crate::backend::{HttpBackend, HttpBackendConfig};
}
