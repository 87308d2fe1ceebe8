//! Batch orchestrator.
//!
//! Composes the execution layers around each work item: budget
//! reservation, the per-backend dispatch queue, the circuit breaker and
//! retry executor around the backend call, and the durable result
//! ledger. Each item ends in exactly one recorded outcome; items the
//! batch never reached leave no record and run again on resume.

use crate::backend::{Backend, BackendRegistry, BackendSettings};
use crate::breaker::{BreakerSet, CircuitBreaker};
use crate::budget::BudgetLedger;
use crate::cancellation::CancelToken;
use crate::core::{Outcome, Session, WorkItem};
use crate::dispatch::DispatchQueue;
use crate::errors::{ClassifyError, PipelineError, Result};
use crate::events::{EventBus, PipelineEvent};
use crate::ledger::{load_previous_outcomes, ResultLedger};
use crate::progress::ProgressReporter;
use crate::retry::{run_with_retry, AttemptError, RetryPolicy};
use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use super::PipelineConfig;

/// Final accounting for one batch run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    /// Session counters as written to the checkpoint.
    pub session: Session,
    /// True if the run ended early through cancellation.
    pub cancelled: bool,
    /// Confirmed spend per budget scope.
    pub spent_by_scope: HashMap<String, f64>,
}

impl BatchReport {
    /// Returns true once every item has a recorded outcome.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self.cancelled && self.session.is_terminal()
    }
}

/// Drives a batch of work items through one backend.
pub struct Orchestrator {
    registry: Arc<BackendRegistry>,
    config: PipelineConfig,
    budget: Arc<BudgetLedger>,
    breakers: Arc<BreakerSet>,
    events: EventBus,
    token: Arc<CancelToken>,
    queues: DashMap<String, Arc<DispatchQueue>>,
}

impl Orchestrator {
    /// Creates an orchestrator over the given registry and configuration.
    #[must_use]
    pub fn new(registry: Arc<BackendRegistry>, config: PipelineConfig) -> Self {
        let events = EventBus::default();
        let budget = Arc::new(BudgetLedger::new(config.budget.clone()).with_events(events.clone()));
        let breakers =
            Arc::new(BreakerSet::new(config.breaker.clone()).with_events(events.clone()));

        Self {
            registry,
            config,
            budget,
            breakers,
            events,
            token: CancelToken::new(),
            queues: DashMap::new(),
        }
    }

    /// The event bus this orchestrator publishes to.
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// The cancellation token ending this orchestrator's runs.
    #[must_use]
    pub fn cancel_token(&self) -> &Arc<CancelToken> {
        &self.token
    }

    /// Closes the pause gate on every dispatch queue.
    pub fn pause_dispatch(&self) {
        for queue in &self.queues {
            queue.pause();
        }
    }

    /// Reopens the pause gate on every dispatch queue.
    pub fn resume_dispatch(&self) {
        for queue in &self.queues {
            queue.resume();
        }
    }

    /// Resolves once no dispatch queue has queued or running work.
    pub async fn drain_dispatch(&self) {
        let queues: Vec<Arc<DispatchQueue>> = self
            .queues
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for queue in queues {
            queue.drain().await;
        }
    }

    /// Runs `items` through `backend_name`, appending outcomes to the
    /// log at `log_path`.
    ///
    /// With `resume` set, items already recorded in the log are seeded
    /// into the session instead of being dispatched again. Without it, a
    /// pre-existing log and checkpoint are replaced.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Config`] for an unknown backend or an empty work
    /// list, IO errors opening the log, and any fatal error that aborted
    /// the batch (a failed ledger write foremost). Per-item failures are
    /// recorded in the log, not returned.
    pub async fn run(
        &self,
        backend_name: &str,
        items: Vec<WorkItem>,
        log_path: &Path,
        resume: bool,
    ) -> Result<BatchReport> {
        let backend = self.registry.get(backend_name)?;
        let settings = self
            .config
            .backends
            .get(backend_name)
            .cloned()
            .unwrap_or_else(|| self.registry.settings(backend_name));

        let items = dedupe(items);
        if items.is_empty() {
            return Err(PipelineError::config("no work items to process"));
        }

        let checkpoint_path = ResultLedger::checkpoint_path_for(log_path);
        let previous = if resume {
            load_previous_outcomes(log_path)?
        } else {
            remove_if_present(log_path).await?;
            remove_if_present(&checkpoint_path).await?;
            HashMap::new()
        };

        let total = items.len() as u64;
        let mut session = Session::new(total);
        session.seed(
            items
                .iter()
                .filter_map(|item| previous.get(&item.id))
                .map(|record| record.status),
        );
        let seeded = session.completed_items;

        let remaining: Vec<WorkItem> = items
            .into_iter()
            .filter(|item| !previous.contains_key(&item.id))
            .collect();
        info!(
            backend = backend_name,
            total,
            resumed = seeded,
            to_process = remaining.len(),
            session = %session.session_id,
            "starting batch"
        );

        let ledger = Arc::new(ResultLedger::open(log_path, &checkpoint_path, session).await?);
        let progress = Arc::new(ProgressReporter::spawn(&self.events, total, seeded));
        let ticker = spawn_progress_ticker(
            Arc::clone(&progress),
            self.config.progress_interval(),
            Arc::clone(&self.token),
        );

        let queue = Arc::new(DispatchQueue::new(
            backend_name,
            settings.concurrency,
            Arc::clone(&self.token),
        ));
        self.queues
            .insert(backend_name.to_string(), Arc::clone(&queue));

        let context = ItemContext {
            backend,
            breaker: self.breakers.for_backend(backend_name),
            budget: Arc::clone(&self.budget),
            ledger: Arc::clone(&ledger),
            events: self.events.clone(),
            token: Arc::clone(&self.token),
            retry: self.config.retry.clone(),
            settings,
        };

        let mut handles = Vec::with_capacity(remaining.len());
        for item in remaining {
            if self.token.is_cancelled() {
                break;
            }
            self.events.emit(PipelineEvent::ItemStarted {
                id: item.id.clone(),
                backend: backend_name.to_string(),
            });
            let context = context.clone();
            handles.push(queue.submit(context.process(item)));
        }

        let mut cancelled = self.token.is_cancelled();
        let mut fatal: Option<PipelineError> = None;
        for handle in handles {
            // The queue wraps the task's own result in its cancellation
            // result; collapse the two before inspecting.
            let outcome = handle.await.map(|queued| queued.and_then(|task| task));
            match outcome {
                Ok(Ok(()) | Err(PipelineError::Cancelled(_))) => {}
                Ok(Err(err)) => {
                    warn!(error = %err, "item task failed fatally");
                    if fatal.is_none() {
                        fatal = Some(err);
                    }
                }
                Err(join_err) => {
                    if fatal.is_none() {
                        fatal = Some(PipelineError::config(format!(
                            "item task aborted: {join_err}"
                        )));
                    }
                }
            }
        }
        cancelled = cancelled || self.token.is_cancelled();

        ticker.abort();
        let session = match ledger.finalize().await {
            Ok(session) => session,
            Err(err) => {
                if fatal.is_none() {
                    fatal = Some(err);
                }
                ledger.session()
            }
        };
        progress.log_progress();
        progress.stop();

        if let Some(err) = fatal {
            return Err(err);
        }

        Ok(BatchReport {
            session,
            cancelled,
            spent_by_scope: self.budget.spent_by_scope(),
        })
    }
}

/// Everything one item's task needs, cloned per submission.
#[derive(Clone)]
struct ItemContext {
    backend: Arc<dyn Backend>,
    breaker: Arc<CircuitBreaker>,
    budget: Arc<BudgetLedger>,
    ledger: Arc<ResultLedger>,
    events: EventBus,
    token: Arc<CancelToken>,
    retry: RetryPolicy,
    settings: BackendSettings,
}

impl ItemContext {
    /// Runs one item to its recorded outcome.
    ///
    /// Cancellation before an outcome is reached leaves no record, so
    /// the item runs again on resume. A failed ledger append cancels the
    /// whole batch and surfaces as the fatal error.
    async fn process(self, mut item: WorkItem) -> Result<(), PipelineError> {
        let outcome = match self
            .budget
            .try_reserve(self.backend.name(), self.settings.cost_per_item_usd)
        {
            Err(PipelineError::BudgetExceeded { scope }) => Outcome::Skipped {
                reason: format!("budget exceeded ({scope})"),
            },
            Err(err) => return Err(err),
            Ok(reservation) => {
                let attempt = run_with_retry(&self.retry, &self.token, || {
                    let backend = Arc::clone(&self.backend);
                    let breaker = Arc::clone(&self.breaker);
                    let timeout = self.settings.request_timeout();
                    let item = item.clone();
                    async move {
                        breaker.admit(Utc::now()).map_err(AttemptError::Halt)?;

                        let result =
                            match tokio::time::timeout(timeout, backend.classify(&item)).await {
                                Ok(result) => result,
                                Err(_) => Err(ClassifyError::timeout(format!(
                                    "no response within {}s",
                                    timeout.as_secs()
                                ))),
                            };

                        match result {
                            Ok(classification) => {
                                breaker.record_success();
                                Ok(classification)
                            }
                            Err(err) => {
                                breaker.record_failure();
                                Err(AttemptError::Classify(err))
                            }
                        }
                    }
                })
                .await;

                match attempt {
                    Ok((classification, attempts)) => {
                        self.budget
                            .confirm(reservation, classification.cost_usd);
                        Outcome::Success {
                            classification,
                            attempts,
                        }
                    }
                    Err(PipelineError::Cancelled(reason)) => {
                        self.budget.release(reservation);
                        return Err(PipelineError::Cancelled(reason));
                    }
                    Err(PipelineError::BreakerOpen {
                        backend,
                        retry_after,
                    }) => {
                        self.budget.release(reservation);
                        Outcome::Skipped {
                            reason: format!(
                                "circuit breaker open for '{backend}' until {retry_after}"
                            ),
                        }
                    }
                    Err(PipelineError::Backend { source, attempts }) => {
                        self.budget.release(reservation);
                        Outcome::Failure {
                            message: source.message,
                            class: source.class,
                            attempts,
                        }
                    }
                    Err(err) => {
                        self.budget.release(reservation);
                        return Err(err);
                    }
                }
            }
        };

        let status = outcome.status();
        item.settle(status.into());
        let attempts = match &outcome {
            Outcome::Success { attempts, .. } | Outcome::Failure { attempts, .. } => *attempts,
            Outcome::Skipped { .. } => 0,
        };
        let cost_usd = outcome.cost_usd();

        if let Err(err) = self.ledger.append_outcome(&item, &outcome).await {
            self.token.cancel(format!("result log write failed: {err}"));
            return Err(err);
        }

        self.events.emit(PipelineEvent::ItemFinished {
            id: item.id,
            status,
            attempts,
            cost_usd,
        });
        Ok(())
    }
}

/// Drops later duplicates of the same derived id, keeping input order.
fn dedupe(items: Vec<WorkItem>) -> Vec<WorkItem> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.id.clone()))
        .collect()
}

async fn remove_if_present(path: &Path) -> Result<(), PipelineError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn spawn_progress_ticker(
    progress: Arc<ProgressReporter>,
    interval: std::time::Duration,
    token: Arc<CancelToken>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => progress.log_progress(),
                () = token.cancelled() => break,
            }
        }
    })
}
