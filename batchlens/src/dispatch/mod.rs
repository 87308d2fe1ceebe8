//! Per-backend bounded-concurrency dispatch queues.
//!
//! Each backend gets its own queue sized to that service's tolerance, so
//! saturating one backend never starves another. The queue itself does
//! no retrying; retry and breaker logic are composed into the submitted
//! task before submission.

use crate::cancellation::CancelToken;
use crate::errors::PipelineError;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::debug;

/// Bounded worker pool for one backend.
///
/// `submit` spawns a task that waits for the pause gate and a worker
/// slot before running. Pausing stops new dispatch without cancelling
/// in-flight work; cancellation through the shared token interrupts both
/// the pause wait and the slot wait.
pub struct DispatchQueue {
    backend: String,
    slots: Arc<Semaphore>,
    paused: watch::Sender<bool>,
    token: Arc<CancelToken>,
    pending: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl DispatchQueue {
    /// Creates a queue with `concurrency` worker slots.
    #[must_use]
    pub fn new(backend: impl Into<String>, concurrency: usize, token: Arc<CancelToken>) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            backend: backend.into(),
            slots: Arc::new(Semaphore::new(concurrency.max(1))),
            paused,
            token,
            pending: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
        }
    }

    /// The backend this queue dispatches to.
    #[must_use]
    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// Tasks queued or running.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Returns true while the pause gate is closed.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Stops admitting queued tasks to worker slots. In-flight tasks run
    /// to completion.
    pub fn pause(&self) {
        if !self.paused.send_replace(true) {
            debug!(backend = %self.backend, "dispatch queue paused");
        }
    }

    /// Reopens the pause gate.
    pub fn resume(&self) {
        if self.paused.send_replace(false) {
            debug!(backend = %self.backend, "dispatch queue resumed");
        }
    }

    /// Submits a task. The returned handle resolves to the task's result
    /// or [`PipelineError::Cancelled`] if the batch was cancelled before
    /// a slot opened.
    pub fn submit<T, Fut>(&self, task: Fut) -> JoinHandle<Result<T, PipelineError>>
    where
        T: Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        self.pending.fetch_add(1, Ordering::SeqCst);

        let slots = Arc::clone(&self.slots);
        let token = Arc::clone(&self.token);
        let pending = Arc::clone(&self.pending);
        let idle = Arc::clone(&self.idle);
        let mut gate = self.paused.subscribe();

        tokio::spawn(async move {
            // Settle the pending count no matter how this task exits.
            let _done = CompletionGuard { pending, idle };

            let permit = loop {
                // Hold at the pause gate before competing for a slot.
                loop {
                    if token.is_cancelled() {
                        return Err(cancel_error(&token));
                    }
                    if !*gate.borrow_and_update() {
                        break;
                    }
                    tokio::select! {
                        changed = gate.changed() => {
                            if changed.is_err() {
                                return Err(cancel_error(&token));
                            }
                        }
                        () = token.cancelled() => return Err(cancel_error(&token)),
                    }
                }

                let permit = tokio::select! {
                    permit = Arc::clone(&slots).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return Err(cancel_error(&token)),
                    },
                    () = token.cancelled() => return Err(cancel_error(&token)),
                };

                // pause() may have landed while this task waited on the
                // slot; give the permit back and hold at the gate again.
                if !*gate.borrow_and_update() {
                    break permit;
                }
                drop(permit);
            };

            let result = task.await;
            drop(permit);
            Ok(result)
        })
    }

    /// Resolves once no task is queued or running.
    pub async fn drain(&self) {
        loop {
            let notified = self.idle.notified();
            if self.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

fn cancel_error(token: &CancelToken) -> PipelineError {
    PipelineError::Cancelled(token.reason().unwrap_or_else(|| "cancelled".to_string()))
}

struct CompletionGuard {
    pending: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

impl std::fmt::Debug for DispatchQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchQueue")
            .field("backend", &self.backend)
            .field("pending", &self.pending())
            .field("paused", &self.is_paused())
            .finish()
    }
}
