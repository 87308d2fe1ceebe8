//! Ordered shutdown hook registry.

use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

type Hook = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// Named async hooks run once, in registration order, during shutdown.
///
/// The overall timeout is divided evenly among the hooks so one stuck
/// hook cannot starve the rest.
#[derive(Default)]
pub struct ShutdownHooks {
    hooks: Mutex<Vec<(String, Hook)>>,
}

impl ShutdownHooks {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a hook. Hooks run in the order they were registered.
    pub fn register<F, Fut>(&self, name: impl Into<String>, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let boxed: Hook = Box::new(move || Box::pin(hook()));
        self.hooks.lock().push((name, boxed));
    }

    /// Number of hooks not yet run.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.hooks.lock().len()
    }

    /// Runs every registered hook in registration order. Hooks are
    /// consumed, so a second call finds nothing to run.
    ///
    /// Returns the names of hooks that completed and those that timed
    /// out, with the per-hook timeout applied.
    pub async fn run_all(&self, total_timeout: Duration) -> (Vec<String>, Vec<String>) {
        let hooks: Vec<_> = std::mem::take(&mut *self.hooks.lock());
        if hooks.is_empty() {
            return (Vec::new(), Vec::new());
        }

        let per_hook = total_timeout
            .div_f64(hooks.len() as f64)
            .max(Duration::from_millis(10));

        let mut completed = Vec::new();
        let mut failed = Vec::new();

        for (name, hook) in hooks {
            debug!(hook = %name, "running shutdown hook");
            match timeout(per_hook, hook()).await {
                Ok(()) => completed.push(name),
                Err(_) => failed.push(name),
            }
        }

        (completed, failed)
    }
}

impl std::fmt::Debug for ShutdownHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownHooks")
            .field("pending", &self.pending())
            .finish()
    }
}
