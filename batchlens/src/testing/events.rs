//! Event collection for assertions.

use crate::events::{EventBus, PipelineEvent};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// Subscribes to an [`EventBus`] and records everything it sees.
pub struct EventCollector {
    events: Arc<Mutex<Vec<PipelineEvent>>>,
    listener: JoinHandle<()>,
}

impl EventCollector {
    /// Starts collecting from the bus.
    #[must_use]
    pub fn spawn(bus: &EventBus) -> Self {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let mut rx = bus.subscribe();

        let listener = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => sink.lock().push(event),
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
            }
        });

        Self { events, listener }
    }

    /// Snapshot of everything collected so far.
    #[must_use]
    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events.lock().clone()
    }

    /// Number of collected events matching the predicate.
    pub fn count_matching(&self, predicate: impl Fn(&PipelineEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| predicate(e)).count()
    }
}

impl Drop for EventCollector {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_collector_records_in_order() {
        let bus = EventBus::new(16);
        let collector = EventCollector::spawn(&bus);

        bus.emit(PipelineEvent::BudgetExhausted {
            scope: "daily".to_string(),
        });
        bus.emit(PipelineEvent::ShutdownComplete);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let events = collector.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], PipelineEvent::BudgetExhausted { .. }));
        assert_eq!(
            collector.count_matching(|e| matches!(e, PipelineEvent::ShutdownComplete)),
            1
        );
    }
}
