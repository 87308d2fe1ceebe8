//! End-to-end batch runs over mock backends.

use super::{Orchestrator, PipelineConfig};
use crate::backend::{BackendRegistry, BackendSettings};
use crate::breaker::BreakerSettings;
use crate::budget::BudgetLimits;
use crate::core::{OutcomeStatus, WorkItem};
use crate::errors::{ClassifyError, ErrorClass, PipelineError};
use crate::ledger::load_previous_outcomes;
use crate::events::PipelineEvent;
use crate::retry::RetryPolicy;
use crate::testing::{sample_classification, EventCollector, FlakyBackend, ScriptedBackend};
use pretty_assertions::assert_eq;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new()
        .with_max_attempts(max_attempts)
        .with_initial_delay_ms(1)
        .with_jitter(false)
}

fn items(n: usize) -> Vec<WorkItem> {
    (0..n).map(|i| WorkItem::new(format!("img-{i}.jpg"))).collect()
}

fn log_in(dir: &tempfile::TempDir) -> PathBuf {
    dir.path().join("results.jsonl")
}

#[tokio::test]
async fn test_every_item_recorded_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let log = log_in(&dir);

    let registry = Arc::new(BackendRegistry::new());
    registry.register(Arc::new(ScriptedBackend::always_succeeding("mock")));

    let orchestrator = Orchestrator::new(registry, PipelineConfig::new());
    let report = orchestrator
        .run("mock", items(10), &log, false)
        .await
        .unwrap();

    assert!(report.is_complete());
    assert_eq!(report.session.total_items, 10);
    assert_eq!(report.session.successful_items, 10);
    assert!(report.session.is_consistent());
    assert!(report.session.end_time.is_some());

    let recorded = load_previous_outcomes(&log).unwrap();
    assert_eq!(recorded.len(), 10);
    assert!(recorded
        .values()
        .all(|record| record.status == OutcomeStatus::Success));

    // Checkpoint on disk agrees with the log.
    let checkpoint: crate::core::Session = serde_json::from_str(
        &std::fs::read_to_string(dir.path().join("results.checkpoint.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(checkpoint.completed_items, 10);
}

#[tokio::test]
async fn test_terminal_error_recorded_without_retry() {
    let dir = tempfile::tempdir().unwrap();
    let log = log_in(&dir);

    let backend = Arc::new(ScriptedBackend::new(
        "mock",
        vec![Err(ClassifyError::authentication("401 unauthorized"))],
    ));
    let registry = Arc::new(BackendRegistry::new());
    registry.register(Arc::clone(&backend) as _);

    let mut config = PipelineConfig::new();
    config.retry = fast_retry(5);

    let orchestrator = Orchestrator::new(registry, config);
    let report = orchestrator
        .run("mock", items(1), &log, false)
        .await
        .unwrap();

    assert_eq!(report.session.failed_items, 1);
    assert_eq!(backend.calls(), 1);

    let recorded = load_previous_outcomes(&log).unwrap();
    let record = recorded.values().next().unwrap();
    assert_eq!(record.status, OutcomeStatus::Failed);
    assert_eq!(record.error_class, Some(ErrorClass::Authentication));
    assert_eq!(record.attempts, 1);
}

#[tokio::test]
async fn test_transient_failures_retried_to_success() {
    let dir = tempfile::tempdir().unwrap();
    let log = log_in(&dir);

    let backend = Arc::new(FlakyBackend::new(
        "mock",
        2,
        ClassifyError::network("connection reset"),
    ));
    let registry = Arc::new(BackendRegistry::new());
    registry.register(Arc::clone(&backend) as _);

    let mut config = PipelineConfig::new();
    config.retry = fast_retry(3);

    let orchestrator = Orchestrator::new(registry, config);
    let report = orchestrator
        .run("mock", items(1), &log, false)
        .await
        .unwrap();

    assert_eq!(report.session.successful_items, 1);
    assert_eq!(backend.calls(), 3);

    let recorded = load_previous_outcomes(&log).unwrap();
    assert_eq!(recorded.values().next().unwrap().attempts, 3);
}

#[tokio::test]
async fn test_budget_denial_recorded_as_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let log = log_in(&dir);

    let backend = ScriptedBackend::new("mock", Vec::new())
        .with_fallback(sample_classification(0.02));
    let registry = Arc::new(BackendRegistry::new());
    registry.register_with_settings(
        Arc::new(backend),
        BackendSettings::new()
            .with_cost_per_item(0.02)
            .with_concurrency(1),
    );

    let mut config = PipelineConfig::new();
    config.budget = BudgetLimits::new().with_daily(0.05);

    let orchestrator = Orchestrator::new(registry, config);
    let collector = EventCollector::spawn(orchestrator.events());
    let report = orchestrator
        .run("mock", items(3), &log, false)
        .await
        .unwrap();

    assert_eq!(report.session.successful_items, 2);
    assert_eq!(report.session.skipped_items, 1);
    assert!(report.is_complete());

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(
        collector.count_matching(|e| matches!(e, PipelineEvent::BudgetExhausted { .. })) >= 1
    );

    let recorded = load_previous_outcomes(&log).unwrap();
    let skip = recorded
        .values()
        .find(|record| record.status == OutcomeStatus::Skipped)
        .unwrap();
    assert!(skip.error.as_deref().unwrap().contains("budget exceeded"));
    assert_eq!(skip.attempts, 0);

    // Only confirmed spend counts against the ceiling.
    let spent = report.spent_by_scope["daily"];
    assert!((spent - 0.04).abs() < 1e-9, "spent {spent}");
}

#[tokio::test]
async fn test_open_breaker_stops_dispatch_for_backend() {
    let dir = tempfile::tempdir().unwrap();
    let log = log_in(&dir);

    let backend = Arc::new(FlakyBackend::new(
        "mock",
        1000,
        ClassifyError::network("connection reset"),
    ));
    let registry = Arc::new(BackendRegistry::new());
    registry.register_with_settings(
        Arc::clone(&backend) as _,
        BackendSettings::new().with_concurrency(1),
    );

    let mut config = PipelineConfig::new();
    config.retry = fast_retry(1);
    config.breaker = BreakerSettings::new()
        .with_failure_threshold(3)
        .with_reset_timeout_secs(300);

    let orchestrator = Orchestrator::new(registry, config);
    let collector = EventCollector::spawn(orchestrator.events());
    let report = orchestrator
        .run("mock", items(10), &log, false)
        .await
        .unwrap();

    // Three failures trip the breaker; the rest never reach the backend.
    assert_eq!(backend.calls(), 3);
    assert_eq!(report.session.failed_items, 3);
    assert_eq!(report.session.skipped_items, 7);
    assert!(report.session.is_consistent());

    let recorded = load_previous_outcomes(&log).unwrap();
    let breaker_skips = recorded
        .values()
        .filter(|record| {
            record.status == OutcomeStatus::Skipped
                && record.error.as_deref().unwrap_or_default().contains("breaker")
        })
        .count();
    assert_eq!(breaker_skips, 7);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(
        collector.count_matching(
            |e| matches!(e, PipelineEvent::BreakerTransition { to, .. } if to == "open")
        ),
        1
    );
}

#[tokio::test]
async fn test_resume_submits_only_unrecorded_items() {
    let dir = tempfile::tempdir().unwrap();
    let log = log_in(&dir);
    let batch = items(6);

    // First run: slow backend, cancelled early, leaving some items
    // unrecorded.
    let slow = Arc::new(
        ScriptedBackend::always_succeeding("mock").with_delay(Duration::from_millis(50)),
    );
    let registry = Arc::new(BackendRegistry::new());
    registry.register_with_settings(slow as _, BackendSettings::new().with_concurrency(2));

    let orchestrator = Arc::new(Orchestrator::new(registry, PipelineConfig::new()));
    let canceller = Arc::clone(&orchestrator);
    let interrupter = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        canceller.cancel_token().cancel("interrupted");
    });

    let report = orchestrator
        .run("mock", batch.clone(), &log, false)
        .await
        .unwrap();
    interrupter.await.unwrap();

    assert!(report.cancelled);
    let recorded = load_previous_outcomes(&log).unwrap();
    let first_run = recorded.len() as u64;
    assert_eq!(report.session.completed_items, first_run);
    assert!(first_run < 6, "cancellation should leave work undone");

    // Second run resumes: only the unrecorded items reach the backend.
    let counting = Arc::new(ScriptedBackend::always_succeeding("mock"));
    let registry = Arc::new(BackendRegistry::new());
    registry.register(Arc::clone(&counting) as _);

    let orchestrator = Orchestrator::new(registry, PipelineConfig::new());
    let report = orchestrator.run("mock", batch, &log, true).await.unwrap();

    assert_eq!(u64::from(counting.calls()), 6 - first_run);
    assert_eq!(report.session.total_items, 6);
    assert_eq!(report.session.completed_items, 6);
    assert!(report.is_complete());
    assert_eq!(load_previous_outcomes(&log).unwrap().len(), 6);
}

#[tokio::test]
async fn test_fresh_run_replaces_stale_log() {
    let dir = tempfile::tempdir().unwrap();
    let log = log_in(&dir);
    std::fs::write(&log, "{\"stale\": true}\n").unwrap();

    let registry = Arc::new(BackendRegistry::new());
    registry.register(Arc::new(ScriptedBackend::always_succeeding("mock")));

    let orchestrator = Orchestrator::new(registry, PipelineConfig::new());
    orchestrator
        .run("mock", items(2), &log, false)
        .await
        .unwrap();

    assert_eq!(load_previous_outcomes(&log).unwrap().len(), 2);
}

#[tokio::test]
async fn test_duplicate_sources_processed_once() {
    let dir = tempfile::tempdir().unwrap();
    let log = log_in(&dir);

    let backend = Arc::new(ScriptedBackend::always_succeeding("mock"));
    let registry = Arc::new(BackendRegistry::new());
    registry.register(Arc::clone(&backend) as _);

    let mut batch = items(3);
    batch.push(WorkItem::new("img-0.jpg"));

    let orchestrator = Orchestrator::new(registry, PipelineConfig::new());
    let report = orchestrator.run("mock", batch, &log, false).await.unwrap();

    assert_eq!(report.session.total_items, 3);
    assert_eq!(backend.calls(), 3);
}

#[tokio::test]
async fn test_unknown_backend_is_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = Orchestrator::new(Arc::new(BackendRegistry::new()), PipelineConfig::new());

    let result = orchestrator
        .run("ghost", items(1), &log_in(&dir), false)
        .await;
    assert!(matches!(result, Err(PipelineError::Config(_))));
}

#[tokio::test]
async fn test_empty_work_list_is_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(BackendRegistry::new());
    registry.register(Arc::new(ScriptedBackend::always_succeeding("mock")));

    let orchestrator = Orchestrator::new(registry, PipelineConfig::new());
    let result = orchestrator
        .run("mock", Vec::new(), &log_in(&dir), false)
        .await;
    assert!(matches!(result, Err(PipelineError::Config(_))));
}

#[tokio::test]
async fn test_per_call_timeout_maps_to_timeout_class() {
    let dir = tempfile::tempdir().unwrap();
    let log = log_in(&dir);

    let backend = ScriptedBackend::always_succeeding("mock").with_delay(Duration::from_millis(1500));
    let registry = Arc::new(BackendRegistry::new());
    registry.register_with_settings(
        Arc::new(backend),
        BackendSettings::new().with_request_timeout(1),
    );

    let mut config = PipelineConfig::new();
    config.retry = fast_retry(1);

    let orchestrator = Orchestrator::new(registry, config);
    let report = orchestrator
        .run("mock", items(1), &log, false)
        .await
        .unwrap();

    assert_eq!(report.session.failed_items, 1);
    let recorded = load_previous_outcomes(&log).unwrap();
    assert_eq!(
        recorded.values().next().unwrap().error_class,
        Some(ErrorClass::Timeout)
    );
}
