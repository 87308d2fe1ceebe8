//! Command-line runner for the batchlens classification pipeline.

use anyhow::{bail, Context};
use batchlens::events::spawn_logging_subscriber;
use batchlens::prelude::*;
use batchlens::testing::ScriptedBackend;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(
    name = "batchlens",
    version,
    about = "Batch image classification with retries, circuit breaking, and budget enforcement"
)]
struct Cli {
    /// Backend to classify with
    #[arg(long)]
    backend: String,

    /// File listing one image path or URL per line ('#' starts a comment)
    #[arg(long)]
    input: PathBuf,

    /// Append-only result log; its checkpoint lives next to it
    #[arg(long, default_value = "results.jsonl")]
    log: PathBuf,

    /// Resume, skipping items already recorded in the log
    #[arg(long)]
    resume: bool,

    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the backend's worker pool size
    #[arg(long)]
    concurrency: Option<usize>,

    /// HTTP classify endpoint for the backend; omit to use the built-in
    /// mock backend named "mock"
    #[arg(long)]
    endpoint: Option<String>,

    /// Print the final report as JSON instead of the text summary
    #[arg(long)]
    json: bool,
}

/// Failures before the batch starts exit 2; failures that abort a
/// running batch exit 1.
enum RunError {
    Setup(anyhow::Error),
    Fatal(anyhow::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    let as_json = cli.json;

    match run(cli).await {
        Ok(report) => {
            if as_json {
                match serde_json::to_string_pretty(&report) {
                    Ok(rendered) => println!("{rendered}"),
                    Err(err) => error!(error = %err, "rendering report"),
                }
            } else {
                print_summary(&report);
            }
            ExitCode::SUCCESS
        }
        Err(RunError::Setup(err)) => {
            error!(error = %err, "setup failed");
            ExitCode::from(2)
        }
        Err(RunError::Fatal(err)) => {
            error!(error = %err, "batch aborted");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<BatchReport, RunError> {
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))
            .map_err(RunError::Setup)?,
        None => PipelineConfig::new(),
    };
    if let Some(concurrency) = cli.concurrency {
        let settings = config
            .backend_settings(&cli.backend)
            .with_concurrency(concurrency);
        config.backends.insert(cli.backend.clone(), settings);
    }

    let items = load_work_items(&cli.input).map_err(RunError::Setup)?;
    let registry = build_registry(&cli, &config).map_err(RunError::Setup)?;

    let orchestrator = Arc::new(Orchestrator::new(registry, config.clone()));
    let events = orchestrator.events().clone();
    spawn_logging_subscriber(&events);

    let guard = Arc::new(
        ResourceGuard::new(
            config.guard_settings(),
            Arc::clone(orchestrator.cancel_token()),
        )
        .with_events(events),
    );
    let pause_target = Arc::clone(&orchestrator);
    guard.hooks().register("pause-dispatch", move || async move {
        pause_target.pause_dispatch();
    });
    let drain_target = Arc::clone(&orchestrator);
    guard.hooks().register("drain-dispatch", move || async move {
        drain_target.drain_dispatch().await;
    });
    guard.spawn_monitor();
    spawn_signal_handler(Arc::clone(&guard)).map_err(RunError::Setup)?;

    let report = orchestrator
        .run(&cli.backend, items, &cli.log, cli.resume)
        .await
        .map_err(|err| match err {
            PipelineError::Config(_) => RunError::Setup(err.into()),
            other => RunError::Fatal(other.into()),
        })?;

    if report.cancelled {
        info!("batch interrupted; rerun with --resume to continue");
    }
    Ok(report)
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Reads the work list: one source per line, blanks and comments skipped.
fn load_work_items(path: &std::path::Path) -> anyhow::Result<Vec<WorkItem>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading work list from {}", path.display()))?;

    let items: Vec<WorkItem> = raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(WorkItem::new)
        .collect();

    if items.is_empty() {
        bail!("work list {} contains no items", path.display());
    }
    Ok(items)
}

fn build_registry(cli: &Cli, config: &PipelineConfig) -> anyhow::Result<Arc<BackendRegistry>> {
    let registry = Arc::new(BackendRegistry::new());
    let settings = config.backend_settings(&cli.backend);

    match &cli.endpoint {
        Some(endpoint) => {
            let backend = HttpBackend::new(HttpBackendConfig {
                name: cli.backend.clone(),
                endpoint: endpoint.clone(),
                api_key: std::env::var("BATCHLENS_API_KEY").ok(),
                timeout_secs: settings.request_timeout_secs,
            })
            .map_err(|err| anyhow::anyhow!("building http backend: {err}"))?;
            registry.register_with_settings(Arc::new(backend), settings);
        }
        None if cli.backend == "mock" => {
            registry.register_with_settings(
                Arc::new(ScriptedBackend::always_succeeding("mock")),
                settings,
            );
        }
        None => bail!("backend '{}' requires --endpoint", cli.backend),
    }
    Ok(registry)
}

/// First termination signal starts graceful shutdown; later ones are
/// absorbed while it runs.
fn spawn_signal_handler(guard: Arc<ResourceGuard>) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                guard.shutdown("termination signal received").await;
            }
        });
    }
    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            loop {
                let _ = tokio::signal::ctrl_c().await;
                guard.shutdown("termination signal received").await;
            }
        });
    }
    Ok(())
}

fn print_summary(report: &BatchReport) {
    let session = &report.session;
    println!("session   {}", session.session_id);
    println!(
        "items     {} total, {} succeeded, {} failed, {} skipped",
        session.total_items,
        session.successful_items,
        session.failed_items,
        session.skipped_items
    );

    let mut scopes: Vec<_> = report.spent_by_scope.iter().collect();
    scopes.sort_by(|a, b| a.0.cmp(b.0));
    for (scope, spent) in scopes {
        println!("spend     {scope}: ${spent:.4}");
    }

    if report.cancelled {
        println!(
            "status    interrupted ({} items left)",
            session.total_items - session.completed_items
        );
    } else {
        println!("status    complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn test_load_work_items_skips_blanks_and_comments() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# photo batch").unwrap();
        writeln!(file, "photos/a.jpg").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "  photos/b.jpg  ").unwrap();
        file.flush().unwrap();

        let items = load_work_items(file.path()).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].source, "photos/a.jpg");
        assert_eq!(items[1].source, "photos/b.jpg");
    }

    #[test]
    fn test_empty_work_list_rejected() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(load_work_items(file.path()).is_err());
    }

    #[test]
    fn test_cli_parses_minimal_invocation() {
        let cli = Cli::parse_from([
            "batchlens",
            "--backend",
            "mock",
            "--input",
            "work.txt",
        ]);
        assert_eq!(cli.backend, "mock");
        assert!(!cli.resume);
        assert_eq!(cli.log, PathBuf::from("results.jsonl"));
    }
}
