//! Durable result ledger: append-only outcome log plus checkpoint.
//!
//! A single writer task owns the log file and the checkpoint path and
//! consumes append commands from a channel, so concurrent completions
//! can never interleave partial writes. Every append is flushed and
//! acknowledged before the caller may treat the outcome as recorded; the
//! checkpoint is rewritten atomically (temp file + rename) after each
//! append, so its counts are always derivable from the log.

use crate::core::{Outcome, OutcomeRecord, Session, WorkItem};
use crate::errors::PipelineError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

enum Command {
    Append {
        record: OutcomeRecord,
        ack: oneshot::Sender<Result<(), String>>,
    },
    Finalize {
        ack: oneshot::Sender<Result<Session, String>>,
    },
}

/// Handle to the ledger's writer task.
pub struct ResultLedger {
    tx: mpsc::Sender<Command>,
    session: Arc<Mutex<Session>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ResultLedger {
    /// Opens the log for appending and spawns the writer task.
    ///
    /// # Errors
    ///
    /// IO errors opening or creating the log file.
    pub async fn open(
        log_path: impl AsRef<Path>,
        checkpoint_path: impl AsRef<Path>,
        session: Session,
    ) -> Result<Self, PipelineError> {
        let log_path = log_path.as_ref().to_path_buf();
        let checkpoint_path = checkpoint_path.as_ref().to_path_buf();

        if let Some(parent) = log_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await?;

        let session = Arc::new(Mutex::new(session));
        let (tx, rx) = mpsc::channel(256);

        let writer = Writer {
            file,
            checkpoint_path,
            session: Arc::clone(&session),
        };
        let handle = tokio::spawn(writer.run(rx));

        Ok(Self {
            tx,
            session,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Derives the conventional checkpoint path for a log path
    /// (`results.jsonl` -> `results.checkpoint.json`).
    #[must_use]
    pub fn checkpoint_path_for(log_path: &Path) -> PathBuf {
        log_path.with_extension("checkpoint.json")
    }

    /// Appends one outcome and waits for the durable write.
    ///
    /// # Errors
    ///
    /// [`PipelineError::LedgerWrite`] if the write or flush failed, or if
    /// the writer has already shut down. Callers must not report the
    /// item as processed when this errors.
    pub async fn append_outcome(
        &self,
        item: &WorkItem,
        outcome: &Outcome,
    ) -> Result<(), PipelineError> {
        let record = OutcomeRecord::new(item, outcome);
        let (ack, done) = oneshot::channel();

        self.tx
            .send(Command::Append { record, ack })
            .await
            .map_err(|_| PipelineError::LedgerWrite("writer task stopped".to_string()))?;

        done.await
            .map_err(|_| PipelineError::LedgerWrite("writer task dropped the ack".to_string()))?
            .map_err(PipelineError::LedgerWrite)
    }

    /// Returns a snapshot of the session counters.
    #[must_use]
    pub fn session(&self) -> Session {
        self.session.lock().clone()
    }

    /// Sets the session end time, flushes the checkpoint, and stops the
    /// writer. Further appends fail.
    ///
    /// # Errors
    ///
    /// [`PipelineError::LedgerWrite`] if the final checkpoint write
    /// failed.
    pub async fn finalize(&self) -> Result<Session, PipelineError> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(Command::Finalize { ack })
            .await
            .map_err(|_| PipelineError::LedgerWrite("writer task stopped".to_string()))?;

        let session = done
            .await
            .map_err(|_| PipelineError::LedgerWrite("writer task dropped the ack".to_string()))?
            .map_err(PipelineError::LedgerWrite)?;

        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.await;
        }
        Ok(session)
    }
}

impl std::fmt::Debug for ResultLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultLedger")
            .field("session", &self.session())
            .finish()
    }
}

struct Writer {
    file: File,
    checkpoint_path: PathBuf,
    session: Arc<Mutex<Session>>,
}

impl Writer {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Append { record, ack } => {
                    let result = self.append(&record).await;
                    let _ = ack.send(result);
                }
                Command::Finalize { ack } => {
                    let result = self.finalize().await;
                    let _ = ack.send(result);
                    break;
                }
            }
        }
        debug!("result ledger writer stopped");
    }

    async fn append(&mut self, record: &OutcomeRecord) -> Result<(), String> {
        let mut line = serde_json::to_string(record).map_err(|e| e.to_string())?;
        line.push('\n');

        self.file
            .write_all(line.as_bytes())
            .await
            .map_err(|e| e.to_string())?;
        self.file.flush().await.map_err(|e| e.to_string())?;

        let session = {
            let mut session = self.session.lock();
            session.apply_record(record.status);
            session.clone()
        };
        self.write_checkpoint(&session).await
    }

    async fn finalize(&mut self) -> Result<Session, String> {
        self.file.flush().await.map_err(|e| e.to_string())?;
        let session = {
            let mut session = self.session.lock();
            session.finalize();
            session.clone()
        };
        self.write_checkpoint(&session).await?;
        Ok(session)
    }

    async fn write_checkpoint(&self, session: &Session) -> Result<(), String> {
        let payload = serde_json::to_vec_pretty(session).map_err(|e| e.to_string())?;
        let tmp = self.checkpoint_path.with_extension("json.tmp");

        tokio::fs::write(&tmp, payload)
            .await
            .map_err(|e| e.to_string())?;
        tokio::fs::rename(&tmp, &self.checkpoint_path)
            .await
            .map_err(|e| e.to_string())
    }
}

/// Loads previously recorded outcomes for resume.
///
/// Returns an empty map if the log does not exist. A torn final line
/// (crash mid-write) is dropped with a warning; its item simply runs
/// again.
///
/// # Errors
///
/// IO errors reading an existing log.
pub fn load_previous_outcomes(
    log_path: impl AsRef<Path>,
) -> Result<HashMap<String, OutcomeRecord>, PipelineError> {
    let log_path = log_path.as_ref();
    if !log_path.exists() {
        return Ok(HashMap::new());
    }

    let contents = std::fs::read_to_string(log_path)?;
    let mut outcomes = HashMap::new();

    for (index, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<OutcomeRecord>(line) {
            Ok(record) => {
                outcomes.insert(record.id.clone(), record);
            }
            Err(e) => {
                warn!(
                    line = index + 1,
                    error = %e,
                    "skipping unparseable result log line"
                );
            }
        }
    }

    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Classification, OutcomeStatus};
    use crate::errors::ErrorClass;
    use pretty_assertions::assert_eq;
    use std::io::Write as _;

    fn success_outcome(cost: f64) -> Outcome {
        Outcome::Success {
            classification: Classification {
                category: "portrait".to_string(),
                confidence: 0.88,
                cost_usd: cost,
                latency_ms: 120,
                tokens: None,
            },
            attempts: 1,
        }
    }

    #[tokio::test]
    async fn test_append_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("results.jsonl");
        let checkpoint = dir.path().join("results.checkpoint.json");

        let ledger = ResultLedger::open(&log, &checkpoint, Session::new(2))
            .await
            .unwrap();

        let first = WorkItem::new("a.jpg");
        let second = WorkItem::new("b.jpg");
        ledger
            .append_outcome(&first, &success_outcome(0.01))
            .await
            .unwrap();
        ledger
            .append_outcome(
                &second,
                &Outcome::Failure {
                    message: "401".to_string(),
                    class: ErrorClass::Authentication,
                    attempts: 1,
                },
            )
            .await
            .unwrap();

        let session = ledger.finalize().await.unwrap();
        assert_eq!(session.completed_items, 2);
        assert_eq!(session.successful_items, 1);
        assert_eq!(session.failed_items, 1);
        assert!(session.end_time.is_some());

        let outcomes = load_previous_outcomes(&log).unwrap();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[&first.id].status, OutcomeStatus::Success);
        assert_eq!(outcomes[&second.id].status, OutcomeStatus::Failed);
    }

    #[tokio::test]
    async fn test_checkpoint_matches_log_after_each_append() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("results.jsonl");
        let checkpoint = dir.path().join("results.checkpoint.json");

        let ledger = ResultLedger::open(&log, &checkpoint, Session::new(3))
            .await
            .unwrap();

        for source in ["a.jpg", "b.jpg"] {
            ledger
                .append_outcome(&WorkItem::new(source), &success_outcome(0.01))
                .await
                .unwrap();

            let parsed: Session =
                serde_json::from_str(&std::fs::read_to_string(&checkpoint).unwrap()).unwrap();
            let lines = std::fs::read_to_string(&log)
                .unwrap()
                .lines()
                .count() as u64;
            assert_eq!(parsed.completed_items, lines);
            assert!(parsed.is_consistent());
        }

        ledger.finalize().await.unwrap();
    }

    #[tokio::test]
    async fn test_append_after_finalize_fails() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("results.jsonl");
        let ledger = ResultLedger::open(
            &log,
            ResultLedger::checkpoint_path_for(&log),
            Session::new(1),
        )
        .await
        .unwrap();

        ledger.finalize().await.unwrap();

        let result = ledger
            .append_outcome(&WorkItem::new("late.jpg"), &success_outcome(0.01))
            .await;
        assert!(matches!(result, Err(PipelineError::LedgerWrite(_))));
    }

    #[test]
    fn test_load_missing_log_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let outcomes = load_previous_outcomes(dir.path().join("absent.jsonl")).unwrap();
        assert!(outcomes.is_empty());
    }

    #[tokio::test]
    async fn test_load_tolerates_torn_final_line() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("results.jsonl");

        let item = WorkItem::new("whole.jpg");
        let record = OutcomeRecord::new(&item, &success_outcome(0.01));
        let mut file = std::fs::File::create(&log).unwrap();
        writeln!(file, "{}", serde_json::to_string(&record).unwrap()).unwrap();
        // Simulate a crash mid-append.
        write!(file, "{{\"id\": \"torn").unwrap();
        drop(file);

        let outcomes = load_previous_outcomes(&log).unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes.contains_key(&item.id));
    }

    #[tokio::test]
    async fn test_concurrent_appends_all_recorded_once() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("results.jsonl");
        let ledger = Arc::new(
            ResultLedger::open(
                &log,
                ResultLedger::checkpoint_path_for(&log),
                Session::new(20),
            )
            .await
            .unwrap(),
        );

        let mut handles = Vec::new();
        for i in 0..20 {
            let ledger = Arc::clone(&ledger);
            handles.push(tokio::spawn(async move {
                let item = WorkItem::new(format!("img-{i}.jpg"));
                ledger.append_outcome(&item, &success_outcome(0.01)).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        ledger.finalize().await.unwrap();
        let outcomes = load_previous_outcomes(&log).unwrap();
        assert_eq!(outcomes.len(), 20);
    }
}
