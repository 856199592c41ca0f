//! Append-only transition log with file-based persistence.
//!
//! Each run gets `<base>/<run_id>/events.jsonl`, one [`RunEvent`] per line.
//! The log is an audit trail; run state itself lives in the run store.
//! [`EventLogWriter`] moves the file I/O onto a background task so a run's
//! driver never waits on the disk.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing::warn;
use uuid::Uuid;

use crate::domain::{EventType, RunEvent};

/// JSONL event log rooted at a runs directory
#[derive(Debug, Clone)]
pub struct EventLog {
    base_dir: PathBuf,
}

impl EventLog {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Log under the configured runs directory (~/.nbflow/runs or $NBFLOW_HOME/runs)
    pub fn from_config() -> Result<Self> {
        Ok(Self::new(crate::config::runs_dir()?))
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn run_dir(&self, run_id: Uuid) -> PathBuf {
        self.base_dir.join(run_id.to_string())
    }

    pub fn events_path(&self, run_id: Uuid) -> PathBuf {
        self.run_dir(run_id).join("events.jsonl")
    }

    /// Append an event to its run's log
    pub async fn append(&self, event: &RunEvent) -> Result<()> {
        let run_dir = self.run_dir(event.run_id);
        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("Failed to create run directory: {}", run_dir.display()))?;

        let events_path = self.events_path(event.run_id);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&events_path)
            .await
            .with_context(|| format!("Failed to open events file: {}", events_path.display()))?;

        let json = serde_json::to_string(event).context("Failed to serialize event")?;
        file.write_all(format!("{}\n", json).as_bytes())
            .await
            .context("Failed to write event")?;
        file.flush().await.context("Failed to flush event")?;

        Ok(())
    }

    /// Replay all events of a run in order
    pub async fn replay(&self, run_id: Uuid) -> Result<Vec<RunEvent>> {
        let events_path = self.events_path(run_id);
        if !events_path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&events_path)
            .await
            .with_context(|| format!("Failed to open events file: {}", events_path.display()))?;

        let reader = BufReader::new(file);
        let mut lines = reader.lines();
        let mut events = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let event: RunEvent = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse event: {}", line))?;
            events.push(event);
        }

        Ok(events)
    }

    /// Get the last event of a specific type
    pub async fn last_event_of_type(
        &self,
        run_id: Uuid,
        event_type: EventType,
    ) -> Result<Option<RunEvent>> {
        let events = self.replay(run_id).await?;
        Ok(events.into_iter().rev().find(|e| e.event_type == event_type))
    }

    /// List all run IDs that have a log, sorted
    pub async fn list_runs(&self) -> Result<Vec<Uuid>> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut runs = Vec::new();
        let mut entries = fs::read_dir(&self.base_dir)
            .await
            .with_context(|| format!("Failed to read runs directory: {}", self.base_dir.display()))?;

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(run_id) = entry
                .file_name()
                .to_str()
                .and_then(|name| Uuid::parse_str(name).ok())
            {
                runs.push(run_id);
            }
        }

        runs.sort();
        Ok(runs)
    }
}

#[derive(Debug)]
enum LogCommand {
    Append(RunEvent),
    /// Answered once every earlier append has been written
    Flush(oneshot::Sender<()>),
}

/// Handle to a task that appends events to an [`EventLog`] in send order
#[derive(Debug, Clone)]
pub struct EventLogWriter {
    tx: mpsc::UnboundedSender<LogCommand>,
}

impl EventLogWriter {
    /// Start the writer task. Must be called from within a Tokio runtime.
    ///
    /// The task exits once every handle is dropped.
    pub fn spawn(log: EventLog) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    LogCommand::Append(event) => {
                        if let Err(e) = log.append(&event).await {
                            warn!(run_id = %event.run_id, error = %e, "Failed to append event");
                        }
                    }
                    LogCommand::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });

        Self { tx }
    }

    /// Queue an event without waiting for it to be written
    pub fn append(&self, event: RunEvent) {
        if let Err(e) = self.tx.send(LogCommand::Append(event)) {
            if let LogCommand::Append(event) = e.0 {
                warn!(run_id = %event.run_id, "Event log writer stopped, dropping event");
            }
        }
    }

    /// Wait until everything queued so far is on disk
    pub async fn flush(&self) {
        let (done, written) = oneshot::channel();
        if self.tx.send(LogCommand::Flush(done)).is_ok() {
            let _ = written.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_writer_appends_in_send_order() {
        let temp = TempDir::new().unwrap();
        let log = EventLog::new(temp.path());
        let writer = EventLogWriter::spawn(log.clone());
        let run_id = Uuid::new_v4();

        writer.append(RunEvent::run(run_id, EventType::RunCreated, "created"));
        for attempt in 0..20 {
            writer.append(RunEvent::job(
                run_id,
                "extract",
                attempt,
                EventType::JobRetrying,
                "retrying",
            ));
        }
        writer.append(RunEvent::run(run_id, EventType::RunFailed, "failed"));
        writer.flush().await;

        let events = log.replay(run_id).await.unwrap();
        assert_eq!(events.len(), 22);
        assert_eq!(events[0].event_type, EventType::RunCreated);
        let attempts: Vec<u32> = events[1..21].iter().filter_map(|e| e.retry_attempt).collect();
        assert_eq!(attempts, (0..20).collect::<Vec<u32>>());
        assert_eq!(events[21].event_type, EventType::RunFailed);
    }
}
