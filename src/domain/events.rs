//! State transition events emitted while a run executes.
//!
//! Every run and job-run transition produces a [`RunEvent`]. Events are
//! consumed by the coordinator, logged, and optionally appended to the
//! JSONL event log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single immutable transition record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// The run this event belongs to
    pub run_id: Uuid,

    /// Job name for job-level events
    pub job_name: Option<String>,

    /// Attempt number for job-level events
    pub retry_attempt: Option<u32>,

    /// Type of event
    pub event_type: EventType,

    /// Human-readable summary (NO parameter values)
    pub summary: String,

    /// Time taken in milliseconds (for finished attempts)
    pub duration_ms: Option<u64>,

    /// Error message if failed
    pub error: Option<String>,
}

impl RunEvent {
    /// Create a run-level event with the current timestamp
    pub fn run(run_id: Uuid, event_type: EventType, summary: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            run_id,
            job_name: None,
            retry_attempt: None,
            event_type,
            summary: summary.into(),
            duration_ms: None,
            error: None,
        }
    }

    /// Create a job-level event with the current timestamp
    pub fn job(
        run_id: Uuid,
        job_name: impl Into<String>,
        retry_attempt: u32,
        event_type: EventType,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            job_name: Some(job_name.into()),
            retry_attempt: Some(retry_attempt),
            ..Self::run(run_id, event_type, summary)
        }
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Types of transitions recorded during a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    RunCreated,
    RunStarted,
    RunSucceeded,
    RunFailed,
    RunCancelled,

    /// An attempt moved to running
    JobStarted,
    JobSucceeded,

    /// Final failure of a job (no retries left)
    JobFailed,

    /// An attempt failed and another one follows
    JobRetrying,

    JobSkipped,
    JobCancelled,
}

impl EventType {
    pub fn is_job_event(self) -> bool {
        matches!(
            self,
            Self::JobStarted
                | Self::JobSucceeded
                | Self::JobFailed
                | Self::JobRetrying
                | Self::JobSkipped
                | Self::JobCancelled
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = RunEvent::job(
            Uuid::new_v4(),
            "extract",
            0,
            EventType::JobStarted,
            "Job 'extract' attempt 1 started",
        );

        let json = serde_json::to_string(&event).unwrap();
        let parsed: RunEvent = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.event_type, EventType::JobStarted);
        assert_eq!(parsed.job_name.as_deref(), Some("extract"));
        assert_eq!(parsed.retry_attempt, Some(0));
        assert!(json.contains("\"job_started\""));
    }

    #[test]
    fn test_event_builders() {
        let event = RunEvent::run(Uuid::new_v4(), EventType::RunFailed, "Run failed")
            .with_duration(1500)
            .with_error("one or more jobs failed: load");

        assert_eq!(event.duration_ms, Some(1500));
        assert_eq!(event.error.as_deref(), Some("one or more jobs failed: load"));
        assert!(event.job_name.is_none());
        assert!(!event.event_type.is_job_event());
    }
}
