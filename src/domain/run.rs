//! Run and job-run records.
//!
//! A [`PipelineRun`] is one execution of a pipeline. Each job of the run
//! gets one [`PipelineJobRun`] per attempt.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A pipeline execution run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: Uuid,
    pub pipeline_id: Uuid,
    pub status: RunStatus,
    pub trigger_type: TriggerType,
    pub triggered_by: String,
    pub parameters: HashMap<String, String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PipelineRun {
    /// Create a new pending run
    pub fn new(
        pipeline_id: Uuid,
        trigger_type: TriggerType,
        triggered_by: impl Into<String>,
        parameters: HashMap<String, String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            pipeline_id,
            status: RunStatus::Pending,
            trigger_type,
            triggered_by: triggered_by.into(),
            parameters,
            started_at: None,
            finished_at: None,
            error_message: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Pending or running
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

/// One attempt of one job within a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineJobRun {
    pub id: Uuid,
    pub run_id: Uuid,
    pub job_id: Uuid,
    pub job_name: String,
    pub status: JobRunStatus,

    /// 0-based attempt number
    pub retry_attempt: u32,

    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PipelineJobRun {
    /// Create a new pending attempt record
    pub fn new(run_id: Uuid, job_id: Uuid, job_name: impl Into<String>, retry_attempt: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            job_id,
            job_name: job_name.into(),
            status: JobRunStatus::Pending,
            retry_attempt,
            started_at: None,
            finished_at: None,
            error_message: None,
            created_at: Utc::now(),
        }
    }
}

/// Status of a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Terminal states are absorbing
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    pub const ACTIVE: [RunStatus; 2] = [RunStatus::Pending, RunStatus::Running];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl Default for RunStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single job attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobRunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,

    /// Not executed because a dependency did not succeed
    Skipped,

    Cancelled,
}

impl JobRunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        }
    }
}

impl Default for JobRunStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for JobRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What started a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Manual,
    Scheduled,
}

impl Default for TriggerType {
    fn default() -> Self {
        Self::Manual
    }
}

/// Offset/limit pagination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub offset: usize,
    pub limit: usize,
}

impl PageRequest {
    pub const DEFAULT_LIMIT: usize = 50;
    pub const MAX_LIMIT: usize = 1000;

    pub fn new(offset: usize, limit: usize) -> Self {
        Self { offset, limit }
    }

    /// Limit clamped to `1..=MAX_LIMIT`; 0 means the default
    pub fn effective_limit(&self) -> usize {
        match self.limit {
            0 => Self::DEFAULT_LIMIT,
            n => n.min(Self::MAX_LIMIT),
        }
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: Self::DEFAULT_LIMIT,
        }
    }
}

/// Filter for listing runs
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub pipeline_id: Option<Uuid>,
    pub status: Option<RunStatus>,
    pub page: PageRequest,
}

impl RunFilter {
    pub fn matches(&self, run: &PipelineRun) -> bool {
        self.pipeline_id.map_or(true, |id| run.pipeline_id == id)
            && self.status.map_or(true, |status| run.status == status)
    }
}
