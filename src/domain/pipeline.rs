//! Pipeline and job definitions.
//!
//! A pipeline is a named container of notebook-backed jobs forming a DAG.
//! Definitions can be built through the request types (as an API layer
//! would) or loaded from a YAML [`PipelineDefinition`].

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::OrchestratorError;

/// A pipeline definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: Uuid,

    /// Unique pipeline name
    pub name: String,

    pub description: String,

    /// Cron expression consumed by an external scheduler
    pub schedule_cron: Option<String>,

    /// Paused pipelines refuse scheduled triggers
    pub is_paused: bool,

    /// Maximum number of pending+running runs (always >= 1)
    pub concurrency_limit: u32,

    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A single job (DAG node) of a pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineJob {
    pub id: Uuid,
    pub pipeline_id: Uuid,

    /// Job name, unique within the pipeline
    pub name: String,

    /// Notebook executed by this job
    pub notebook_id: String,

    pub compute_endpoint_id: Option<String>,

    /// Names of jobs in the same pipeline that must finish first
    pub depends_on: Vec<String>,

    /// Per-attempt deadline
    pub timeout_seconds: Option<u64>,

    /// Extra attempts after the first failure
    pub retry_count: u32,

    /// Tie-break hint for iteration order; never implies a dependency
    pub job_order: i32,

    pub created_at: DateTime<Utc>,
}

impl PipelineJob {
    /// Deadline for a single attempt, if any
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds.map(Duration::from_secs)
    }

    /// Total number of attempts allowed (first try included)
    pub fn max_attempts(&self) -> u32 {
        self.retry_count.saturating_add(1)
    }
}

/// Parameters for creating a pipeline
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreatePipelineRequest {
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub schedule_cron: Option<String>,

    #[serde(default)]
    pub is_paused: bool,

    /// 0 or absent means the default of 1
    #[serde(default)]
    pub concurrency_limit: Option<u32>,
}

impl CreatePipelineRequest {
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if self.name.trim().is_empty() {
            return Err(OrchestratorError::validation("name is required"));
        }
        Ok(())
    }

    /// Effective concurrency limit
    pub fn effective_concurrency_limit(&self) -> u32 {
        match self.concurrency_limit {
            None | Some(0) => 1,
            Some(limit) => limit,
        }
    }
}

/// Partial update of a pipeline. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct UpdatePipelineRequest {
    pub description: Option<String>,

    /// `Some(None)` clears the schedule
    pub schedule_cron: Option<Option<String>>,

    pub is_paused: Option<bool>,
    pub concurrency_limit: Option<u32>,
}

impl UpdatePipelineRequest {
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if self.concurrency_limit == Some(0) {
            return Err(OrchestratorError::validation(
                "concurrency_limit must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Parameters for adding a job to a pipeline
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateJobRequest {
    pub name: String,
    pub notebook_id: String,

    #[serde(default)]
    pub compute_endpoint_id: Option<String>,

    #[serde(default)]
    pub depends_on: Vec<String>,

    #[serde(default)]
    pub timeout_seconds: Option<u64>,

    #[serde(default)]
    pub retry_count: u32,

    #[serde(default)]
    pub job_order: i32,
}

impl CreateJobRequest {
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if self.name.trim().is_empty() {
            return Err(OrchestratorError::validation("name is required"));
        }
        if self.notebook_id.trim().is_empty() {
            return Err(OrchestratorError::validation("notebook_id is required"));
        }
        if self.timeout_seconds == Some(0) {
            return Err(OrchestratorError::validation(
                "timeout_seconds must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// A pipeline together with its jobs, as stored in a YAML file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub schedule_cron: Option<String>,

    #[serde(default)]
    pub is_paused: bool,

    #[serde(default)]
    pub concurrency_limit: Option<u32>,

    pub jobs: Vec<CreateJobRequest>,
}

impl PipelineDefinition {
    /// Load a definition from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline file: {}", path.display()))?;

        Self::from_yaml(&content)
    }

    /// Parse a definition from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse pipeline YAML")
    }

    /// Split into the pipeline request and its job requests
    pub fn pipeline_request(&self) -> CreatePipelineRequest {
        CreatePipelineRequest {
            name: self.name.clone(),
            description: self.description.clone(),
            schedule_cron: self.schedule_cron.clone(),
            is_paused: self.is_paused,
            concurrency_limit: self.concurrency_limit,
        }
    }
}

/// Check that a parameter key is a plain identifier: `[A-Za-z_][A-Za-z0-9_]*`
pub fn is_valid_parameter_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Reject run parameters whose keys are not identifiers
pub fn validate_parameters(parameters: &HashMap<String, String>) -> Result<(), OrchestratorError> {
    let mut invalid: Vec<&str> = parameters
        .keys()
        .map(String::as_str)
        .filter(|k| !is_valid_parameter_name(k))
        .collect();

    if invalid.is_empty() {
        return Ok(());
    }

    invalid.sort_unstable();
    Err(OrchestratorError::validation(format!(
        "invalid parameter name(s): {}",
        invalid.join(", ")
    )))
}
