//! Persistence for runs and job runs.
//!
//! [`RunStore`] is the seam to durable storage. Status changes go through
//! `transition_*`, which is a compare-and-set: the update only applies when
//! the current status is one of the expected ones. That check is the single
//! source of truth that keeps a cancelled run from being resurrected by a
//! late completion.
//!
//! Job-run changes are also gated on the parent run: once a run is
//! terminal, its job runs can only be settled in line with it, and no new
//! attempt can be recorded.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::domain::{
    JobRunStatus, OrchestratorError, PipelineJobRun, PipelineRun, RunFilter, RunStatus,
};

/// Storage backend for run state
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn create_run(&self, run: PipelineRun) -> Result<PipelineRun, OrchestratorError>;

    async fn get_run(&self, run_id: Uuid) -> Result<PipelineRun, OrchestratorError>;

    /// Newest first, with the total count before pagination
    async fn list_runs(
        &self,
        filter: &RunFilter,
    ) -> Result<(Vec<PipelineRun>, usize), OrchestratorError>;

    /// Move a run to `to` if its status is in `from`.
    ///
    /// Returns `Ok(None)` when the status did not match.
    async fn transition_run(
        &self,
        run_id: Uuid,
        from: &[RunStatus],
        to: RunStatus,
        error_message: Option<String>,
    ) -> Result<Option<PipelineRun>, OrchestratorError>;

    /// Record a new attempt. `Conflict` when the run is already terminal.
    async fn create_job_run(
        &self,
        job_run: PipelineJobRun,
    ) -> Result<PipelineJobRun, OrchestratorError>;

    async fn get_job_run(&self, job_run_id: Uuid) -> Result<PipelineJobRun, OrchestratorError>;

    /// All attempt records of a run in creation order
    async fn list_job_runs(&self, run_id: Uuid) -> Result<Vec<PipelineJobRun>, OrchestratorError>;

    /// Move a job run to `to` if its status is in `from` and its run still
    /// allows it (see [`job_run_transition_allowed`]).
    async fn transition_job_run(
        &self,
        job_run_id: Uuid,
        from: &[JobRunStatus],
        to: JobRunStatus,
        error_message: Option<String>,
    ) -> Result<Option<PipelineJobRun>, OrchestratorError>;
}

/// Whether a job run may move to `to` while its run is in `run_status`.
///
/// Only a running run makes progress. Pending runs hold their attempt-0
/// records; terminal runs only accept settling job runs to match them.
pub fn job_run_transition_allowed(run_status: RunStatus, to: JobRunStatus) -> bool {
    match run_status {
        RunStatus::Running => true,
        RunStatus::Pending | RunStatus::Failed => {
            matches!(to, JobRunStatus::Cancelled | JobRunStatus::Failed)
        }
        RunStatus::Cancelled => to == JobRunStatus::Cancelled,
        RunStatus::Succeeded => false,
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    runs: HashMap<Uuid, PipelineRun>,
    run_order: Vec<Uuid>,
    job_runs: HashMap<Uuid, PipelineJobRun>,
    job_runs_by_run: HashMap<Uuid, Vec<Uuid>>,
}

/// In-process [`RunStore`]
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    state: RwLock<MemoryState>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryState>, OrchestratorError> {
        self.state
            .read()
            .map_err(|_| OrchestratorError::storage("run store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryState>, OrchestratorError> {
        self.state
            .write()
            .map_err(|_| OrchestratorError::storage("run store lock poisoned"))
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn create_run(&self, run: PipelineRun) -> Result<PipelineRun, OrchestratorError> {
        let mut state = self.write()?;
        if state.runs.contains_key(&run.id) {
            return Err(OrchestratorError::conflict(format!("run {} already exists", run.id)));
        }
        state.run_order.push(run.id);
        state.job_runs_by_run.entry(run.id).or_default();
        state.runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn get_run(&self, run_id: Uuid) -> Result<PipelineRun, OrchestratorError> {
        self.read()?
            .runs
            .get(&run_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::not_found(format!("run {} not found", run_id)))
    }

    async fn list_runs(
        &self,
        filter: &RunFilter,
    ) -> Result<(Vec<PipelineRun>, usize), OrchestratorError> {
        let state = self.read()?;
        let matching: Vec<&PipelineRun> = state
            .run_order
            .iter()
            .rev()
            .filter_map(|id| state.runs.get(id))
            .filter(|run| filter.matches(run))
            .collect();

        let total = matching.len();
        let page = matching
            .into_iter()
            .skip(filter.page.offset)
            .take(filter.page.effective_limit())
            .cloned()
            .collect();

        Ok((page, total))
    }

    async fn transition_run(
        &self,
        run_id: Uuid,
        from: &[RunStatus],
        to: RunStatus,
        error_message: Option<String>,
    ) -> Result<Option<PipelineRun>, OrchestratorError> {
        let mut state = self.write()?;
        let run = state
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| OrchestratorError::not_found(format!("run {} not found", run_id)))?;

        if !from.contains(&run.status) {
            return Ok(None);
        }

        let now = Utc::now();
        run.status = to;
        if to == RunStatus::Running && run.started_at.is_none() {
            run.started_at = Some(now);
        }
        if to.is_terminal() && run.finished_at.is_none() {
            run.finished_at = Some(now);
        }
        if error_message.is_some() {
            run.error_message = error_message;
        }

        Ok(Some(run.clone()))
    }

    async fn create_job_run(
        &self,
        job_run: PipelineJobRun,
    ) -> Result<PipelineJobRun, OrchestratorError> {
        let mut state = self.write()?;
        let run = state.runs.get(&job_run.run_id).ok_or_else(|| {
            OrchestratorError::not_found(format!("run {} not found", job_run.run_id))
        })?;
        if run.is_terminal() {
            return Err(OrchestratorError::conflict(format!(
                "run {} is {}",
                run.id, run.status
            )));
        }
        state
            .job_runs_by_run
            .entry(job_run.run_id)
            .or_default()
            .push(job_run.id);
        state.job_runs.insert(job_run.id, job_run.clone());
        Ok(job_run)
    }

    async fn get_job_run(&self, job_run_id: Uuid) -> Result<PipelineJobRun, OrchestratorError> {
        self.read()?
            .job_runs
            .get(&job_run_id)
            .cloned()
            .ok_or_else(|| {
                OrchestratorError::not_found(format!("job run {} not found", job_run_id))
            })
    }

    async fn list_job_runs(&self, run_id: Uuid) -> Result<Vec<PipelineJobRun>, OrchestratorError> {
        let state = self.read()?;
        let ids = state
            .job_runs_by_run
            .get(&run_id)
            .ok_or_else(|| OrchestratorError::not_found(format!("run {} not found", run_id)))?;

        Ok(ids
            .iter()
            .filter_map(|id| state.job_runs.get(id))
            .cloned()
            .collect())
    }

    async fn transition_job_run(
        &self,
        job_run_id: Uuid,
        from: &[JobRunStatus],
        to: JobRunStatus,
        error_message: Option<String>,
    ) -> Result<Option<PipelineJobRun>, OrchestratorError> {
        let mut state = self.write()?;
        let run_id = state
            .job_runs
            .get(&job_run_id)
            .map(|jr| jr.run_id)
            .ok_or_else(|| {
                OrchestratorError::not_found(format!("job run {} not found", job_run_id))
            })?;
        let run_status = state
            .runs
            .get(&run_id)
            .map(|run| run.status)
            .ok_or_else(|| OrchestratorError::not_found(format!("run {} not found", run_id)))?;

        let Some(job_run) = state.job_runs.get_mut(&job_run_id) else {
            return Err(OrchestratorError::not_found(format!(
                "job run {} not found",
                job_run_id
            )));
        };
        if !from.contains(&job_run.status) || !job_run_transition_allowed(run_status, to) {
            return Ok(None);
        }

        let now = Utc::now();
        job_run.status = to;
        if to == JobRunStatus::Running && job_run.started_at.is_none() {
            job_run.started_at = Some(now);
        }
        if to.is_terminal() && job_run.finished_at.is_none() {
            job_run.finished_at = Some(now);
        }
        if error_message.is_some() {
            job_run.error_message = error_message;
        }

        Ok(Some(job_run.clone()))
    }
}
