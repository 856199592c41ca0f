//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use nbflow::core::{MemoryRunStore, PipelineRegistry, RetryBackoff, RunCoordinator, RunStore};
use nbflow::domain::{
    CreateJobRequest, CreatePipelineRequest, JobRunStatus, OrchestratorError, Pipeline,
    PipelineJobRun, PipelineRun, RunFilter, RunStatus,
};
use nbflow::{ExecutionAdapter, ExecutionOutput, ExecutionRequest};

/// What the scripted adapter does for a notebook
#[derive(Debug, Clone)]
pub enum Behavior {
    Succeed,
    Fail(&'static str),
    /// Fail the first n calls, then succeed
    FailTimes(u32),
    /// Sleep, then succeed; stops early on cancellation
    Sleep(Duration),
    /// Sleep ignoring cancellation, then succeed
    IgnoreCancel(Duration),
    /// Block until cancelled
    Hold,
    Panic,
}

/// Adapter whose result per notebook is fixed up front
#[derive(Default)]
pub struct ScriptedAdapter {
    behaviors: HashMap<String, Behavior>,
    calls: Mutex<Vec<(String, u32)>>,
}

impl ScriptedAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, notebook_id: &str, behavior: Behavior) -> Self {
        self.behaviors.insert(notebook_id.to_string(), behavior);
        self
    }

    /// (notebook_id, attempt) in call order
    pub fn calls(&self) -> Vec<(String, u32)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, notebook_id: &str) -> usize {
        self.calls().iter().filter(|(nb, _)| nb == notebook_id).count()
    }
}

#[async_trait]
impl ExecutionAdapter for ScriptedAdapter {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn execute(
        &self,
        request: &ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutput> {
        let calls_so_far = {
            let mut calls = self.calls.lock().unwrap();
            let previous = calls.iter().filter(|(nb, _)| nb == &request.notebook_id).count();
            calls.push((request.notebook_id.clone(), request.attempt));
            previous as u32
        };

        let behavior = self
            .behaviors
            .get(&request.notebook_id)
            .cloned()
            .unwrap_or(Behavior::Succeed);

        match behavior {
            Behavior::Succeed => Ok(ExecutionOutput::new(format!("ran {}", request.notebook_id))),
            Behavior::Fail(message) => anyhow::bail!("{}", message),
            Behavior::FailTimes(n) if calls_so_far < n => {
                anyhow::bail!("transient failure {}", calls_so_far + 1)
            }
            Behavior::FailTimes(_) => Ok(ExecutionOutput::default()),
            Behavior::Sleep(duration) => {
                tokio::select! {
                    _ = tokio::time::sleep(duration) => Ok(ExecutionOutput::default()),
                    _ = cancel.cancelled() => anyhow::bail!("cancelled"),
                }
            }
            Behavior::IgnoreCancel(duration) => {
                tokio::time::sleep(duration).await;
                Ok(ExecutionOutput::new("late result"))
            }
            Behavior::Hold => {
                cancel.cancelled().await;
                anyhow::bail!("cancelled")
            }
            Behavior::Panic => panic!("notebook {} crashed the executor", request.notebook_id),
        }
    }
}

/// Memory store that answers `list_job_runs` slowly, like a store behind a
/// network hop, and can fail job-run creation
#[derive(Default)]
pub struct SlowStore {
    inner: MemoryRunStore,
    list_delay: Duration,
    /// Fail the nth `create_job_run` call (0-indexed)
    fail_create_at: Option<usize>,
    creates: AtomicUsize,
}

impl SlowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_list_delay(mut self, delay: Duration) -> Self {
        self.list_delay = delay;
        self
    }

    pub fn failing_create_at(mut self, call: usize) -> Self {
        self.fail_create_at = Some(call);
        self
    }
}

#[async_trait]
impl RunStore for SlowStore {
    async fn create_run(&self, run: PipelineRun) -> Result<PipelineRun, OrchestratorError> {
        self.inner.create_run(run).await
    }

    async fn get_run(&self, run_id: Uuid) -> Result<PipelineRun, OrchestratorError> {
        self.inner.get_run(run_id).await
    }

    async fn list_runs(
        &self,
        filter: &RunFilter,
    ) -> Result<(Vec<PipelineRun>, usize), OrchestratorError> {
        self.inner.list_runs(filter).await
    }

    async fn transition_run(
        &self,
        run_id: Uuid,
        from: &[RunStatus],
        to: RunStatus,
        error_message: Option<String>,
    ) -> Result<Option<PipelineRun>, OrchestratorError> {
        self.inner.transition_run(run_id, from, to, error_message).await
    }

    async fn create_job_run(
        &self,
        job_run: PipelineJobRun,
    ) -> Result<PipelineJobRun, OrchestratorError> {
        let call = self.creates.fetch_add(1, Ordering::SeqCst);
        if self.fail_create_at == Some(call) {
            return Err(OrchestratorError::storage("disk full"));
        }
        self.inner.create_job_run(job_run).await
    }

    async fn get_job_run(&self, job_run_id: Uuid) -> Result<PipelineJobRun, OrchestratorError> {
        self.inner.get_job_run(job_run_id).await
    }

    async fn list_job_runs(&self, run_id: Uuid) -> Result<Vec<PipelineJobRun>, OrchestratorError> {
        tokio::time::sleep(self.list_delay).await;
        self.inner.list_job_runs(run_id).await
    }

    async fn transition_job_run(
        &self,
        job_run_id: Uuid,
        from: &[JobRunStatus],
        to: JobRunStatus,
        error_message: Option<String>,
    ) -> Result<Option<PipelineJobRun>, OrchestratorError> {
        self.inner
            .transition_job_run(job_run_id, from, to, error_message)
            .await
    }
}

pub struct Fixture {
    pub coordinator: RunCoordinator,
    pub registry: Arc<PipelineRegistry>,
    pub adapter: Arc<ScriptedAdapter>,
}

pub fn fixture(adapter: ScriptedAdapter) -> Fixture {
    fixture_with_store(adapter, Arc::new(MemoryRunStore::new()))
}

pub fn fixture_with_store(adapter: ScriptedAdapter, store: Arc<dyn RunStore>) -> Fixture {
    let registry = Arc::new(PipelineRegistry::new());
    let adapter = Arc::new(adapter);
    let coordinator = RunCoordinator::new(registry.clone(), store, adapter.clone())
    .with_backoff(RetryBackoff::immediate());

    Fixture {
        coordinator,
        registry,
        adapter,
    }
}

impl Fixture {
    pub fn pipeline(&self, name: &str, concurrency_limit: u32) -> Pipeline {
        self.registry
            .create_pipeline(
                CreatePipelineRequest {
                    name: name.to_string(),
                    concurrency_limit: Some(concurrency_limit),
                    ..Default::default()
                },
                "alice",
            )
            .unwrap()
    }

    /// Add a job whose notebook id is `nb-<name>`
    pub fn job(&self, pipeline_id: Uuid, name: &str, depends_on: &[&str], retry_count: u32) {
        self.registry
            .create_job(
                pipeline_id,
                CreateJobRequest {
                    name: name.to_string(),
                    notebook_id: format!("nb-{}", name),
                    depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
                    retry_count,
                    ..Default::default()
                },
            )
            .unwrap();
    }
}

/// Poll `check` until it returns true or five seconds pass
pub async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 5s");
}
