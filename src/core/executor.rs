//! Execution of a single job within a run.
//!
//! [`JobExecutor`] owns the life of one job: every attempt gets its own
//! [`PipelineJobRun`] record, a child cancellation token, and an optional
//! deadline. The adapter call runs on its own task so a panicking adapter
//! fails the attempt instead of the run.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::store::RunStore;
use crate::adapters::{ExecutionAdapter, ExecutionOutput, ExecutionRequest};
use crate::domain::{
    EventType, ExecutionError, JobRunStatus, OrchestratorError, PipelineJob, PipelineJobRun,
    RunEvent,
};

/// Delay between failed attempts of the same job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryBackoff {
    /// Delay before the first retry in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Upper bound for any single delay in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_initial_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    30000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryBackoff {
    /// Retry without waiting
    pub fn immediate() -> Self {
        Self {
            initial_delay_ms: 0,
            max_delay_ms: 0,
            backoff_multiplier: 1.0,
        }
    }

    /// Delay before retry number `retry` (1-indexed)
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry <= 1 {
            return Duration::from_millis(self.initial_delay_ms.min(self.max_delay_ms));
        }

        let delay =
            self.initial_delay_ms as f64 * self.backoff_multiplier.powi((retry - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }
}

/// Run-scoped state shared by every job of a run
#[derive(Debug, Clone)]
pub struct JobContext {
    pub run_id: Uuid,
    pub parameters: Arc<HashMap<String, String>>,

    /// Fired when the run is cancelled
    pub cancel: CancellationToken,

    /// Transition events, drained by the coordinator
    pub events: mpsc::UnboundedSender<RunEvent>,
}

impl JobContext {
    fn emit(&self, event: RunEvent) {
        // The receiver only goes away once the run is finished
        let _ = self.events.send(event);
    }
}

/// Final state of a job after all of its attempts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub job_name: String,
    pub status: JobRunStatus,

    /// Attempts that reached the adapter or were created for it
    pub attempts: u32,

    /// Error of the last failed attempt
    pub error: Option<String>,
}

impl JobOutcome {
    fn new(job_name: &str, status: JobRunStatus, attempts: u32, error: Option<String>) -> Self {
        Self {
            job_name: job_name.to_string(),
            status,
            attempts,
            error,
        }
    }

    /// Outcome for a job whose execution task died
    pub fn failed(job_name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            job_name: job_name.into(),
            status: JobRunStatus::Failed,
            attempts: 0,
            error: Some(error.into()),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == JobRunStatus::Succeeded
    }
}

enum Attempt {
    Succeeded,
    Failed { message: String, duration_ms: u64 },
    Cancelled,
}

enum Interrupted {
    Cancelled,
    Failed(ExecutionError),
}

/// Runs job attempts through an [`ExecutionAdapter`]
pub struct JobExecutor {
    adapter: Arc<dyn ExecutionAdapter>,
    store: Arc<dyn RunStore>,
    backoff: RetryBackoff,
}

impl JobExecutor {
    pub fn new(
        adapter: Arc<dyn ExecutionAdapter>,
        store: Arc<dyn RunStore>,
        backoff: RetryBackoff,
    ) -> Self {
        Self {
            adapter,
            store,
            backoff,
        }
    }

    pub fn adapter(&self) -> Arc<dyn ExecutionAdapter> {
        self.adapter.clone()
    }

    /// Execute `job` starting from its pending attempt-0 record.
    ///
    /// Failed attempts are retried up to `retry_count` times, each with a
    /// fresh record. Returns once the job is succeeded, failed or cancelled.
    #[instrument(skip_all, fields(run_id = %ctx.run_id, job = %job.name))]
    pub async fn execute(
        &self,
        job: &PipelineJob,
        first_attempt: PipelineJobRun,
        ctx: &JobContext,
    ) -> JobOutcome {
        let mut job_run = first_attempt;
        let mut last_error: Option<String> = None;

        loop {
            let attempt = job_run.retry_attempt;

            match self.run_attempt(job, &job_run, ctx).await {
                Attempt::Succeeded => {
                    return JobOutcome::new(&job.name, JobRunStatus::Succeeded, attempt + 1, None);
                }
                Attempt::Cancelled => {
                    return JobOutcome::new(
                        &job.name,
                        JobRunStatus::Cancelled,
                        attempt + 1,
                        last_error,
                    );
                }
                Attempt::Failed {
                    message,
                    duration_ms,
                } => {
                    if attempt >= job.retry_count {
                        ctx.emit(
                            RunEvent::job(
                                ctx.run_id,
                                &job.name,
                                attempt,
                                EventType::JobFailed,
                                format!(
                                    "Job '{}' failed after {} attempts",
                                    job.name,
                                    attempt + 1
                                ),
                            )
                            .with_duration(duration_ms)
                            .with_error(message.clone()),
                        );
                        error!(attempt, error = %message, "Job failed permanently");

                        return JobOutcome::new(
                            &job.name,
                            JobRunStatus::Failed,
                            attempt + 1,
                            Some(message),
                        );
                    }

                    let retry = attempt + 1;
                    let delay = self.backoff.delay_for_retry(retry);

                    ctx.emit(
                        RunEvent::job(
                            ctx.run_id,
                            &job.name,
                            attempt,
                            EventType::JobRetrying,
                            format!("Job '{}' failed, retrying in {:?}", job.name, delay),
                        )
                        .with_duration(duration_ms)
                        .with_error(message.clone()),
                    );
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "Job failed, retrying"
                    );
                    last_error = Some(message);

                    if !delay.is_zero() {
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = ctx.cancel.cancelled() => {}
                        }
                    }
                    if ctx.cancel.is_cancelled() {
                        debug!("Run cancelled during retry backoff");
                        return JobOutcome::new(
                            &job.name,
                            JobRunStatus::Cancelled,
                            retry,
                            last_error,
                        );
                    }

                    let next = PipelineJobRun::new(ctx.run_id, job.id, &job.name, retry);
                    job_run = match self.store.create_job_run(next).await {
                        Ok(job_run) => job_run,
                        // The run settled while this attempt was failing
                        Err(OrchestratorError::Conflict(reason)) => {
                            debug!(%reason, "Not recording retry attempt");
                            return JobOutcome::new(
                                &job.name,
                                JobRunStatus::Cancelled,
                                retry,
                                last_error,
                            );
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to record retry attempt");
                            return JobOutcome::new(
                                &job.name,
                                JobRunStatus::Failed,
                                retry,
                                Some(e.to_string()),
                            );
                        }
                    };
                }
            }
        }
    }

    /// Mark a pending job run as skipped. Returns false if it was no longer
    /// pending.
    pub async fn skip(&self, job_run: &PipelineJobRun, reason: &str, ctx: &JobContext) -> bool {
        match self
            .store
            .transition_job_run(
                job_run.id,
                &[JobRunStatus::Pending],
                JobRunStatus::Skipped,
                Some(reason.to_string()),
            )
            .await
        {
            Ok(Some(_)) => {
                ctx.emit(RunEvent::job(
                    ctx.run_id,
                    &job_run.job_name,
                    job_run.retry_attempt,
                    EventType::JobSkipped,
                    reason,
                ));
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(job = %job_run.job_name, error = %e, "Failed to mark job skipped");
                false
            }
        }
    }

    async fn run_attempt(
        &self,
        job: &PipelineJob,
        job_run: &PipelineJobRun,
        ctx: &JobContext,
    ) -> Attempt {
        let attempt = job_run.retry_attempt;

        // A record swept by cancellation is no longer pending, and the store
        // refuses the claim once the run itself is no longer running
        match self
            .store
            .transition_job_run(job_run.id, &[JobRunStatus::Pending], JobRunStatus::Running, None)
            .await
        {
            Ok(Some(_)) => {}
            Ok(None) => return Attempt::Cancelled,
            Err(e) => {
                return Attempt::Failed {
                    message: e.to_string(),
                    duration_ms: 0,
                }
            }
        }

        ctx.emit(RunEvent::job(
            ctx.run_id,
            &job.name,
            attempt,
            EventType::JobStarted,
            format!("Job '{}' attempt {}", job.name, attempt + 1),
        ));
        info!(attempt, notebook = %job.notebook_id, "Job attempt started");

        let started = Instant::now();
        let result = self.invoke(job, attempt, ctx).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(output) => {
                match self
                    .finish_attempt(job_run, JobRunStatus::Succeeded, None)
                    .await
                {
                    Some(_) => {
                        let summary = output.summary.unwrap_or_else(|| {
                            format!("Job '{}' completed in {}ms", job.name, duration_ms)
                        });
                        ctx.emit(
                            RunEvent::job(
                                ctx.run_id,
                                &job.name,
                                attempt,
                                EventType::JobSucceeded,
                                summary,
                            )
                            .with_duration(duration_ms),
                        );
                        info!(attempt, duration_ms, "Job attempt succeeded");
                        Attempt::Succeeded
                    }
                    None => {
                        debug!(attempt, "Ignoring result of a cancelled attempt");
                        Attempt::Cancelled
                    }
                }
            }
            Err(Interrupted::Cancelled) => {
                if self
                    .finish_attempt(
                        job_run,
                        JobRunStatus::Cancelled,
                        Some("run was cancelled".to_string()),
                    )
                    .await
                    .is_some()
                {
                    ctx.emit(
                        RunEvent::job(
                            ctx.run_id,
                            &job.name,
                            attempt,
                            EventType::JobCancelled,
                            format!("Job '{}' cancelled", job.name),
                        )
                        .with_duration(duration_ms),
                    );
                }
                info!(attempt, "Job attempt cancelled");
                Attempt::Cancelled
            }
            Err(Interrupted::Failed(err)) => {
                let message = err.to_string();
                match self
                    .finish_attempt(job_run, JobRunStatus::Failed, Some(message.clone()))
                    .await
                {
                    Some(_) => Attempt::Failed {
                        message,
                        duration_ms,
                    },
                    None => Attempt::Cancelled,
                }
            }
        }
    }

    /// Terminal CAS from running. `None` means the attempt was already
    /// settled elsewhere.
    async fn finish_attempt(
        &self,
        job_run: &PipelineJobRun,
        to: JobRunStatus,
        error_message: Option<String>,
    ) -> Option<PipelineJobRun> {
        match self
            .store
            .transition_job_run(job_run.id, &[JobRunStatus::Running], to, error_message)
            .await
        {
            Ok(updated) => updated,
            Err(e) => {
                error!(job_run_id = %job_run.id, error = %e, "Failed to record attempt result");
                None
            }
        }
    }

    async fn invoke(
        &self,
        job: &PipelineJob,
        attempt: u32,
        ctx: &JobContext,
    ) -> Result<ExecutionOutput, Interrupted> {
        let request = ExecutionRequest {
            run_id: ctx.run_id,
            job_name: job.name.clone(),
            notebook_id: job.notebook_id.clone(),
            compute_endpoint_id: job.compute_endpoint_id.clone(),
            parameters: (*ctx.parameters).clone(),
            attempt,
        };

        let call_token = ctx.cancel.child_token();
        let adapter = self.adapter.clone();
        let adapter_token = call_token.clone();
        let mut handle = tokio::spawn(async move { adapter.execute(&request, adapter_token).await });

        let joined = tokio::select! {
            joined = wait_with_deadline(&mut handle, job.timeout()) => joined,
            _ = ctx.cancel.cancelled() => {
                call_token.cancel();
                handle.abort();
                return Err(Interrupted::Cancelled);
            }
        };

        match joined {
            None => {
                call_token.cancel();
                handle.abort();
                Err(Interrupted::Failed(ExecutionError::Timeout {
                    seconds: job.timeout_seconds.unwrap_or_default(),
                }))
            }
            Some(Ok(Ok(output))) => Ok(output),
            Some(Ok(Err(e))) => Err(Interrupted::Failed(ExecutionError::Adapter(format!(
                "{:#}",
                e
            )))),
            Some(Err(join_err)) if join_err.is_panic() => Err(Interrupted::Failed(
                ExecutionError::Panicked(panic_message(join_err.into_panic())),
            )),
            Some(Err(join_err)) => Err(Interrupted::Failed(ExecutionError::Adapter(
                join_err.to_string(),
            ))),
        }
    }
}

/// `None` when the deadline passed first
async fn wait_with_deadline<T>(
    handle: &mut JoinHandle<T>,
    deadline: Option<Duration>,
) -> Option<Result<T, tokio::task::JoinError>> {
    match deadline {
        Some(limit) => tokio::time::timeout(limit, handle).await.ok(),
        None => Some(handle.await),
    }
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
