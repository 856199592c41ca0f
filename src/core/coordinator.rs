//! Run lifecycle: trigger, drive, cancel.
//!
//! The coordinator is the only component that changes a run's status. Each
//! triggered run gets a driver task that dispatches jobs as their
//! dependencies settle, plus a supervisor that turns a driver panic into a
//! failed run. Status changes go through the store's compare-and-set, so a
//! cancellation racing a completion always has exactly one winner.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::admission::{AdmissionSlot, RunAdmission};
use super::event_log::{EventLog, EventLogWriter};
use super::executor::{panic_message, JobContext, JobExecutor, JobOutcome, RetryBackoff};
use super::registry::PipelineRegistry;
use super::resolver::resolve_execution_order;
use super::store::RunStore;
use crate::adapters::ExecutionAdapter;
use crate::domain::{
    validate_parameters, EventType, JobRunStatus, OrchestratorError, PageRequest, Pipeline,
    PipelineJob, PipelineJobRun, PipelineRun, RunEvent, RunFilter, RunStatus, TriggerType,
};

/// Handles kept for a run until its driver finishes
struct ActiveRun {
    cancel: CancellationToken,
    slot: Mutex<Option<AdmissionSlot>>,
    finished: watch::Sender<bool>,
}

impl ActiveRun {
    fn release_slot(&self) {
        let slot = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(slot) = slot {
            slot.release();
        }
    }
}

/// Snapshot of a pipeline's jobs taken at trigger time
struct RunPlan {
    pipeline_name: String,
    order: Vec<String>,
    jobs: HashMap<String, PipelineJob>,
    dependents: HashMap<String, Vec<String>>,
    first_attempts: HashMap<String, PipelineJobRun>,
}

impl RunPlan {
    fn new(pipeline_name: &str, order: Vec<String>, jobs: Vec<PipelineJob>) -> Self {
        let jobs: HashMap<String, PipelineJob> =
            jobs.into_iter().map(|j| (j.name.clone(), j)).collect();

        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for name in &order {
            let Some(job) = jobs.get(name) else { continue };
            let mut seen = HashSet::new();
            for dep in &job.depends_on {
                if seen.insert(dep.as_str()) {
                    dependents.entry(dep.clone()).or_default().push(name.clone());
                }
            }
        }

        Self {
            pipeline_name: pipeline_name.to_string(),
            order,
            jobs,
            dependents,
            first_attempts: HashMap::new(),
        }
    }

    fn roots(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|name| {
                self.jobs
                    .get(name.as_str())
                    .map(|j| j.depends_on.is_empty())
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }
}

#[derive(Default)]
struct Progress {
    dispatched: HashSet<String>,
    settled: HashMap<String, JobRunStatus>,
}

/// Owns run state transitions for all pipelines
#[derive(Clone)]
pub struct RunCoordinator {
    registry: Arc<PipelineRegistry>,
    store: Arc<dyn RunStore>,
    admission: Arc<RunAdmission>,
    executor: Arc<JobExecutor>,
    event_log: Option<EventLogWriter>,
    active: Arc<Mutex<HashMap<Uuid, Arc<ActiveRun>>>>,
}

impl RunCoordinator {
    pub fn new(
        registry: Arc<PipelineRegistry>,
        store: Arc<dyn RunStore>,
        adapter: Arc<dyn ExecutionAdapter>,
    ) -> Self {
        let executor = JobExecutor::new(adapter, store.clone(), RetryBackoff::default());
        Self {
            registry,
            store,
            admission: Arc::new(RunAdmission::new()),
            executor: Arc::new(executor),
            event_log: None,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Replace the retry backoff used for failed attempts
    pub fn with_backoff(mut self, backoff: RetryBackoff) -> Self {
        self.executor = Arc::new(JobExecutor::new(
            self.executor.adapter(),
            self.store.clone(),
            backoff,
        ));
        self
    }

    /// Append every transition to `event_log`.
    ///
    /// Starts the log's writer task, so this must be called from within a
    /// Tokio runtime.
    pub fn with_event_log(mut self, event_log: EventLog) -> Self {
        self.event_log = Some(EventLogWriter::spawn(event_log));
        self
    }

    pub fn registry(&self) -> &PipelineRegistry {
        &self.registry
    }

    pub fn admission(&self) -> &RunAdmission {
        &self.admission
    }

    fn active_runs(&self) -> MutexGuard<'_, HashMap<Uuid, Arc<ActiveRun>>> {
        // Entries are plain handles; a poisoned guard is still consistent
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn active_run(&self, run_id: Uuid) -> Option<Arc<ActiveRun>> {
        self.active_runs().get(&run_id).cloned()
    }

    /// Create a run and start executing it.
    ///
    /// Returns the run in `running` status. Nothing is created when the
    /// pipeline's DAG is invalid or its concurrency limit is reached.
    #[instrument(skip(self, parameters))]
    pub async fn trigger_run(
        &self,
        pipeline_id: Uuid,
        parameters: HashMap<String, String>,
        trigger_type: TriggerType,
        triggered_by: &str,
    ) -> Result<PipelineRun, OrchestratorError> {
        let pipeline = self.registry.get_pipeline(pipeline_id)?;
        if trigger_type == TriggerType::Scheduled && pipeline.is_paused {
            return Err(OrchestratorError::conflict(format!(
                "pipeline {} is paused",
                pipeline.name
            )));
        }

        validate_parameters(&parameters)?;

        let jobs = self.registry.list_jobs(pipeline.id)?;
        if jobs.is_empty() {
            return Err(OrchestratorError::validation(format!(
                "pipeline {} has no jobs",
                pipeline.name
            )));
        }
        let execution_plan = resolve_execution_order(&jobs)?;
        let mut plan = RunPlan::new(
            &pipeline.name,
            execution_plan.job_names().map(str::to_string).collect(),
            jobs,
        );

        let pending = PipelineRun::new(pipeline.id, trigger_type, triggered_by, parameters);
        let ((run, first_attempts), slot) = self
            .admission
            .admit(&pipeline, || self.create_run_records(pending, &plan))
            .await?;
        plan.first_attempts = first_attempts;

        let (finished, _) = watch::channel(false);
        let active = Arc::new(ActiveRun {
            cancel: CancellationToken::new(),
            slot: Mutex::new(Some(slot)),
            finished,
        });
        self.active_runs().insert(run.id, active.clone());

        self.record_event(RunEvent::run(
            run.id,
            EventType::RunCreated,
            format!(
                "Run of '{}' triggered by {} ({} jobs)",
                pipeline.name,
                run.triggered_by,
                plan.order.len()
            ),
        ));

        let started = match self
            .store
            .transition_run(run.id, &[RunStatus::Pending], RunStatus::Running, None)
            .await
        {
            Ok(Some(started)) => started,
            Ok(None) => {
                // Cancelled between creation and start
                self.retire(run.id, &active).await;
                return self.store.get_run(run.id).await;
            }
            Err(e) => {
                self.finish_run(run.id, RunStatus::Failed, Some(e.to_string()))
                    .await;
                self.retire(run.id, &active).await;
                return Err(e);
            }
        };

        self.record_event(RunEvent::run(
            run.id,
            EventType::RunStarted,
            format!("Run of '{}' started", pipeline.name),
        ));
        info!(run_id = %run.id, pipeline = %pipeline.name, "Run started");

        let parameters = Arc::new(started.parameters.clone());
        tokio::spawn(self.clone().supervise(pipeline, plan, run.id, parameters, active));

        Ok(started)
    }

    /// Create the run and its attempt-0 job runs
    async fn create_run_records(
        &self,
        run: PipelineRun,
        plan: &RunPlan,
    ) -> Result<(PipelineRun, HashMap<String, PipelineJobRun>), OrchestratorError> {
        let run = self.store.create_run(run).await?;

        let mut first_attempts = HashMap::new();
        for name in &plan.order {
            let Some(job) = plan.jobs.get(name) else { continue };
            match self
                .store
                .create_job_run(PipelineJobRun::new(run.id, job.id, &job.name, 0))
                .await
            {
                Ok(job_run) => {
                    first_attempts.insert(name.clone(), job_run);
                }
                Err(e) => {
                    error!(run_id = %run.id, job = %name, error = %e, "Failed to create job run");
                    if let Err(fail_err) = self
                        .store
                        .transition_run(
                            run.id,
                            &RunStatus::ACTIVE,
                            RunStatus::Failed,
                            Some(format!("failed to create job runs: {}", e)),
                        )
                        .await
                    {
                        error!(run_id = %run.id, error = %fail_err, "Failed to mark run failed");
                    }
                    self.sweep_unfinished(run.id, JobRunStatus::Failed).await;
                    return Err(e);
                }
            }
        }

        Ok((run, first_attempts))
    }

    /// Cancel a run. Cancelling a finished run returns it unchanged.
    #[instrument(skip(self))]
    pub async fn cancel_run(
        &self,
        run_id: Uuid,
        cancelled_by: &str,
    ) -> Result<PipelineRun, OrchestratorError> {
        let run = self.store.get_run(run_id).await?;
        if !run.is_active() {
            debug!(status = %run.status, "Run already finished");
            return Ok(run);
        }

        let cancelled = match self
            .store
            .transition_run(
                run_id,
                &RunStatus::ACTIVE,
                RunStatus::Cancelled,
                Some(format!("cancelled by {}", cancelled_by)),
            )
            .await?
        {
            Some(run) => run,
            // Settled concurrently
            None => return self.store.get_run(run_id).await,
        };

        // Stop in-flight work before anything else can await
        if let Some(active) = self.active_run(run_id) {
            active.cancel.cancel();
            active.release_slot();
        }

        for job_run in self.store.list_job_runs(run_id).await? {
            if job_run.status != JobRunStatus::Pending {
                continue;
            }
            let swept = self
                .store
                .transition_job_run(
                    job_run.id,
                    &[JobRunStatus::Pending],
                    JobRunStatus::Cancelled,
                    Some("run was cancelled".to_string()),
                )
                .await?;
            if swept.is_some() {
                self.record_event(RunEvent::job(
                    run_id,
                    &job_run.job_name,
                    job_run.retry_attempt,
                    EventType::JobCancelled,
                    format!("Job '{}' cancelled before it started", job_run.job_name),
                ));
            }
        }

        self.record_event(RunEvent::run(
            run_id,
            EventType::RunCancelled,
            format!("Run cancelled by {}", cancelled_by),
        ));
        self.flush_events().await;

        Ok(cancelled)
    }

    pub async fn get_run(&self, run_id: Uuid) -> Result<PipelineRun, OrchestratorError> {
        self.store.get_run(run_id).await
    }

    /// Runs of a pipeline, newest first, with the total before pagination
    pub async fn list_runs(
        &self,
        pipeline_id: Uuid,
        status: Option<RunStatus>,
        page: PageRequest,
    ) -> Result<(Vec<PipelineRun>, usize), OrchestratorError> {
        self.registry.get_pipeline(pipeline_id)?;

        let filter = RunFilter {
            pipeline_id: Some(pipeline_id),
            status,
            page,
        };
        self.store.list_runs(&filter).await
    }

    /// Every attempt record of a run in creation order
    pub async fn list_job_runs(
        &self,
        run_id: Uuid,
    ) -> Result<Vec<PipelineJobRun>, OrchestratorError> {
        self.store.get_run(run_id).await?;
        self.store.list_job_runs(run_id).await
    }

    /// Wait until the run's driver has finished, then return the run
    pub async fn wait_for_run(&self, run_id: Uuid) -> Result<PipelineRun, OrchestratorError> {
        let finished = self.active_run(run_id).map(|active| active.finished.subscribe());
        if let Some(mut finished) = finished {
            // An error means the sender is gone, which only happens once the
            // run has been retired
            let _ = finished.wait_for(|done| *done).await;
        }
        self.store.get_run(run_id).await
    }

    async fn supervise(
        self,
        pipeline: Pipeline,
        plan: RunPlan,
        run_id: Uuid,
        parameters: Arc<HashMap<String, String>>,
        active: Arc<ActiveRun>,
    ) {
        let driver = tokio::spawn(self.clone().drive(
            plan,
            run_id,
            parameters,
            active.cancel.clone(),
        ));

        if let Err(join_err) = driver.await {
            let reason = if join_err.is_panic() {
                panic_message(join_err.into_panic())
            } else {
                join_err.to_string()
            };
            error!(%run_id, pipeline = %pipeline.name, error = %reason, "Run driver panicked");

            active.cancel.cancel();
            self.finish_run(
                run_id,
                RunStatus::Failed,
                Some(format!("run driver panicked: {}", reason)),
            )
            .await;
            self.sweep_unfinished(run_id, JobRunStatus::Failed).await;
        }

        self.retire(run_id, &active).await;
    }

    #[instrument(skip_all, fields(run_id = %run_id, pipeline = %plan.pipeline_name))]
    async fn drive(
        self,
        plan: RunPlan,
        run_id: Uuid,
        parameters: Arc<HashMap<String, String>>,
        cancel: CancellationToken,
    ) {
        let (events, mut received) = mpsc::unbounded_channel();
        let ctx = JobContext {
            run_id,
            parameters,
            cancel: cancel.clone(),
            events,
        };

        let mut progress = Progress::default();
        let mut in_flight: JoinSet<JobOutcome> = JoinSet::new();

        if !cancel.is_cancelled() {
            for name in plan.roots() {
                self.dispatch(&mut in_flight, &plan, &name, &mut progress, &ctx);
            }
        }

        let mut cancel_seen = cancel.is_cancelled();
        while !in_flight.is_empty() {
            tokio::select! {
                Some(event) = received.recv() => self.record_event(event),
                Some(joined) = in_flight.join_next() => {
                    let outcome = match joined {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            error!(error = %e, "Job task failed");
                            continue;
                        }
                    };
                    debug!(job = %outcome.job_name, status = %outcome.status, "Job settled");
                    progress
                        .settled
                        .insert(outcome.job_name.clone(), outcome.status);

                    if !cancel.is_cancelled() {
                        self.advance(&plan, &outcome.job_name, &mut progress, &mut in_flight, &ctx)
                            .await;
                    }
                }
                _ = cancel.cancelled(), if !cancel_seen => {
                    cancel_seen = true;
                    info!(in_flight = in_flight.len(), "Run cancelled, waiting for running jobs");
                }
            }
        }

        // Every job task is done, so ours is the last sender
        drop(ctx);
        while let Some(event) = received.recv().await {
            self.record_event(event);
        }

        if cancel.is_cancelled() {
            self.sweep_unfinished(run_id, JobRunStatus::Cancelled).await;
            self.finish_run(run_id, RunStatus::Cancelled, Some("run was cancelled".to_string()))
                .await;
            return;
        }

        self.sweep_unfinished(run_id, JobRunStatus::Failed).await;

        let all_succeeded = plan.order.iter().all(|name| {
            progress.settled.get(name.as_str()) == Some(&JobRunStatus::Succeeded)
        });
        if all_succeeded {
            self.finish_run(run_id, RunStatus::Succeeded, None).await;
            return;
        }

        let failed: Vec<&str> = plan
            .order
            .iter()
            .filter(|name| progress.settled.get(name.as_str()) == Some(&JobRunStatus::Failed))
            .map(String::as_str)
            .collect();
        let message = if failed.is_empty() {
            "one or more jobs did not succeed".to_string()
        } else {
            format!("one or more jobs failed: {}", failed.join(", "))
        };
        self.finish_run(run_id, RunStatus::Failed, Some(message)).await;
    }

    fn dispatch(
        &self,
        in_flight: &mut JoinSet<JobOutcome>,
        plan: &RunPlan,
        name: &str,
        progress: &mut Progress,
        ctx: &JobContext,
    ) {
        let (Some(job), Some(first_attempt)) =
            (plan.jobs.get(name), plan.first_attempts.get(name))
        else {
            warn!(job = %name, "No attempt record for job, not dispatching");
            return;
        };
        if !progress.dispatched.insert(name.to_string()) {
            return;
        }

        let executor = self.executor.clone();
        let job = job.clone();
        let first_attempt = first_attempt.clone();
        let ctx = ctx.clone();

        in_flight.spawn(async move {
            let job_name = job.name.clone();
            let task =
                tokio::spawn(async move { executor.execute(&job, first_attempt, &ctx).await });
            match task.await {
                Ok(outcome) => outcome,
                Err(e) => JobOutcome::failed(job_name, format!("job task failed: {}", e)),
            }
        });
    }

    /// Dispatch or skip the dependents of a job that just settled
    async fn advance(
        &self,
        plan: &RunPlan,
        settled_job: &str,
        progress: &mut Progress,
        in_flight: &mut JoinSet<JobOutcome>,
        ctx: &JobContext,
    ) {
        let mut queue = VecDeque::from([settled_job.to_string()]);

        while let Some(name) = queue.pop_front() {
            let Some(dependents) = plan.dependents.get(&name) else { continue };

            for dependent in dependents {
                if progress.dispatched.contains(dependent)
                    || progress.settled.contains_key(dependent)
                {
                    continue;
                }
                let Some(job) = plan.jobs.get(dependent) else { continue };

                let mut blocked_by = None;
                let mut ready = true;
                for dep in &job.depends_on {
                    match progress.settled.get(dep) {
                        None => {
                            ready = false;
                            break;
                        }
                        Some(JobRunStatus::Succeeded) => {}
                        Some(_) => {
                            blocked_by.get_or_insert(dep.as_str());
                        }
                    }
                }
                if !ready {
                    continue;
                }

                match blocked_by {
                    None => self.dispatch(in_flight, plan, dependent, progress, ctx),
                    Some(dep) => {
                        let reason = format!("dependency '{}' did not succeed", dep);
                        if let Some(job_run) = plan.first_attempts.get(dependent) {
                            self.executor.skip(job_run, &reason, ctx).await;
                        }
                        info!(job = %dependent, %reason, "Job skipped");
                        progress
                            .settled
                            .insert(dependent.clone(), JobRunStatus::Skipped);
                        queue.push_back(dependent.clone());
                    }
                }
            }
        }
    }

    /// Settle job runs left pending or running once the driver is done
    async fn sweep_unfinished(&self, run_id: Uuid, to: JobRunStatus) {
        let job_runs = match self.store.list_job_runs(run_id).await {
            Ok(job_runs) => job_runs,
            Err(e) => {
                warn!(%run_id, error = %e, "Failed to list job runs for sweep");
                return;
            }
        };

        let reason = if to == JobRunStatus::Cancelled {
            "run was cancelled"
        } else {
            "run finished before the job completed"
        };
        for job_run in job_runs.iter().filter(|jr| !jr.status.is_terminal()) {
            if let Err(e) = self
                .store
                .transition_job_run(
                    job_run.id,
                    &[JobRunStatus::Pending, JobRunStatus::Running],
                    to,
                    Some(reason.to_string()),
                )
                .await
            {
                warn!(job = %job_run.job_name, error = %e, "Failed to settle job run");
            }
        }
    }

    /// Terminal CAS from pending or running; releases the slot on success
    async fn finish_run(&self, run_id: Uuid, to: RunStatus, error_message: Option<String>) {
        let finished = match self
            .store
            .transition_run(run_id, &RunStatus::ACTIVE, to, error_message.clone())
            .await
        {
            Ok(finished) => finished,
            Err(e) => {
                error!(%run_id, error = %e, "Failed to record run outcome");
                return;
            }
        };

        let Some(run) = finished else {
            debug!(%run_id, status = %to, "Run already settled");
            return;
        };

        if let Some(active) = self.active_run(run_id) {
            active.release_slot();
        }

        let event_type = match to {
            RunStatus::Succeeded => EventType::RunSucceeded,
            RunStatus::Cancelled => EventType::RunCancelled,
            _ => EventType::RunFailed,
        };
        let duration_ms = match (run.started_at, run.finished_at) {
            (Some(start), Some(end)) => (end - start).num_milliseconds().max(0) as u64,
            _ => 0,
        };

        let mut event = RunEvent::run(run_id, event_type, format!("Run {}", to))
            .with_duration(duration_ms);
        if let Some(message) = error_message {
            event = event.with_error(message);
        }
        self.record_event(event);
    }

    /// Drop the run's handles and wake waiters once its events are written
    async fn retire(&self, run_id: Uuid, active: &ActiveRun) {
        active.release_slot();
        self.flush_events().await;
        self.active_runs().remove(&run_id);
        active.finished.send_replace(true);
    }

    async fn flush_events(&self) {
        if let Some(log) = &self.event_log {
            log.flush().await;
        }
    }

    /// Log a transition and queue it for the event log
    fn record_event(&self, event: RunEvent) {
        match event.event_type {
            EventType::RunFailed | EventType::JobFailed => error!(
                run_id = %event.run_id,
                job = event.job_name.as_deref().unwrap_or("-"),
                error = event.error.as_deref().unwrap_or(""),
                "{}",
                event.summary
            ),
            EventType::JobRetrying | EventType::RunCancelled | EventType::JobCancelled => warn!(
                run_id = %event.run_id,
                job = event.job_name.as_deref().unwrap_or("-"),
                "{}",
                event.summary
            ),
            _ => info!(
                run_id = %event.run_id,
                job = event.job_name.as_deref().unwrap_or("-"),
                "{}",
                event.summary
            ),
        }

        if let Some(log) = &self.event_log {
            log.append(event);
        }
    }
}
