//! Pipeline and job definitions.
//!
//! The registry owns every [`Pipeline`] and its [`PipelineJob`]s. Runs take
//! a snapshot of the job list at trigger time, so edits here never reach an
//! in-flight run.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::domain::{
    CreateJobRequest, CreatePipelineRequest, OrchestratorError, PageRequest, Pipeline,
    PipelineDefinition, PipelineJob, UpdatePipelineRequest,
};

#[derive(Debug, Default)]
struct RegistryState {
    pipelines: HashMap<Uuid, Pipeline>,
    jobs: HashMap<Uuid, Vec<PipelineJob>>,
}

impl RegistryState {
    fn pipeline(&self, id: Uuid) -> Result<&Pipeline, OrchestratorError> {
        self.pipelines
            .get(&id)
            .ok_or_else(|| OrchestratorError::not_found(format!("pipeline {} not found", id)))
    }

    fn name_taken(&self, name: &str) -> bool {
        self.pipelines.values().any(|p| p.name == name)
    }
}

/// In-memory store of pipeline definitions
#[derive(Debug, Default)]
pub struct PipelineRegistry {
    state: RwLock<RegistryState>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, RegistryState>, OrchestratorError> {
        self.state
            .read()
            .map_err(|_| OrchestratorError::storage("pipeline registry lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, RegistryState>, OrchestratorError> {
        self.state
            .write()
            .map_err(|_| OrchestratorError::storage("pipeline registry lock poisoned"))
    }

    pub fn create_pipeline(
        &self,
        req: CreatePipelineRequest,
        created_by: &str,
    ) -> Result<Pipeline, OrchestratorError> {
        req.validate()?;

        let mut state = self.write()?;
        if state.name_taken(&req.name) {
            return Err(OrchestratorError::conflict(format!(
                "pipeline {} already exists",
                req.name
            )));
        }

        let now = Utc::now();
        let pipeline = Pipeline {
            id: Uuid::new_v4(),
            concurrency_limit: req.effective_concurrency_limit(),
            name: req.name,
            description: req.description,
            schedule_cron: req.schedule_cron,
            is_paused: req.is_paused,
            created_by: created_by.to_string(),
            created_at: now,
            updated_at: now,
        };

        state.pipelines.insert(pipeline.id, pipeline.clone());
        state.jobs.insert(pipeline.id, Vec::new());
        info!(pipeline = %pipeline.name, id = %pipeline.id, "Pipeline created");

        Ok(pipeline)
    }

    pub fn get_pipeline(&self, id: Uuid) -> Result<Pipeline, OrchestratorError> {
        self.read()?.pipeline(id).cloned()
    }

    pub fn get_pipeline_by_name(&self, name: &str) -> Result<Pipeline, OrchestratorError> {
        self.read()?
            .pipelines
            .values()
            .find(|p| p.name == name)
            .cloned()
            .ok_or_else(|| OrchestratorError::not_found(format!("pipeline {} not found", name)))
    }

    /// Pipelines sorted by name, with the total count before pagination
    pub fn list_pipelines(
        &self,
        page: PageRequest,
    ) -> Result<(Vec<Pipeline>, usize), OrchestratorError> {
        let state = self.read()?;
        let mut all: Vec<&Pipeline> = state.pipelines.values().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));

        let total = all.len();
        let pipelines = all
            .into_iter()
            .skip(page.offset)
            .take(page.effective_limit())
            .cloned()
            .collect();

        Ok((pipelines, total))
    }

    pub fn update_pipeline(
        &self,
        id: Uuid,
        req: UpdatePipelineRequest,
    ) -> Result<Pipeline, OrchestratorError> {
        req.validate()?;

        let mut state = self.write()?;
        let pipeline = state
            .pipelines
            .get_mut(&id)
            .ok_or_else(|| OrchestratorError::not_found(format!("pipeline {} not found", id)))?;

        if let Some(description) = req.description {
            pipeline.description = description;
        }
        if let Some(schedule_cron) = req.schedule_cron {
            pipeline.schedule_cron = schedule_cron;
        }
        if let Some(is_paused) = req.is_paused {
            pipeline.is_paused = is_paused;
        }
        if let Some(limit) = req.concurrency_limit {
            pipeline.concurrency_limit = limit;
        }
        pipeline.updated_at = Utc::now();

        Ok(pipeline.clone())
    }

    /// Remove a pipeline and all of its jobs
    pub fn delete_pipeline(&self, id: Uuid) -> Result<(), OrchestratorError> {
        let mut state = self.write()?;
        let pipeline = state
            .pipelines
            .remove(&id)
            .ok_or_else(|| OrchestratorError::not_found(format!("pipeline {} not found", id)))?;
        state.jobs.remove(&id);
        info!(pipeline = %pipeline.name, "Pipeline deleted");
        Ok(())
    }

    /// Add a job. Dependencies are checked when a run is triggered.
    pub fn create_job(
        &self,
        pipeline_id: Uuid,
        req: CreateJobRequest,
    ) -> Result<PipelineJob, OrchestratorError> {
        req.validate()?;

        let mut state = self.write()?;
        state.pipeline(pipeline_id)?;

        let jobs = state.jobs.entry(pipeline_id).or_default();
        if jobs.iter().any(|j| j.name == req.name) {
            return Err(OrchestratorError::conflict(format!(
                "job {} already exists in pipeline {}",
                req.name, pipeline_id
            )));
        }

        let job = PipelineJob {
            id: Uuid::new_v4(),
            pipeline_id,
            name: req.name,
            notebook_id: req.notebook_id,
            compute_endpoint_id: req.compute_endpoint_id,
            depends_on: req.depends_on,
            timeout_seconds: req.timeout_seconds,
            retry_count: req.retry_count,
            job_order: req.job_order,
            created_at: Utc::now(),
        };
        jobs.push(job.clone());

        Ok(job)
    }

    pub fn get_job(&self, pipeline_id: Uuid, job_id: Uuid) -> Result<PipelineJob, OrchestratorError> {
        let state = self.read()?;
        state.pipeline(pipeline_id)?;
        state
            .jobs
            .get(&pipeline_id)
            .and_then(|jobs| jobs.iter().find(|j| j.id == job_id))
            .cloned()
            .ok_or_else(|| OrchestratorError::not_found(format!("job {} not found", job_id)))
    }

    /// Jobs of a pipeline sorted by `job_order`, then name
    pub fn list_jobs(&self, pipeline_id: Uuid) -> Result<Vec<PipelineJob>, OrchestratorError> {
        let state = self.read()?;
        state.pipeline(pipeline_id)?;

        let mut jobs = state.jobs.get(&pipeline_id).cloned().unwrap_or_default();
        jobs.sort_by(|a, b| a.job_order.cmp(&b.job_order).then_with(|| a.name.cmp(&b.name)));
        Ok(jobs)
    }

    pub fn delete_job(&self, pipeline_id: Uuid, job_id: Uuid) -> Result<(), OrchestratorError> {
        let mut state = self.write()?;
        state.pipeline(pipeline_id)?;

        let jobs = state.jobs.entry(pipeline_id).or_default();
        let before = jobs.len();
        jobs.retain(|j| j.id != job_id);
        if jobs.len() == before {
            return Err(OrchestratorError::not_found(format!("job {} not found", job_id)));
        }
        Ok(())
    }

    /// Register a pipeline and its jobs from a definition file.
    ///
    /// Nothing is kept if any job is rejected.
    pub fn load_definition(
        &self,
        definition: &PipelineDefinition,
        created_by: &str,
    ) -> Result<Pipeline, OrchestratorError> {
        let pipeline = self.create_pipeline(definition.pipeline_request(), created_by)?;

        for job in &definition.jobs {
            if let Err(e) = self.create_job(pipeline.id, job.clone()) {
                self.delete_pipeline(pipeline.id)?;
                return Err(e);
            }
        }

        Ok(pipeline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create(registry: &PipelineRegistry, name: &str) -> Pipeline {
        registry
            .create_pipeline(
                CreatePipelineRequest {
                    name: name.to_string(),
                    ..Default::default()
                },
                "alice",
            )
            .unwrap()
    }

    fn job_req(name: &str, order: i32) -> CreateJobRequest {
        CreateJobRequest {
            name: name.to_string(),
            notebook_id: format!("nb-{}", name),
            job_order: order,
            ..Default::default()
        }
    }

    #[test]
    fn test_create_and_lookup() {
        let registry = PipelineRegistry::new();
        let p = create(&registry, "etl");

        assert_eq!(p.concurrency_limit, 1);
        assert_eq!(p.created_by, "alice");
        assert_eq!(registry.get_pipeline(p.id).unwrap(), p);
        assert_eq!(registry.get_pipeline_by_name("etl").unwrap().id, p.id);
        assert!(matches!(
            registry.get_pipeline_by_name("missing"),
            Err(OrchestratorError::NotFound(_))
        ));
    }

    #[test]
    fn test_duplicate_pipeline_name() {
        let registry = PipelineRegistry::new();
        create(&registry, "etl");

        let err = registry
            .create_pipeline(
                CreatePipelineRequest {
                    name: "etl".to_string(),
                    ..Default::default()
                },
                "bob",
            )
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Conflict(_)));
    }

    #[test]
    fn test_update_pipeline() {
        let registry = PipelineRegistry::new();
        let p = create(&registry, "etl");

        let updated = registry
            .update_pipeline(
                p.id,
                UpdatePipelineRequest {
                    is_paused: Some(true),
                    concurrency_limit: Some(4),
                    schedule_cron: Some(Some("*/5 * * * *".to_string())),
                    ..Default::default()
                },
            )
            .unwrap();

        assert!(updated.is_paused);
        assert_eq!(updated.concurrency_limit, 4);
        assert_eq!(updated.schedule_cron.as_deref(), Some("*/5 * * * *"));
        assert!(updated.updated_at >= p.updated_at);

        let cleared = registry
            .update_pipeline(
                p.id,
                UpdatePipelineRequest {
                    schedule_cron: Some(None),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(cleared.schedule_cron.is_none());
    }

    #[test]
    fn test_jobs_sorted_and_unique() {
        let registry = PipelineRegistry::new();
        let p = create(&registry, "etl");

        registry.create_job(p.id, job_req("load", 2)).unwrap();
        registry.create_job(p.id, job_req("extract", 1)).unwrap();
        registry.create_job(p.id, job_req("audit", 2)).unwrap();

        let names: Vec<String> = registry
            .list_jobs(p.id)
            .unwrap()
            .into_iter()
            .map(|j| j.name)
            .collect();
        assert_eq!(names, vec!["extract", "audit", "load"]);

        let err = registry.create_job(p.id, job_req("load", 0)).unwrap_err();
        assert!(matches!(err, OrchestratorError::Conflict(_)));
    }

    #[test]
    fn test_delete_cascades() {
        let registry = PipelineRegistry::new();
        let p = create(&registry, "etl");
        let job = registry.create_job(p.id, job_req("extract", 0)).unwrap();

        assert_eq!(registry.get_job(p.id, job.id).unwrap().name, "extract");

        registry.delete_pipeline(p.id).unwrap();
        assert!(matches!(registry.list_jobs(p.id), Err(OrchestratorError::NotFound(_))));
        assert!(matches!(registry.delete_pipeline(p.id), Err(OrchestratorError::NotFound(_))));
    }

    #[test]
    fn test_delete_job() {
        let registry = PipelineRegistry::new();
        let p = create(&registry, "etl");
        let job = registry.create_job(p.id, job_req("extract", 0)).unwrap();

        registry.delete_job(p.id, job.id).unwrap();
        assert!(registry.list_jobs(p.id).unwrap().is_empty());
        assert!(matches!(
            registry.delete_job(p.id, job.id),
            Err(OrchestratorError::NotFound(_))
        ));
    }

    #[test]
    fn test_list_pipelines_paginated() {
        let registry = PipelineRegistry::new();
        for name in ["c", "a", "b"] {
            create(&registry, name);
        }

        let (page, total) = registry.list_pipelines(PageRequest::new(1, 1)).unwrap();
        assert_eq!(total, 3);
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].name, "b");
    }

    #[test]
    fn test_load_definition_is_all_or_nothing() {
        let registry = PipelineRegistry::new();
        let definition = PipelineDefinition::from_yaml(
            r#"
name: broken
jobs:
  - name: extract
    notebook_id: nb-extract
  - name: extract
    notebook_id: nb-again
"#,
        )
        .unwrap();

        assert!(registry.load_definition(&definition, "alice").is_err());
        assert!(registry.get_pipeline_by_name("broken").is_err());
    }
}
