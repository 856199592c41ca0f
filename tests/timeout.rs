//! Timeout Integration Tests
//!
//! Tests for per-job deadlines.

mod common;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use common::{fixture, Behavior, ScriptedAdapter};
use nbflow::domain::{CreateJobRequest, JobRunStatus, PipelineDefinition, RunStatus, TriggerType};

#[test]
fn test_job_timeout_configuration() {
    let yaml = r#"
name: timeout_test
description: Test pipeline with timeouts

jobs:
  - name: fast_job
    notebook_id: nb-fast
    timeout_seconds: 2

  - name: unbounded_job
    notebook_id: nb-slow
    depends_on: [fast_job]
"#;

    let definition = PipelineDefinition::from_yaml(yaml).unwrap();
    assert_eq!(definition.jobs[0].timeout_seconds, Some(2));
    assert_eq!(definition.jobs[1].timeout_seconds, None);
}

#[test]
fn test_zero_timeout_is_rejected() {
    let req = CreateJobRequest {
        name: "job".to_string(),
        notebook_id: "nb".to_string(),
        timeout_seconds: Some(0),
        ..Default::default()
    };
    assert!(req.validate().is_err());
}

#[tokio::test]
async fn test_slow_job_times_out() {
    let f = fixture(ScriptedAdapter::new().on("nb-slow", Behavior::Sleep(Duration::from_secs(5))));
    let p = f.pipeline("timeouts", 1);
    f.registry
        .create_job(
            p.id,
            CreateJobRequest {
                name: "slow".to_string(),
                notebook_id: "nb-slow".to_string(),
                timeout_seconds: Some(1),
                ..Default::default()
            },
        )
        .unwrap();

    let start = Instant::now();
    let run = f
        .coordinator
        .trigger_run(p.id, HashMap::new(), TriggerType::Manual, "alice")
        .await
        .unwrap();
    let run = f.coordinator.wait_for_run(run.id).await.unwrap();
    let elapsed = start.elapsed();

    assert!(
        elapsed < Duration::from_secs(4),
        "Timeout should fire well before the job finishes, took {:?}",
        elapsed
    );
    assert_eq!(run.status, RunStatus::Failed);

    let job_runs = f.coordinator.list_job_runs(run.id).await.unwrap();
    assert_eq!(job_runs.len(), 1);
    assert_eq!(job_runs[0].status, JobRunStatus::Failed);
    assert_eq!(job_runs[0].error_message.as_deref(), Some("job timed out after 1s"));
}

#[tokio::test]
async fn test_timeout_applies_per_attempt() {
    let f = fixture(ScriptedAdapter::new().on("nb-slow", Behavior::Sleep(Duration::from_secs(5))));
    let p = f.pipeline("timeouts", 1);
    f.registry
        .create_job(
            p.id,
            CreateJobRequest {
                name: "slow".to_string(),
                notebook_id: "nb-slow".to_string(),
                timeout_seconds: Some(1),
                retry_count: 1,
                ..Default::default()
            },
        )
        .unwrap();

    let run = f
        .coordinator
        .trigger_run(p.id, HashMap::new(), TriggerType::Manual, "alice")
        .await
        .unwrap();
    let run = f.coordinator.wait_for_run(run.id).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);

    let job_runs = f.coordinator.list_job_runs(run.id).await.unwrap();
    assert_eq!(job_runs.len(), 2);
    assert!(job_runs
        .iter()
        .all(|jr| jr.error_message.as_deref() == Some("job timed out after 1s")));
    assert_eq!(f.adapter.call_count("nb-slow"), 2);
}
