//! Event Log Integration Tests
//!
//! JSONL persistence of run transitions.

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use common::{Behavior, ScriptedAdapter};
use nbflow::core::{EventLog, MemoryRunStore, PipelineRegistry, RetryBackoff, RunCoordinator};
use nbflow::domain::{CreateJobRequest, CreatePipelineRequest, EventType, RunEvent, TriggerType};
use tempfile::TempDir;
use uuid::Uuid;

#[tokio::test]
async fn test_replay_preserves_append_order() {
    let temp = TempDir::new().unwrap();
    let log = EventLog::new(temp.path());
    let run_id = Uuid::new_v4();

    log.append(&RunEvent::run(run_id, EventType::RunCreated, "created"))
        .await
        .unwrap();
    log.append(&RunEvent::job(run_id, "extract", 0, EventType::JobStarted, "started"))
        .await
        .unwrap();
    log.append(
        &RunEvent::job(run_id, "extract", 0, EventType::JobFailed, "failed")
            .with_duration(12)
            .with_error("kernel died"),
    )
    .await
    .unwrap();

    let events = log.replay(run_id).await.unwrap();
    let types: Vec<EventType> = events.iter().map(|e| e.event_type).collect();
    assert_eq!(
        types,
        vec![EventType::RunCreated, EventType::JobStarted, EventType::JobFailed]
    );
    assert_eq!(events[2].error.as_deref(), Some("kernel died"));
    assert_eq!(events[2].duration_ms, Some(12));
    assert!(log.events_path(run_id).exists());

    let failed = log
        .last_event_of_type(run_id, EventType::JobFailed)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failed.job_name.as_deref(), Some("extract"));
}

#[tokio::test]
async fn test_missing_run_replays_empty() {
    let temp = TempDir::new().unwrap();
    let log = EventLog::new(temp.path().join("runs"));

    assert!(log.replay(Uuid::new_v4()).await.unwrap().is_empty());
    assert!(log.list_runs().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_list_runs_ignores_stray_entries() {
    let temp = TempDir::new().unwrap();
    let log = EventLog::new(temp.path());
    let run_id = Uuid::new_v4();

    log.append(&RunEvent::run(run_id, EventType::RunCreated, "created"))
        .await
        .unwrap();
    std::fs::create_dir_all(temp.path().join("not-a-run")).unwrap();
    std::fs::write(temp.path().join("notes.txt"), "hello").unwrap();

    assert_eq!(log.list_runs().await.unwrap(), vec![run_id]);
}

#[tokio::test]
async fn test_coordinator_writes_transitions() {
    let temp = TempDir::new().unwrap();

    let registry = Arc::new(PipelineRegistry::new());
    let adapter = ScriptedAdapter::new().on("nb-load", Behavior::FailTimes(1));
    let coordinator = RunCoordinator::new(
        registry.clone(),
        Arc::new(MemoryRunStore::new()),
        Arc::new(adapter),
    )
    .with_backoff(RetryBackoff::immediate())
    .with_event_log(EventLog::new(temp.path()));

    let pipeline = registry
        .create_pipeline(
            CreatePipelineRequest {
                name: "etl".to_string(),
                ..Default::default()
            },
            "alice",
        )
        .unwrap();
    registry
        .create_job(
            pipeline.id,
            CreateJobRequest {
                name: "load".to_string(),
                notebook_id: "nb-load".to_string(),
                retry_count: 1,
                ..Default::default()
            },
        )
        .unwrap();

    let run = coordinator
        .trigger_run(pipeline.id, HashMap::new(), TriggerType::Manual, "alice")
        .await
        .unwrap();
    coordinator.wait_for_run(run.id).await.unwrap();

    let events = EventLog::new(temp.path()).replay(run.id).await.unwrap();
    let types: Vec<EventType> = events.iter().map(|e| e.event_type).collect();
    assert_eq!(
        types,
        vec![
            EventType::RunCreated,
            EventType::RunStarted,
            EventType::JobStarted,
            EventType::JobRetrying,
            EventType::JobStarted,
            EventType::JobSucceeded,
            EventType::RunSucceeded,
        ]
    );
    assert!(events.iter().all(|e| e.run_id == run.id));
    assert_eq!(events[4].retry_attempt, Some(1));
}
