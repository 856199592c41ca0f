//! nbflow - DAG orchestrator for notebook pipelines
//!
//! Pipelines are sets of jobs connected by `depends_on` edges. Each job
//! executes a notebook through an external executor; the orchestrator only
//! decides what runs when.
//!
//! # Architecture
//!
//! - Every run goes `pending -> running -> succeeded | failed | cancelled`
//! - Status changes are compare-and-set in the run store, so a late job
//!   completion can never resurrect a cancelled run
//! - Retries are first-class: each attempt is its own job-run record
//! - Per-pipeline concurrency limits are enforced at trigger time
//!
//! # Modules
//!
//! - `adapters`: Notebook executor integrations
//! - `core`: Resolver, admission, executor, coordinator, registry, store
//! - `domain`: Data structures (Pipeline, PipelineRun, RunEvent, errors)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Check a definition
//! nbflow validate pipelines/etl.yaml
//!
//! # Run it with parameters
//! nbflow run pipelines/etl.yaml -p run_date=2026-10-19
//!
//! # Inspect what happened
//! nbflow events <run-id>
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use adapters::{CommandAdapter, ExecutionAdapter, ExecutionOutput, ExecutionRequest};
pub use crate::core::{MemoryRunStore, PipelineRegistry, RetryBackoff, RunCoordinator, RunStore};
pub use domain::{
    ExecutionError, JobRunStatus, OrchestratorError, Pipeline, PipelineJob, PipelineJobRun,
    PipelineRun, RunEvent, RunStatus, TriggerType,
};
