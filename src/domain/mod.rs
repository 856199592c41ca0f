//! Domain types for the nbflow orchestrator.
//!
//! This module contains the core data structures:
//! - Pipeline: Pipeline and job definitions, request validation
//! - Run: Run and job-run records, statuses, filters
//! - Events: State transition records
//! - Error: The error taxonomy shared by all components

pub mod error;
pub mod events;
pub mod pipeline;
pub mod run;

// Re-export commonly used types
pub use error::{ExecutionError, OrchestratorError};
pub use events::{EventType, RunEvent};
pub use pipeline::{
    is_valid_parameter_name, validate_parameters, CreateJobRequest, CreatePipelineRequest,
    Pipeline, PipelineDefinition, PipelineJob, UpdatePipelineRequest,
};
pub use run::{
    JobRunStatus, PageRequest, PipelineJobRun, PipelineRun, RunFilter, RunStatus, TriggerType,
};
