//! Core orchestration logic.
//!
//! This module contains:
//! - Resolver: Dependency validation and execution layers
//! - Admission: Per-pipeline concurrency limits
//! - Executor: Job attempts, retries, timeouts
//! - Coordinator: Run lifecycle and cancellation
//! - Registry: Pipeline and job definitions
//! - Store: Run persistence with compare-and-set transitions
//! - EventLog: Append-only JSONL transition log

pub mod admission;
pub mod coordinator;
pub mod event_log;
pub mod executor;
pub mod registry;
pub mod resolver;
pub mod store;

// Re-export commonly used types
pub use admission::{AdmissionSlot, RunAdmission};
pub use coordinator::RunCoordinator;
pub use event_log::{EventLog, EventLogWriter};
pub use executor::{JobContext, JobExecutor, JobOutcome, RetryBackoff};
pub use registry::PipelineRegistry;
pub use resolver::{resolve_execution_order, ExecutionPlan};
pub use store::{MemoryRunStore, RunStore};
