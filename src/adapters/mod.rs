//! Adapter interface for the external notebook executor.
//!
//! The orchestrator never runs notebook cells itself. Each job attempt is
//! handed to an [`ExecutionAdapter`] together with a cancellation token
//! that is triggered on run cancellation or when the attempt times out.

pub mod command;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use command::CommandAdapter;

/// Everything an adapter needs to execute one job attempt
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub run_id: Uuid,
    pub job_name: String,
    pub notebook_id: String,
    pub compute_endpoint_id: Option<String>,
    pub parameters: HashMap<String, String>,

    /// 0-based attempt number
    pub attempt: u32,
}

/// Output from an adapter execution
#[derive(Debug, Clone, Default)]
pub struct ExecutionOutput {
    /// Free-form result summary reported by the executor
    pub summary: Option<String>,
}

impl ExecutionOutput {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: Some(summary.into()),
        }
    }
}

/// Trait for notebook execution backends
#[async_trait]
pub trait ExecutionAdapter: Send + Sync {
    /// Human-readable adapter name
    fn name(&self) -> &str;

    /// Execute a notebook. Implementations should stop promptly once
    /// `cancel` fires; the caller ignores any result produced afterwards.
    async fn execute(
        &self,
        request: &ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutput>;

    /// Check that the backend is reachable
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}
