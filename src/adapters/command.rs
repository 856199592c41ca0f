//! Subprocess execution adapter.
//!
//! Runs `<program> <args..> <notebook_id>` for every attempt. Run context
//! travels through the environment:
//! - `NBFLOW_RUN_ID`, `NBFLOW_JOB`, `NBFLOW_ATTEMPT`
//! - `NBFLOW_COMPUTE_ENDPOINT` (when the job has one)
//! - `NBFLOW_PARAM_<KEY>` for every run parameter

use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::{ExecutionAdapter, ExecutionOutput, ExecutionRequest};

/// Executes notebooks through an external program
#[derive(Debug, Clone)]
pub struct CommandAdapter {
    program: String,
    args: Vec<String>,
}

impl CommandAdapter {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Arguments placed before the notebook id
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn command(&self, request: &ExecutionRequest) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(&request.notebook_id)
            .env("NBFLOW_RUN_ID", request.run_id.to_string())
            .env("NBFLOW_JOB", &request.job_name)
            .env("NBFLOW_ATTEMPT", request.attempt.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Timeouts drop the future; the child must not outlive it
            .kill_on_drop(true);

        if let Some(endpoint) = &request.compute_endpoint_id {
            cmd.env("NBFLOW_COMPUTE_ENDPOINT", endpoint);
        }
        for (key, value) in &request.parameters {
            cmd.env(format!("NBFLOW_PARAM_{}", key.to_ascii_uppercase()), value);
        }

        cmd
    }
}

#[async_trait]
impl ExecutionAdapter for CommandAdapter {
    fn name(&self) -> &str {
        "command"
    }

    async fn execute(
        &self,
        request: &ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutput> {
        let child = self.command(request).spawn().with_context(|| {
            format!(
                "Failed to spawn '{}' for notebook '{}'",
                self.program, request.notebook_id
            )
        })?;

        let output = tokio::select! {
            output = child.wait_with_output() => output.with_context(|| {
                format!("Failed to wait for '{}' on notebook '{}'", self.program, request.notebook_id)
            })?,
            // Dropping the wait future kills the child (kill_on_drop)
            _ = cancel.cancelled() => anyhow::bail!(
                "execution of notebook '{}' was cancelled",
                request.notebook_id
            ),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let exit_code = output.status.code().unwrap_or(-1);
            anyhow::bail!(
                "notebook '{}' failed with exit code {}: {}",
                request.notebook_id,
                exit_code,
                stderr.trim()
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if stdout.is_empty() {
            Ok(ExecutionOutput::default())
        } else {
            Ok(ExecutionOutput::new(stdout))
        }
    }

    async fn health_check(&self) -> Result<()> {
        let status = Command::new(&self.program)
            .arg("--help")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .with_context(|| format!("Failed to run executor '{}'", self.program))?;

        if !status.success() {
            anyhow::bail!("Executor '{}' health check exited with {}", self.program, status);
        }

        Ok(())
    }
}
