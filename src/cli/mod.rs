//! Command-line interface for nbflow.
//!
//! Provides commands for running a pipeline definition to completion,
//! validating definitions, and inspecting run event logs.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use crate::adapters::{CommandAdapter, ExecutionAdapter};
use crate::config;
use crate::core::{
    resolve_execution_order, EventLog, MemoryRunStore, PipelineRegistry, RunCoordinator,
};
use crate::domain::{PipelineDefinition, PipelineRun, RunStatus, TriggerType};

/// nbflow - DAG orchestrator for notebook pipelines
#[derive(Parser, Debug)]
#[command(name = "nbflow")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a pipeline definition and wait for it to finish
    Run {
        /// Pipeline definition (YAML)
        file: PathBuf,

        /// Run parameter as key=value (repeatable)
        #[arg(short, long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,

        /// Trigger as the scheduler would (rejected for paused pipelines)
        #[arg(long)]
        scheduled: bool,

        /// Who triggered the run
        #[arg(long, env = "USER", default_value = "cli")]
        by: String,

        /// Executor program (overrides config)
        #[arg(long)]
        executor: Option<String>,
    },

    /// Validate a pipeline definition without running it
    Validate {
        /// Pipeline definition (YAML)
        file: PathBuf,
    },

    /// Show the event log of a run
    Events {
        /// Run ID (UUID)
        run_id: String,
    },

    /// List runs that have an event log
    Runs,

    /// Show resolved configuration (debug)
    Config,
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got '{}'", raw)),
    }
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run {
                file,
                params,
                scheduled,
                by,
                executor,
            } => run_definition(file, params, scheduled, &by, executor).await,
            Commands::Validate { file } => validate_definition(file),
            Commands::Events { run_id } => show_events(&run_id).await,
            Commands::Runs => list_logged_runs().await,
            Commands::Config => show_config(),
        }
    }
}

/// Run a pipeline definition to completion
async fn run_definition(
    file: PathBuf,
    params: Vec<(String, String)>,
    scheduled: bool,
    triggered_by: &str,
    executor: Option<String>,
) -> Result<()> {
    let cfg = config::config()?;
    let definition = PipelineDefinition::from_file(&file)?;

    let adapter = CommandAdapter::new(executor.unwrap_or_else(|| cfg.executor.program.clone()))
        .with_args(cfg.executor.args.clone());
    if let Err(e) = adapter.health_check().await {
        tracing::warn!(error = %e, "Executor health check failed");
    }

    let registry = Arc::new(PipelineRegistry::new());
    let pipeline = registry.load_definition(&definition, triggered_by)?;

    let mut coordinator = RunCoordinator::new(
        registry,
        Arc::new(MemoryRunStore::new()),
        Arc::new(adapter),
    )
    .with_backoff(cfg.retry.clone());
    if cfg.event_log_enabled {
        coordinator = coordinator.with_event_log(EventLog::new(config::runs_dir()?));
    }

    let trigger_type = if scheduled {
        TriggerType::Scheduled
    } else {
        TriggerType::Manual
    };
    let parameters: HashMap<String, String> = params.into_iter().collect();

    let run = coordinator
        .trigger_run(pipeline.id, parameters, trigger_type, triggered_by)
        .await?;
    eprintln!("[Run {} started for pipeline '{}']", run.id, pipeline.name);

    let run = tokio::select! {
        run = coordinator.wait_for_run(run.id) => run?,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("\n[Interrupted, cancelling run {}]", run.id);
            coordinator.cancel_run(run.id, triggered_by).await?;
            coordinator.wait_for_run(run.id).await?
        }
    };

    print_job_runs(&coordinator, &run).await?;

    match run.status {
        RunStatus::Succeeded => {
            eprintln!("\n[Run {} succeeded]", run.id);
            Ok(())
        }
        status => {
            eprintln!(
                "\n[Run {} {}: {}]",
                run.id,
                status,
                run.error_message.as_deref().unwrap_or("no error recorded")
            );
            std::process::exit(1);
        }
    }
}

async fn print_job_runs(coordinator: &RunCoordinator, run: &PipelineRun) -> Result<()> {
    let job_runs = coordinator.list_job_runs(run.id).await?;

    println!("{:<24} {:<8} {:<10} {}", "JOB", "ATTEMPT", "STATUS", "ERROR");
    println!("{}", "-".repeat(75));
    for job_run in job_runs {
        println!(
            "{:<24} {:<8} {:<10} {}",
            job_run.job_name,
            job_run.retry_attempt,
            job_run.status,
            job_run.error_message.as_deref().unwrap_or("")
        );
    }

    Ok(())
}

/// Check a definition the same way a trigger would
fn validate_definition(file: PathBuf) -> Result<()> {
    let definition = PipelineDefinition::from_file(&file)?;

    let registry = PipelineRegistry::new();
    let pipeline = registry.load_definition(&definition, "validate")?;
    let jobs = registry.list_jobs(pipeline.id)?;
    if jobs.is_empty() {
        anyhow::bail!("Pipeline '{}' has no jobs", pipeline.name);
    }

    let plan = resolve_execution_order(&jobs)?;

    println!("Pipeline '{}' is valid ({} jobs)", pipeline.name, plan.len());
    for (layer, names) in plan.layers().iter().enumerate() {
        println!("  layer {}: {}", layer, names.join(", "));
    }

    Ok(())
}

/// Print the event log of a run
async fn show_events(run_id_str: &str) -> Result<()> {
    let run_id = Uuid::parse_str(run_id_str)
        .with_context(|| format!("Invalid run ID: {}", run_id_str))?;

    let log = EventLog::from_config()?;
    let events = log.replay(run_id).await?;
    if events.is_empty() {
        anyhow::bail!("No events found for run {}", run_id);
    }

    for event in events {
        let job = match (&event.job_name, event.retry_attempt) {
            (Some(name), Some(attempt)) => format!("{}#{}", name, attempt),
            (Some(name), None) => name.clone(),
            _ => "-".to_string(),
        };
        print!(
            "{} {:<14} {:<16} {}",
            event.timestamp.format("%Y-%m-%d %H:%M:%S"),
            serde_json::to_string(&event.event_type)?.trim_matches('"'),
            job,
            event.summary
        );
        if let Some(error) = &event.error {
            print!(" ({})", error);
        }
        println!();
    }

    Ok(())
}

async fn list_logged_runs() -> Result<()> {
    let log = EventLog::from_config()?;
    let runs = log.list_runs().await?;

    if runs.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    println!("{:<38} {:<8}", "RUN ID", "EVENTS");
    println!("{}", "-".repeat(48));
    for run_id in runs {
        let events = log.replay(run_id).await?;
        println!("{:<38} {:<8}", run_id, events.len());
    }

    Ok(())
}

fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("nbflow configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home: {}", cfg.home.display());
    println!("  Runs: {}", cfg.home.join("runs").display());
    println!();
    println!("Executor:");
    println!("  Program: {}", cfg.executor.program);
    println!("  Args:    {}", cfg.executor.args.join(" "));
    println!();
    println!("Retry backoff:");
    println!("  Initial delay: {}ms", cfg.retry.initial_delay_ms);
    println!("  Max delay:     {}ms", cfg.retry.max_delay_ms);
    println!("  Multiplier:    {}", cfg.retry.backoff_multiplier);
    println!();
    println!("Event log: {}", if cfg.event_log_enabled { "enabled" } else { "disabled" });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_param() {
        assert_eq!(
            parse_param("run_date=2026-10-19").unwrap(),
            ("run_date".to_string(), "2026-10-19".to_string())
        );
        assert_eq!(
            parse_param("expr=a=b").unwrap(),
            ("expr".to_string(), "a=b".to_string())
        );
        assert!(parse_param("novalue").is_err());
        assert!(parse_param("=x").is_err());
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from([
            "nbflow",
            "run",
            "etl.yaml",
            "-p",
            "region=eu",
            "--param",
            "day=1",
            "--scheduled",
            "--by",
            "cron",
        ])
        .unwrap();

        match cli.command {
            Commands::Run {
                file,
                params,
                scheduled,
                by,
                executor,
            } => {
                assert_eq!(file, PathBuf::from("etl.yaml"));
                assert_eq!(params.len(), 2);
                assert!(scheduled);
                assert_eq!(by, "cron");
                assert!(executor.is_none());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
