// src/lib.rs

pub mod backend;
pub mod cli;
pub mod config;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod governor;
pub mod lock;
pub mod logging;
pub mod queue;
pub mod state;
pub mod types;

use std::path::Path;

use anyhow::{Result, bail};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cli::{CliArgs, Command};
use crate::config::loader::{load_and_validate, load_pipeline};
use crate::config::model::{EngineConfig, PipelineFile};
use crate::dag::DagGraph;
use crate::engine::{ExecuteOptions, ExecutionResult, Orchestrator};
use crate::exec::HandlerRegistry;
use crate::types::ExecutionStatus;

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading
/// - backend / state store / locks / queue / orchestrator
/// - built-in handlers
/// - Ctrl-C handling (pauses a running execution)
pub async fn run(args: CliArgs) -> Result<()> {
    let cfg = load_and_validate(&args.config)?;

    match args.command {
        Command::Validate { pipeline } => {
            let file = load_pipeline(&pipeline)?;
            check_handler_types(&file, &HandlerRegistry::with_builtins())?;
            println!("{}: ok ({} jobs)", file.name, file.jobs.len());
            Ok(())
        }

        Command::Run {
            pipeline,
            parallelism,
            cache,
            dry_run,
            execution_id,
        } => {
            let file = load_pipeline(&pipeline)?;
            if dry_run {
                print_dry_run(&file, &pipeline);
                return Ok(());
            }

            let orchestrator = connect(&cfg, HandlerRegistry::with_builtins()).await?;
            let execution_id = execution_id.unwrap_or_else(|| Uuid::new_v4().to_string());
            let mut options = ExecuteOptions::default()
                .with_cache(cache)
                .with_execution_id(execution_id.clone());
            options.parallelism = parallelism;

            spawn_pause_on_ctrl_c(orchestrator.clone(), execution_id);

            let result = orchestrator.execute(&file.name, file.jobs, options).await;
            orchestrator.queue().shutdown().await;
            report(result?)
        }

        Command::Resume {
            checkpoint_id,
            parallelism,
        } => {
            let orchestrator = connect(&cfg, HandlerRegistry::with_builtins()).await?;
            let record = orchestrator
                .state_store()
                .load_checkpoint(&checkpoint_id)
                .await?;
            if let Some(record) = record {
                spawn_pause_on_ctrl_c(orchestrator.clone(), record.execution_id);
            }

            let mut options = ExecuteOptions::default();
            options.parallelism = parallelism;

            let result = orchestrator.resume(&checkpoint_id, options).await;
            orchestrator.queue().shutdown().await;
            report(result?)
        }

        Command::Status { execution_id } => {
            let orchestrator = connect(&cfg, HandlerRegistry::new()).await?;
            let state = orchestrator.get_execution(&execution_id).await?;
            orchestrator.queue().shutdown().await;
            match state {
                Some(state) => print_json(&state),
                None => bail!("execution '{execution_id}' not found"),
            }
        }

        Command::Executions { workflow_id } => {
            let orchestrator = connect(&cfg, HandlerRegistry::new()).await?;
            let executions = orchestrator.get_workflow_executions(&workflow_id).await?;
            orchestrator.queue().shutdown().await;
            print_json(&executions)
        }

        Command::Cancel { execution_id } => {
            let orchestrator = connect(&cfg, HandlerRegistry::new()).await?;
            let cancelled = orchestrator.cancel(&execution_id).await;
            orchestrator.queue().shutdown().await;
            if cancelled? {
                println!("{execution_id}: cancelled");
                Ok(())
            } else {
                bail!("execution '{execution_id}' is not paused or pending")
            }
        }
    }
}

/// Orchestrator whose queue runs `registry`'s job types. Commands that run
/// no jobs pass an empty registry, so their queue claims nothing that other
/// workers share.
async fn connect(cfg: &EngineConfig, registry: HandlerRegistry) -> Result<Orchestrator> {
    let backend = backend::connect(&cfg.backend).await?;
    Ok(Orchestrator::from_config(cfg, backend, registry))
}

/// First Ctrl-C pauses the execution; it then resolves with a checkpoint id
/// that `pipedag resume` accepts.
fn spawn_pause_on_ctrl_c(orchestrator: Orchestrator, execution_id: String) {
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            eprintln!("failed to listen for Ctrl+C: {e}");
            return;
        }
        info!(%execution_id, "Ctrl+C received; pausing execution");
        if let Err(e) = orchestrator.pause(&execution_id).await {
            warn!(%execution_id, error = %e, "could not pause execution");
        }
    });
}

/// Print the result as JSON; a failed execution is also a failed process.
fn report(result: ExecutionResult) -> Result<()> {
    print_json(&result)?;

    match result.status {
        ExecutionStatus::Failed => bail!(
            "execution {} failed (blocked: {:?})",
            result.execution_id,
            result.blocked
        ),
        ExecutionStatus::Paused => {
            if let Some(ref checkpoint) = result.checkpoint_id {
                eprintln!("paused; continue with `pipedag resume {checkpoint}`");
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn check_handler_types(file: &PipelineFile, registry: &HandlerRegistry) -> Result<()> {
    for job in &file.jobs {
        if !registry.contains(&job.job_type) {
            bail!(
                "job '{}' has type '{}' with no registered handler (known: {:?})",
                job.id,
                job.job_type,
                registry.types()
            );
        }
    }
    Ok(())
}

/// Simple dry-run output: print jobs, deps and settings.
fn print_dry_run(file: &PipelineFile, path: &Path) {
    let graph = DagGraph::from_specs(&file.jobs);

    println!("pipedag dry-run: {}", path.display());
    println!("  workflow = {}", file.name);
    println!("  roots = {:?}", graph.roots());
    println!();

    println!("jobs ({}):", file.jobs.len());
    for job in &file.jobs {
        println!("  - {}", job.id);
        println!("      type: {}", job.job_type);
        if job.display_name() != job.id {
            println!("      name: {}", job.display_name());
        }
        if !job.depends_on.is_empty() {
            println!("      depends_on: {:?}", job.depends_on);
        }
        if job.priority > 0 {
            println!("      priority: {}", job.priority);
        }
        if job.max_retries > 0 {
            println!("      max_retries: {}", job.max_retries);
        }
        if let Some(timeout) = job.timeout_ms {
            println!("      timeout_ms: {timeout}");
        }
        if !job.config.is_empty() {
            println!("      config: {}", serde_json::Value::Object(job.config.clone()));
        }
    }

    debug!("dry-run complete (no execution)");
}
