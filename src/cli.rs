// src/cli.rs

//! CLI argument parsing using `clap`.
//!
//! `status`, `executions`, `resume` and `cancel` read persisted state, so they
//! are only useful against a shared backend (`[backend] url = "redis://..."`).

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Command-line arguments for `pipedag`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "pipedag",
    version,
    about = "Run DAGs of jobs with retries, checkpoints and resource limits.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the engine config file (TOML).
    ///
    /// A missing file means defaults: an in-process backend.
    #[arg(long, global = true, value_name = "PATH", default_value = "pipedag.toml")]
    pub config: PathBuf,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `PIPEDAG_LOG` or a default level will be used.
    #[arg(long, global = true, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Execute a pipeline file.
    Run {
        /// Pipeline definition (TOML).
        pipeline: PathBuf,

        /// Maximum jobs of this execution running at once.
        #[arg(long, value_name = "N")]
        parallelism: Option<usize>,

        /// Reuse results of identical jobs from earlier runs.
        #[arg(long)]
        cache: bool,

        /// Parse + validate, print the plan, but don't run any job.
        #[arg(long)]
        dry_run: bool,

        /// Use this execution id instead of a generated one.
        #[arg(long, value_name = "ID")]
        execution_id: Option<String>,
    },

    /// Check a pipeline file without running it.
    Validate { pipeline: PathBuf },

    /// Print the persisted state of an execution.
    Status { execution_id: String },

    /// List executions of a workflow, oldest first.
    Executions { workflow_id: String },

    /// Continue a paused execution from its checkpoint.
    ///
    /// The pipeline is stored in the checkpoint; no file is needed.
    Resume {
        checkpoint_id: String,

        #[arg(long, value_name = "N")]
        parallelism: Option<usize>,
    },

    /// Cancel an execution that is paused or pending.
    Cancel { execution_id: String },
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_accepts_global_flags_after_subcommand() {
        let args = CliArgs::try_parse_from([
            "pipedag",
            "run",
            "train.toml",
            "--parallelism",
            "2",
            "--cache",
            "--config",
            "engine.toml",
        ])
        .unwrap();

        assert_eq!(args.config, PathBuf::from("engine.toml"));
        match args.command {
            Command::Run {
                pipeline,
                parallelism,
                cache,
                dry_run,
                execution_id,
            } => {
                assert_eq!(pipeline, PathBuf::from("train.toml"));
                assert_eq!(parallelism, Some(2));
                assert!(cache);
                assert!(!dry_run);
                assert!(execution_id.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn config_defaults_to_pipedag_toml() {
        let args = CliArgs::try_parse_from(["pipedag", "status", "abc"]).unwrap();
        assert_eq!(args.config, PathBuf::from("pipedag.toml"));
        assert!(args.log_level.is_none());
    }
}
