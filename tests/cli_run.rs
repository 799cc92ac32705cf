// tests/cli_run.rs

mod common;
use crate::common::init_tracing;

use std::path::Path;

use clap::Parser;
use tempfile::TempDir;

use pipedag::cli::CliArgs;

fn write_pipeline(dir: &TempDir, contents: &str) -> String {
    let path = dir.path().join("pipeline.toml");
    std::fs::write(&path, contents).unwrap();
    path.display().to_string()
}

fn args(dir: &Path, rest: &[&str]) -> CliArgs {
    let config = dir.join("pipedag.toml").display().to_string();
    let mut argv = vec!["pipedag", "--config", config.as_str()];
    argv.extend_from_slice(rest);
    CliArgs::try_parse_from(argv).unwrap()
}

const NOOP_PIPELINE: &str = r#"
name = "smoke"

[[job]]
id = "fetch"
type = "noop"

[[job]]
id = "report"
type = "noop"
depends_on = ["fetch"]
config = { format = "json" }
"#;

#[tokio::test]
async fn validate_and_dry_run_accept_a_good_pipeline() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let pipeline = write_pipeline(&dir, NOOP_PIPELINE);

    pipedag::run(args(dir.path(), &["validate", &pipeline]))
        .await
        .unwrap();
    pipedag::run(args(dir.path(), &["run", &pipeline, "--dry-run"]))
        .await
        .unwrap();
}

#[tokio::test]
async fn validate_rejects_unknown_handler_types() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let pipeline = write_pipeline(
        &dir,
        r#"
name = "bad"

[[job]]
id = "x"
type = "teleport"
"#,
    );

    let err = pipedag::run(args(dir.path(), &["validate", &pipeline]))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("teleport"));
}

#[tokio::test]
async fn run_executes_on_the_default_memory_backend() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let pipeline = write_pipeline(&dir, NOOP_PIPELINE);

    pipedag::run(args(
        dir.path(),
        &["run", &pipeline, "--parallelism", "2", "--execution-id", "cli-1"],
    ))
    .await
    .unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn failed_execution_is_an_error() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let pipeline = write_pipeline(
        &dir,
        r#"
name = "broken"

[[job]]
id = "boom"
type = "command"
config = { cmd = "echo nope >&2; exit 3" }
"#,
    );

    let err = pipedag::run(args(dir.path(), &["run", &pipeline]))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("failed"));
}

#[tokio::test]
async fn status_of_unknown_execution_is_an_error() {
    init_tracing();
    let dir = TempDir::new().unwrap();

    let err = pipedag::run(args(dir.path(), &["status", "missing"]))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not found"));
}

#[test]
fn run_prints_only_the_result_on_stdout() {
    let dir = TempDir::new().unwrap();
    let pipeline = write_pipeline(&dir, NOOP_PIPELINE);
    let config = dir.path().join("pipedag.toml");

    let output = std::process::Command::new(env!("CARGO_BIN_EXE_pipedag"))
        .args(["--config", config.to_str().unwrap(), "--log-level", "debug"])
        .args(["run", &pipeline, "--execution-id", "cli-out"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let result: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(result["executionId"], "cli-out");
    assert_eq!(result["status"], "completed");
    assert!(!output.stderr.is_empty());
}
