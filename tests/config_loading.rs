// tests/config_loading.rs

use std::io::Write;

use tempfile::NamedTempFile;

use pipedag::config::{load_and_validate, load_pipeline};
use pipedag::errors::EngineError;

fn write_temp(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "{contents}").unwrap();
    file
}

#[test]
fn missing_engine_config_means_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = load_and_validate(dir.path().join("pipedag.toml")).unwrap();

    assert_eq!(cfg.backend.url, "memory://");
    assert_eq!(cfg.backend.key_prefix, "pipedag");
    assert_eq!(cfg.state.ttl_secs, 604_800);
    assert_eq!(cfg.queue.concurrency, 4);
    assert_eq!(cfg.orchestrator.default_parallelism, 4);
}

#[test]
fn partial_engine_config_keeps_other_defaults() {
    let file = write_temp(
        r#"
[backend]
url = "redis://127.0.0.1:6379"

[queue]
concurrency = 16
backoff_base_ms = 50
"#,
    );

    let cfg = load_and_validate(file.path()).unwrap();
    assert_eq!(cfg.backend.url, "redis://127.0.0.1:6379");
    assert_eq!(cfg.backend.key_prefix, "pipedag");
    assert_eq!(cfg.queue.concurrency, 16);
    assert_eq!(cfg.queue.backoff_base_ms, 50);
    assert_eq!(cfg.queue.backoff_max_ms, 60_000);
    assert_eq!(cfg.queue.lease_ms, 30_000);
    assert_eq!(cfg.queue.retain_completed, 1_000);
    assert_eq!(cfg.lock.default_ttl_ms, 30_000);
}

#[test]
fn invalid_engine_config_is_a_config_error() {
    let cases = [
        "[queue]\nconcurrency = 0\n",
        "[backend]\nurl = \"postgres://localhost\"\n",
        "[backend]\nkey_prefix = \"  \"\n",
        "[queue]\nbackoff_base_ms = 5000\nbackoff_max_ms = 100\n",
        "[state]\nttl_secs = 0\n",
        "[orchestrator]\ndefault_parallelism = 0\n",
        "[queue]\npoll_interval_ms = 0\n",
        "[queue]\npoll_interval_ms = 500\nlease_ms = 600\n",
        "[queue]\nretain_completed = 0\n",
    ];

    for contents in cases {
        let file = write_temp(contents);
        match load_and_validate(file.path()) {
            Err(EngineError::ConfigError(_)) => {}
            other => panic!("expected ConfigError for {contents:?}, got {other:?}"),
        }
    }
}

#[test]
fn pipeline_file_maps_to_job_specs() {
    let file = write_temp(
        r#"
name = "train-resnet"

[[job]]
id = "preprocess"
type = "command"
config = { cmd = "echo prep" }

[[job]]
id = "train"
name = "Train model"
type = "command"
depends_on = ["preprocess"]
priority = 5
max_retries = 2
timeout_ms = 60000

[job.config]
cmd = "echo train"
epochs = 10

[job.resource_limits]
max_memory_mb = 512
enforce_memory_limit = true
"#,
    );

    let pipeline = load_pipeline(file.path()).unwrap();
    assert_eq!(pipeline.name, "train-resnet");
    assert_eq!(pipeline.jobs.len(), 2);

    let prep = &pipeline.jobs[0];
    assert_eq!(prep.name, "preprocess");
    assert_eq!(prep.config["cmd"], "echo prep");

    let train = &pipeline.jobs[1];
    assert_eq!(train.name, "Train model");
    assert_eq!(train.depends_on, vec!["preprocess".to_string()]);
    assert_eq!(train.priority, 5);
    assert_eq!(train.max_retries, 2);
    assert_eq!(train.timeout_ms, Some(60_000));
    assert_eq!(train.config["epochs"], 10);

    let limits = train.resource_limits.as_ref().unwrap();
    assert_eq!(limits.enforced_memory_limit_mb(), Some(512));
    assert_eq!(limits.enforced_cpu_limit_percent(), None);
}

#[test]
fn cyclic_pipeline_is_rejected() {
    let file = write_temp(
        r#"
name = "loop"

[[job]]
id = "A"
type = "noop"
depends_on = ["B"]

[[job]]
id = "B"
type = "noop"
depends_on = ["A"]
"#,
    );

    match load_pipeline(file.path()) {
        Err(EngineError::DagCycle(msg)) => {
            assert!(msg.contains("cycle detected"));
            assert!(msg.contains('A') || msg.contains('B'));
        }
        other => panic!("expected DagCycle, got {other:?}"),
    }
}

#[test]
fn malformed_toml_is_a_toml_error() {
    let file = write_temp("name = \"x\"\n[[job]\nid = ");
    assert!(matches!(
        load_pipeline(file.path()),
        Err(EngineError::TomlError(_))
    ));
}
