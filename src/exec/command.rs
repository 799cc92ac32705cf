// src/exec/command.rs

//! Built-in handlers.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::exec::handler::{JobContext, JobHandler};
use crate::governor::sampler::rss_mb_of;
use crate::types::JobSpec;

/// Runs `config.cmd` through the platform shell.
///
/// - stdout becomes the job output (trimmed string);
/// - stderr lines go to the job log;
/// - a non-zero exit status is a handler failure;
/// - on cancellation the child is killed.
///
/// Optional config keys: `cwd` (string) and `env` (table of strings).
/// While the child runs its resident memory is reported to the context, so
/// memory ceilings apply to the child rather than to this process.
#[derive(Debug, Clone)]
pub struct CommandHandler {
    report_interval: Duration,
}

impl CommandHandler {
    pub fn new() -> Self {
        Self {
            report_interval: Duration::from_millis(200),
        }
    }
}

impl Default for CommandHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobHandler for CommandHandler {
    async fn run(&self, job: &JobSpec, ctx: JobContext) -> Result<Value> {
        let script = job
            .config
            .get("cmd")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("job '{}': config.cmd must be a string", job.id))?;

        info!(
            job_id = %job.id,
            execution_id = %ctx.execution_id,
            attempt = ctx.attempt,
            cmd = %script,
            "starting job process"
        );

        // Build a shell command appropriate for the platform.
        let mut cmd = if cfg!(windows) {
            let mut c = Command::new("cmd");
            c.arg("/C").arg(script);
            c
        } else {
            let mut c = Command::new("sh");
            c.arg("-c").arg(script);
            c
        };

        if let Some(cwd) = job.config.get("cwd").and_then(Value::as_str) {
            cmd.current_dir(cwd);
        }
        if let Some(env) = job.config.get("env").and_then(Value::as_object) {
            for (key, value) in env {
                let value = value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string());
                cmd.env(key, value);
            }
        }

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning process for job '{}'", job.id))?;

        // Collect stdout in the background so the pipe never fills up.
        let stdout_task = child.stdout.take().map(|mut stdout| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stdout.read_to_string(&mut buf).await;
                buf
            })
        });

        // Always consume stderr; each line lands in the job log.
        let stderr_task = child.stderr.take().map(|stderr| {
            let log_ctx = ctx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                let mut last = None;
                while let Ok(Some(line)) = lines.next_line().await {
                    log_ctx.log(line.clone());
                    last = Some(line);
                }
                last
            })
        });

        let pid = child.id();
        let mut report = tokio::time::interval(self.report_interval);

        let status = loop {
            tokio::select! {
                status_res = child.wait() => {
                    break status_res.with_context(|| {
                        format!("waiting for process of job '{}'", job.id)
                    })?;
                }

                _ = ctx.cancelled() => {
                    info!(job_id = %job.id, "cancellation requested; killing job process");
                    if let Err(e) = child.kill().await {
                        warn!(job_id = %job.id, error = %e, "failed to kill child process on cancellation");
                    }
                    bail!("job '{}' was cancelled", job.id);
                }

                _ = report.tick() => {
                    if let Some(mb) = pid.and_then(rss_mb_of) {
                        ctx.report_memory_mb(mb);
                    }
                }
            }
        };

        let stdout = match stdout_task {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };
        let last_stderr = match stderr_task {
            Some(handle) => handle.await.ok().flatten(),
            None => None,
        };

        let code = status.code().unwrap_or(-1);
        debug!(job_id = %job.id, exit_code = code, success = status.success(), "job process exited");

        if !status.success() {
            match last_stderr {
                Some(line) => bail!("command exited with code {code}: {line}"),
                None => bail!("command exited with code {code}"),
            }
        }

        Ok(Value::String(stdout.trim_end().to_string()))
    }
}

/// Succeeds immediately, echoing the job config. Useful for dry runs and
/// for grouping jobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHandler;

#[async_trait]
impl JobHandler for NoopHandler {
    async fn run(&self, job: &JobSpec, _ctx: JobContext) -> Result<Value> {
        Ok(json!({ "job": job.id, "config": job.config }))
    }
}
