// src/governor/sampler.rs

//! Memory and CPU usage sources.

use std::fmt::Debug;
use std::sync::{Mutex, PoisonError};

use tokio::time::Instant;

/// One observation of a job's resource usage.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Usage {
    pub memory_mb: Option<f64>,
    pub cpu_percent: Option<f64>,
}

impl Usage {
    /// Field-wise preference: values in `self` win, `other` fills the gaps.
    pub fn or(self, other: Usage) -> Usage {
        Usage {
            memory_mb: self.memory_mb.or(other.memory_mb),
            cpu_percent: self.cpu_percent.or(other.cpu_percent),
        }
    }
}

/// Usage values pushed by the handler itself through its `JobContext`.
///
/// Handlers that run work out of process (a child process, a remote trainer)
/// know their footprint better than any sampler of this process does.
#[derive(Debug, Default)]
pub struct UsageMeter {
    reported: Mutex<Usage>,
}

impl UsageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report_memory_mb(&self, memory_mb: f64) {
        self.lock().memory_mb = Some(memory_mb);
    }

    pub fn report_cpu_percent(&self, cpu_percent: f64) {
        self.lock().cpu_percent = Some(cpu_percent);
    }

    pub fn reported(&self) -> Usage {
        *self.lock()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Usage> {
        self.reported.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Periodic usage source consulted when the handler reports nothing.
pub trait UsageSampler: Send + Debug {
    fn sample(&mut self) -> Usage;
}

/// Used when several jobs share the process: its footprint says nothing
/// about any one of them, so only handler reports count.
#[derive(Debug, Default)]
pub struct NoSampler;

impl UsageSampler for NoSampler {
    fn sample(&mut self) -> Usage {
        Usage::default()
    }
}

/// Samples the current process through `/proc/self`.
///
/// CPU is derived from the utime+stime delta between two samples, so the
/// first sample only yields memory. On non-Linux targets both are `None`.
#[derive(Debug, Default)]
pub struct ProcSampler {
    last_cpu: Option<(Instant, u64)>,
}

/// `sysconf(_SC_CLK_TCK)` is 100 on every mainstream Linux configuration.
const CLOCK_TICKS_PER_SEC: f64 = 100.0;

impl ProcSampler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl UsageSampler for ProcSampler {
    fn sample(&mut self) -> Usage {
        let memory_mb = read_rss_mb("/proc/self/status");

        let cpu_percent = read_cpu_ticks("/proc/self/stat").and_then(|ticks| {
            let now = Instant::now();
            let previous = self.last_cpu.replace((now, ticks));
            let (then, old_ticks) = previous?;
            let wall = now.duration_since(then).as_secs_f64();
            if wall <= 0.0 {
                return None;
            }
            let cpu_secs = ticks.saturating_sub(old_ticks) as f64 / CLOCK_TICKS_PER_SEC;
            Some(cpu_secs / wall * 100.0)
        });

        Usage {
            memory_mb,
            cpu_percent,
        }
    }
}

/// Resident set size of a process in MiB, from a `/proc/<pid>/status` file.
pub fn rss_mb_of(pid: u32) -> Option<f64> {
    read_rss_mb(&format!("/proc/{pid}/status"))
}

#[cfg(target_os = "linux")]
fn read_rss_mb(path: &str) -> Option<f64> {
    let status = std::fs::read_to_string(path).ok()?;
    parse_vm_rss_kb(&status).map(|kb| kb as f64 / 1024.0)
}

#[cfg(not(target_os = "linux"))]
fn read_rss_mb(_path: &str) -> Option<f64> {
    None
}

#[cfg(target_os = "linux")]
fn read_cpu_ticks(path: &str) -> Option<u64> {
    let stat = std::fs::read_to_string(path).ok()?;
    parse_cpu_ticks(&stat)
}

#[cfg(not(target_os = "linux"))]
fn read_cpu_ticks(_path: &str) -> Option<u64> {
    None
}

fn parse_vm_rss_kb(status: &str) -> Option<u64> {
    status
        .lines()
        .find(|line| line.starts_with("VmRSS:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse().ok())
}

/// utime + stime from a `/proc/<pid>/stat` line.
fn parse_cpu_ticks(stat: &str) -> Option<u64> {
    // The command name may contain spaces; fields are counted after ')'.
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}
