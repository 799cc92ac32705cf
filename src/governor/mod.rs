// src/governor/mod.rs

//! Per-job resource ceilings.
//!
//! [`ResourceGovernor::supervise`] races a handler future against the job's
//! time ceiling and, when memory or CPU enforcement is on, against periodic
//! usage samples. The first ceiling crossed cancels the job's token and ends
//! supervision with a [`ResourceViolation`].
//!
//! Usage comes from the handler's own reports first. The `/proc/self`
//! sampler only fills gaps when process sampling is on, i.e. when the
//! worker runs one job at a time and the process footprint is the job's.

pub mod sampler;

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::model::GovernorSection;
use crate::types::ResourceLimits;

pub use sampler::{NoSampler, ProcSampler, Usage, UsageMeter, UsageSampler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Time,
    Memory,
    Cpu,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceKind::Time => "execution time",
            ResourceKind::Memory => "memory",
            ResourceKind::Cpu => "cpu",
        };
        f.write_str(s)
    }
}

/// A ceiling that was crossed. Units: ms for time, MiB for memory, percent
/// for CPU.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceViolation {
    pub kind: ResourceKind,
    pub limit: f64,
    pub observed: f64,
}

impl fmt::Display for ResourceViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unit = match self.kind {
            ResourceKind::Time => "ms",
            ResourceKind::Memory => "MB",
            ResourceKind::Cpu => "%",
        };
        write!(
            f,
            "{} limit exceeded: observed {:.1}{unit}, limit {:.1}{unit}",
            self.kind, self.observed, self.limit
        )
    }
}

impl std::error::Error for ResourceViolation {}

#[derive(Debug, Clone)]
pub struct ResourceGovernor {
    sample_interval: Duration,
    process_sampling: bool,
}

impl ResourceGovernor {
    /// Process sampling starts off.
    pub fn new(settings: &GovernorSection) -> Self {
        Self {
            sample_interval: Duration::from_millis(settings.sample_interval_ms),
            process_sampling: false,
        }
    }

    /// Let the process sampler stand in for usage a handler does not
    /// report. Only sound when no other job shares the process.
    pub fn with_process_sampling(mut self, enabled: bool) -> Self {
        self.process_sampling = enabled;
        self
    }

    pub fn process_sampling(&self) -> bool {
        self.process_sampling
    }

    /// Supervise `fut`, falling back to the process sampler when process
    /// sampling is on and to handler reports alone otherwise.
    pub async fn supervise<F, T>(
        &self,
        job_id: &str,
        limits: Option<&ResourceLimits>,
        meter: &UsageMeter,
        cancel: &CancellationToken,
        fut: F,
    ) -> Result<T, ResourceViolation>
    where
        F: Future<Output = T>,
    {
        let mut sampler: Box<dyn UsageSampler> = if self.process_sampling {
            Box::new(ProcSampler::new())
        } else {
            Box::new(NoSampler)
        };
        self.supervise_with(job_id, limits, meter, sampler.as_mut(), cancel, fut)
            .await
    }

    /// Supervise `fut` with an explicit fallback sampler.
    pub async fn supervise_with<F, T>(
        &self,
        job_id: &str,
        limits: Option<&ResourceLimits>,
        meter: &UsageMeter,
        sampler: &mut dyn UsageSampler,
        cancel: &CancellationToken,
        fut: F,
    ) -> Result<T, ResourceViolation>
    where
        F: Future<Output = T>,
    {
        let Some(limits) = limits else {
            return Ok(fut.await);
        };

        let time_limit = limits.enforced_time_limit_ms();
        let sampling = limits.needs_sampling();
        if time_limit.is_none() && !sampling {
            return Ok(fut.await);
        }

        let started = Instant::now();
        let deadline = tokio::time::sleep(
            time_limit
                .map(Duration::from_millis)
                .unwrap_or(Duration::MAX / 4),
        );
        let mut ticker = tokio::time::interval(self.sample_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut peak = Usage::default();

        tokio::pin!(fut);
        tokio::pin!(deadline);

        let outcome = loop {
            tokio::select! {
                out = &mut fut => break Ok(out),

                _ = &mut deadline, if time_limit.is_some() => {
                    let limit = time_limit.unwrap_or_default() as f64;
                    break Err(ResourceViolation {
                        kind: ResourceKind::Time,
                        limit,
                        observed: started.elapsed().as_millis() as f64,
                    });
                }

                _ = ticker.tick(), if sampling => {
                    let reported = meter.reported();
                    let usage = if reported.memory_mb.is_some() && reported.cpu_percent.is_some() {
                        reported
                    } else {
                        reported.or(sampler.sample())
                    };
                    peak = max_usage(peak, usage);
                    if let Some(violation) = check_usage(limits, usage) {
                        break Err(violation);
                    }
                }
            }
        };

        if sampling {
            debug!(
                job_id,
                peak_memory_mb = peak.memory_mb,
                peak_cpu_percent = peak.cpu_percent,
                "resource usage peak"
            );
        }

        if let Err(violation) = &outcome {
            warn!(job_id, %violation, "resource ceiling crossed; cancelling job");
            cancel.cancel();
        }
        outcome
    }
}

fn check_usage(limits: &ResourceLimits, usage: Usage) -> Option<ResourceViolation> {
    if let (Some(limit), Some(observed)) = (limits.enforced_memory_limit_mb(), usage.memory_mb) {
        if observed > limit as f64 {
            return Some(ResourceViolation {
                kind: ResourceKind::Memory,
                limit: limit as f64,
                observed,
            });
        }
    }

    if let (Some(limit), Some(observed)) = (limits.enforced_cpu_limit_percent(), usage.cpu_percent) {
        if observed > limit {
            return Some(ResourceViolation {
                kind: ResourceKind::Cpu,
                limit,
                observed,
            });
        }
    }

    None
}

fn max_usage(a: Usage, b: Usage) -> Usage {
    fn max(x: Option<f64>, y: Option<f64>) -> Option<f64> {
        match (x, y) {
            (Some(x), Some(y)) => Some(x.max(y)),
            (x, y) => x.or(y),
        }
    }
    Usage {
        memory_mb: max(a.memory_mb, b.memory_mb),
        cpu_percent: max(a.cpu_percent, b.cpu_percent),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct NoSamples;

    impl UsageSampler for NoSamples {
        fn sample(&mut self) -> Usage {
            Usage::default()
        }
    }

    /// Counts samples so tests can tell whether the fallback ran.
    #[derive(Debug, Default)]
    struct CountingSampler {
        calls: usize,
    }

    impl UsageSampler for CountingSampler {
        fn sample(&mut self) -> Usage {
            self.calls += 1;
            Usage {
                memory_mb: Some(4096.0),
                cpu_percent: Some(400.0),
            }
        }
    }

    fn governor() -> ResourceGovernor {
        ResourceGovernor::new(&GovernorSection {
            sample_interval_ms: 10,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn time_ceiling_cancels_the_job() {
        let limits = ResourceLimits {
            max_execution_time_ms: Some(100),
            enforce_time_limit: true,
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        let meter = UsageMeter::new();

        let result = governor()
            .supervise_with(
                "slow",
                Some(&limits),
                &meter,
                &mut NoSamples,
                &cancel,
                tokio::time::sleep(Duration::from_secs(10)),
            )
            .await;

        let violation = result.unwrap_err();
        assert_eq!(violation.kind, ResourceKind::Time);
        assert_eq!(violation.limit, 100.0);
        assert!(cancel.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn reported_memory_over_limit_is_a_violation() {
        let limits = ResourceLimits {
            max_memory_mb: Some(256),
            enforce_memory_limit: true,
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        let meter = UsageMeter::new();
        meter.report_memory_mb(1024.0);

        let result = governor()
            .supervise_with(
                "hungry",
                Some(&limits),
                &meter,
                &mut NoSamples,
                &cancel,
                std::future::pending::<()>(),
            )
            .await;

        let violation = result.unwrap_err();
        assert_eq!(violation.kind, ResourceKind::Memory);
        assert_eq!(violation.observed, 1024.0);
    }

    #[tokio::test]
    async fn unenforced_limits_are_ignored() {
        let limits = ResourceLimits {
            max_execution_time_ms: Some(1),
            enforce_time_limit: false,
            ..Default::default()
        };
        let cancel = CancellationToken::new();

        let result = governor()
            .supervise("quick", Some(&limits), &UsageMeter::new(), &cancel, async { 7 })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert!(!cancel.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn shared_process_footprint_is_not_charged_to_the_job() {
        let limits = ResourceLimits {
            max_memory_mb: Some(1),
            enforce_memory_limit: true,
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        assert!(!governor().process_sampling());

        let result = governor()
            .supervise(
                "sleeper",
                Some(&limits),
                &UsageMeter::new(),
                &cancel,
                async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    "done"
                },
            )
            .await;

        assert_eq!(result.unwrap(), "done");
        assert!(!cancel.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn complete_reports_skip_the_fallback_sampler() {
        let limits = ResourceLimits {
            max_memory_mb: Some(256),
            enforce_memory_limit: true,
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        let meter = UsageMeter::new();
        meter.report_memory_mb(64.0);
        meter.report_cpu_percent(10.0);
        let mut sampler = CountingSampler::default();

        let result = governor()
            .supervise_with(
                "reporter",
                Some(&limits),
                &meter,
                &mut sampler,
                &cancel,
                tokio::time::sleep(Duration::from_millis(100)),
            )
            .await;

        assert!(result.is_ok());
        assert_eq!(sampler.calls, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_reports_are_filled_from_the_sampler() {
        let limits = ResourceLimits {
            max_memory_mb: Some(256),
            enforce_memory_limit: true,
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        let mut sampler = CountingSampler::default();

        let violation = governor()
            .supervise_with(
                "unreported",
                Some(&limits),
                &UsageMeter::new(),
                &mut sampler,
                &cancel,
                std::future::pending::<()>(),
            )
            .await
            .unwrap_err();

        assert_eq!(violation.kind, ResourceKind::Memory);
        assert!(sampler.calls >= 1);
        assert!(cancel.is_cancelled());
    }
}
