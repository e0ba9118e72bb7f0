//! Step execution policy
//!
//! Every job step returns a `Result`; what happens to a failed step is an
//! explicit decision made here:
//! - transient remote failures are retried with exponential backoff
//! - a failed required step always fails the job
//! - a failed optional step fails the job under [`FailurePolicy::FailFast`]
//!   and is recorded as degraded under [`FailurePolicy::BestEffort`]

use crate::error::{JobError, ResourceError};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::{Duration, Instant};

/// What a job does when an optional step fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Any failed step fails the job
    #[default]
    FailFast,
    /// Optional step failures are recorded and the job continues
    BestEffort,
}

/// Whether a step's failure may be tolerated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepCriticality {
    /// Outcome cannot be produced without this step
    Required,
    /// May be skipped under the best-effort policy
    Optional,
}

/// Per-step retry of transient remote failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    /// Delay before the second attempt
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,
    /// Upper bound for any single delay
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Single attempt, no retry
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Retry without waiting
    #[must_use]
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before attempt `attempt + 1`, where `attempt` starts at 1
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(super) fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Settings shared by provisioning and deprovisioning jobs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSettings {
    /// Optional-step failure handling
    pub failure_policy: FailurePolicy,
    /// Transient failure retry
    pub retry: RetryPolicy,
    /// Tenant lease time-to-live
    pub lease_ttl: Duration,
    /// Lease holder name written into lease records
    pub holder: String,
}

impl JobSettings {
    /// Create default settings
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With failure policy
    #[inline]
    #[must_use]
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// With retry policy
    #[inline]
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// With lease TTL
    #[inline]
    #[must_use]
    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::FailFast,
            retry: RetryPolicy::default(),
            lease_ttl: Duration::from_secs(15 * 60),
            holder: format!("lifecycle-worker-{}", std::process::id()),
        }
    }
}

/// Outcome of one step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepStatus {
    /// Step succeeded
    Succeeded,
    /// Step failed and the failure was tolerated
    Degraded(String),
    /// Step failed and failed the job
    Failed(String),
}

/// Record of one executed step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    pub name: &'static str,
    pub criticality: StepCriticality,
    pub attempts: u32,
    pub status: StepStatus,
    pub elapsed_ms: u64,
}

/// Executes job steps under the configured policies and records the result
#[derive(Debug)]
pub struct StepRunner<'a> {
    settings: &'a JobSettings,
    reports: Vec<StepReport>,
}

impl<'a> StepRunner<'a> {
    /// Create runner
    #[must_use]
    pub fn new(settings: &'a JobSettings) -> Self {
        Self {
            settings,
            reports: Vec::new(),
        }
    }

    /// Settings the runner applies
    #[must_use]
    pub fn settings(&self) -> &JobSettings {
        self.settings
    }

    /// Run a required step
    pub async fn required<T, F, Fut>(&mut self, name: &'static str, op: F) -> Result<T, JobError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ResourceError>>,
    {
        match self.step(name, StepCriticality::Required, op).await? {
            Some(value) => Ok(value),
            None => Err(JobError::Fatal(format!(
                "required step '{name}' produced no value"
            ))),
        }
    }

    /// Run an optional step; `Ok(None)` means it failed and was tolerated
    pub async fn optional<T, F, Fut>(
        &mut self,
        name: &'static str,
        op: F,
    ) -> Result<Option<T>, JobError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ResourceError>>,
    {
        self.step(name, StepCriticality::Optional, op).await
    }

    async fn step<T, F, Fut>(
        &mut self,
        name: &'static str,
        criticality: StepCriticality,
        op: F,
    ) -> Result<Option<T>, JobError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ResourceError>>,
    {
        let started = Instant::now();
        let (result, attempts) = with_retry(&self.settings.retry, name, op).await;
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let mut report = StepReport {
            name,
            criticality,
            attempts,
            status: StepStatus::Succeeded,
            elapsed_ms,
        };

        match result {
            Ok(value) => {
                tracing::debug!(step = name, attempts, "step succeeded");
                self.reports.push(report);
                Ok(Some(value))
            }
            Err(source) => {
                let tolerated = criticality == StepCriticality::Optional
                    && self.settings.failure_policy == FailurePolicy::BestEffort;
                if tolerated {
                    tracing::warn!(step = name, attempts, error = %source, "optional step failed, continuing");
                    report.status = StepStatus::Degraded(source.to_string());
                    self.reports.push(report);
                    Ok(None)
                } else {
                    tracing::error!(step = name, attempts, error = %source, "step failed");
                    report.status = StepStatus::Failed(source.to_string());
                    self.reports.push(report);
                    Err(JobError::step(name, source))
                }
            }
        }
    }

    /// Names of tolerated failures
    #[must_use]
    pub fn degraded(&self) -> Vec<String> {
        self.reports
            .iter()
            .filter(|r| matches!(r.status, StepStatus::Degraded(_)))
            .map(|r| r.name.to_string())
            .collect()
    }

    /// Steps executed so far
    #[must_use]
    pub fn reports(&self) -> &[StepReport] {
        &self.reports
    }

    /// Consume into the step reports
    #[must_use]
    pub fn into_reports(self) -> Vec<StepReport> {
        self.reports
    }
}

/// Run `op`, retrying transient failures; returns the result and attempt count
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    step: &'static str,
    mut op: F,
) -> (Result<T, ResourceError>, u32)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ResourceError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return (Ok(value), attempt),
            Err(err) if err.is_transient() && attempt < max_attempts => {
                let delay = policy.delay_after(attempt);
                tracing::warn!(
                    step,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "transient failure, retrying"
                );
                crate::metrics::record_retry(step);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
            Err(err) => return (Err(err), attempt),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn throttled() -> ResourceError {
        ResourceError::Throttled("rate exceeded".to_string())
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(350));
        assert_eq!(policy.delay_after(40), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let (result, attempts) = with_retry(&RetryPolicy::immediate(3), "kb", move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(throttled())
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(result, Ok(7));
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn does_not_retry_permanent_failure() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let (result, attempts) = with_retry(&RetryPolicy::immediate(5), "kb", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(ResourceError::Validation("bad name".to_string()))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts, 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn best_effort_tolerates_optional_failure() {
        let settings = JobSettings::new()
            .with_retry(RetryPolicy::none())
            .with_failure_policy(FailurePolicy::BestEffort);
        let mut runner = StepRunner::new(&settings);

        let skipped = runner
            .optional("usage_plan", || async { Err::<(), _>(throttled()) })
            .await
            .unwrap();

        assert!(skipped.is_none());
        assert_eq!(runner.degraded(), vec!["usage_plan".to_string()]);
    }

    #[tokio::test]
    async fn fail_fast_fails_on_optional_failure() {
        let settings = JobSettings::new().with_retry(RetryPolicy::none());
        let mut runner = StepRunner::new(&settings);

        let err = runner
            .optional("usage_plan", || async { Err::<(), _>(throttled()) })
            .await
            .unwrap_err();

        assert_eq!(err.failed_step(), Some("usage_plan"));
        assert!(matches!(
            runner.reports()[0].status,
            StepStatus::Failed(_)
        ));
    }

    #[tokio::test]
    async fn required_failure_fails_even_best_effort() {
        let settings = JobSettings::new()
            .with_retry(RetryPolicy::none())
            .with_failure_policy(FailurePolicy::BestEffort);
        let mut runner = StepRunner::new(&settings);

        let result = runner
            .required("api_key", || async { Err::<(), _>(throttled()) })
            .await;

        assert!(matches!(
            result,
            Err(JobError::TransientRemote { step: "api_key", .. })
        ));
    }

    #[tokio::test]
    async fn rejected_step_is_not_reported_as_transient() {
        let settings = JobSettings::new().with_retry(RetryPolicy::immediate(3));
        let mut runner = StepRunner::new(&settings);

        let err = runner
            .required("storage_prefix", || async {
                Err::<(), _>(ResourceError::Validation("bad prefix".to_string()))
            })
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            JobError::StepRejected {
                step: "storage_prefix",
                ..
            }
        ));
        assert_eq!(err.kind(), FailureKind::Fatal);
        assert_eq!(runner.reports()[0].attempts, 1);
    }

    #[test]
    fn failure_policy_config_names() {
        let policy: FailurePolicy = serde_json::from_str("\"best-effort\"").unwrap();
        assert_eq!(policy, FailurePolicy::BestEffort);
    }
}
