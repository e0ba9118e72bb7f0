//! Pieces shared by the provisioning and deprovisioning jobs

use crate::bus::EventPublisher;
use crate::error::{BusError, JobError};
use crate::events::{EventEnvelope, LifecycleEvent};
use crate::lease::LeaseStore;
use crate::policy::{JobSettings, RetryPolicy, StepReport};
use crate::resources::SharedResourceLayer;
use crate::state_machine::JobState;
use crate::types::{FailureSummary, RegistrationId, TenantConfig, TenantId};
use std::sync::Arc;

/// Collaborators every job runs against
#[derive(Clone)]
pub struct JobRuntime {
    pub layer: Arc<dyn SharedResourceLayer>,
    pub leases: Arc<dyn LeaseStore>,
    pub publisher: Arc<dyn EventPublisher>,
    pub settings: JobSettings,
}

impl JobRuntime {
    /// Create runtime with default settings
    pub fn new(
        layer: Arc<dyn SharedResourceLayer>,
        leases: Arc<dyn LeaseStore>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            layer,
            leases,
            publisher,
            settings: JobSettings::default(),
        }
    }

    /// With settings
    #[must_use]
    pub fn with_settings(mut self, settings: JobSettings) -> Self {
        self.settings = settings;
        self
    }
}

impl std::fmt::Debug for JobRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRuntime")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// How a job ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    Failed(FailureSummary),
}

impl JobOutcome {
    /// Check if the job succeeded
    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    /// Metric label
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Succeeded => "success",
            Self::Failed(_) => "failure",
        }
    }
}

/// What a finished job did
#[derive(Debug, Clone)]
pub struct JobReport<S: JobState> {
    pub registration_id: RegistrationId,
    pub tenant_id: TenantId,
    pub outcome: JobOutcome,
    /// Configuration produced by a successful provisioning job
    pub config: Option<TenantConfig>,
    /// Optional steps tolerated under the best-effort policy
    pub degraded: Vec<String>,
    pub steps: Vec<StepReport>,
    /// State path, starting state first
    pub states: Vec<S>,
    /// Result event as published
    pub event: EventEnvelope,
}

impl<S: JobState> JobReport<S> {
    /// Final state
    #[must_use]
    pub fn final_state(&self) -> Option<S> {
        self.states.last().copied()
    }
}

/// Failure summary carried on failure events and registrations
#[must_use]
pub fn summarize(err: &JobError) -> FailureSummary {
    FailureSummary {
        kind: err.kind(),
        message: err.to_string(),
        failed_step: err.failed_step().map(str::to_string),
    }
}

/// Publish a result event, retrying while the bus is unavailable
pub(crate) async fn publish_result(
    publisher: &dyn EventPublisher,
    retry: &RetryPolicy,
    event: LifecycleEvent,
) -> Result<EventEnvelope, JobError> {
    let max_attempts = retry.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match publisher.publish(event.clone()).await {
            Ok(envelope) => return Ok(envelope),
            Err(BusError::Unavailable(reason)) if attempt < max_attempts => {
                tracing::warn!(attempt, %reason, "bus unavailable, retrying result publish");
                let delay = retry.delay_after(attempt);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
}
