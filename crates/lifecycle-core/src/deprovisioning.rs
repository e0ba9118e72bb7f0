//! Deprovisioning job
//!
//! Releases everything provisioning created for a tenant. Identity goes
//! first so the tenant loses access before its data is removed. A resource
//! that is already gone counts as deleted, which makes the job safe to
//! re-run after a partial failure.

use crate::context::TenantResourceNames;
use crate::error::{JobError, ResourceError};
use crate::events::{DeprovisionRequest, DeprovisionSuccess, JobFailure, LifecycleEvent};
use crate::job::{publish_result, summarize, JobOutcome, JobReport, JobRuntime};
use crate::lease::LeaseGuard;
use crate::policy::{StepReport, StepRunner};
use crate::provisioning::load_context;
use crate::resources::{absent_ok, SharedResourceLayer};
use crate::state_machine::{JobState, StateTracker};
use std::time::Instant;

/// Deprovisioning job states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeprovisioningState {
    Started,
    DeletingIdentity,
    DeletingResources,
    Reporting,
    Done,
    Failed,
}

impl JobState for DeprovisioningState {
    fn allowed_transitions(self) -> &'static [Self] {
        use DeprovisioningState::*;
        match self {
            Started => &[DeletingIdentity, Failed],
            DeletingIdentity => &[DeletingResources, Failed],
            DeletingResources => &[Reporting, Failed],
            Reporting => &[Done, Failed],
            Done | Failed => &[],
        }
    }
}

/// Runs deprovisioning for one request at a time
#[derive(Debug, Clone)]
pub struct DeprovisioningJob {
    runtime: JobRuntime,
}

impl DeprovisioningJob {
    /// Create job
    #[must_use]
    pub fn new(runtime: JobRuntime) -> Self {
        Self { runtime }
    }

    /// Run to completion and publish `DEPROVISION_SUCCESS` or `DEPROVISION_FAILURE`.
    #[tracing::instrument(
        name = "deprovisioning",
        skip(self, request),
        fields(tenant_id = %request.tenant_id, registration_id = %request.registration_id)
    )]
    pub async fn run(
        &self,
        request: DeprovisionRequest,
    ) -> Result<JobReport<DeprovisioningState>, JobError> {
        let started = Instant::now();
        let mut tracker = StateTracker::new(DeprovisioningState::Started);

        if let Err(e) = request.tenant_id.validate() {
            return self
                .report_failure(&request, tracker, Vec::new(), e.into(), started)
                .await;
        }

        let _lease = LeaseGuard::acquire(
            self.runtime.leases.clone(),
            &request.tenant_id,
            &self.runtime.settings.holder,
            self.runtime.settings.lease_ttl,
        )
        .map_err(|e| {
            tracing::warn!(error = %e, "duplicate deprovisioning dropped");
            JobError::from(e)
        })?;

        tracing::info!("deprovisioning started");
        let mut runner = StepRunner::new(&self.runtime.settings);
        match self.execute(&request, &mut tracker, &mut runner).await {
            Ok(objects_deleted) => {
                let event = LifecycleEvent::DeprovisionSuccess(DeprovisionSuccess {
                    registration_id: request.registration_id,
                    tenant_id: request.tenant_id.clone(),
                    objects_deleted,
                });
                let envelope = publish_result(
                    self.runtime.publisher.as_ref(),
                    &self.runtime.settings.retry,
                    event,
                )
                .await?;
                tracker.advance(DeprovisioningState::Done)?;

                let elapsed = started.elapsed().as_secs_f64();
                crate::metrics::record_job("deprovisioning", JobOutcome::Succeeded.label(), elapsed);
                tracing::info!(objects_deleted, elapsed_secs = elapsed, "deprovisioning complete");

                Ok(JobReport {
                    registration_id: request.registration_id,
                    tenant_id: request.tenant_id,
                    outcome: JobOutcome::Succeeded,
                    config: None,
                    degraded: runner.degraded(),
                    steps: runner.into_reports(),
                    states: tracker.into_history(),
                    event: envelope,
                })
            }
            Err(e) => {
                let steps = runner.into_reports();
                self.report_failure(&request, tracker, steps, e, started)
                    .await
            }
        }
    }

    async fn execute(
        &self,
        request: &DeprovisionRequest,
        tracker: &mut StateTracker<DeprovisioningState>,
        runner: &mut StepRunner<'_>,
    ) -> Result<usize, JobError> {
        let layer: &dyn SharedResourceLayer = self.runtime.layer.as_ref();
        let ctx = load_context(layer, runner).await?;
        let names = TenantResourceNames::for_tenant(&request.tenant_id);
        let tenant = &request.tenant_id;
        let pool = ctx.user_pool_id.as_str();
        let bucket = ctx.data_bucket.as_str();

        tracker.advance(DeprovisioningState::DeletingIdentity)?;

        let removed = runner
            .required("admin_users", move || async move {
                let users = layer.list_tenant_users(pool, tenant).await?;
                for user in &users {
                    absent_ok(layer.delete_user(pool, user).await)?;
                }
                Ok::<_, ResourceError>(users.len())
            })
            .await?;
        tracing::debug!(removed, "tenant users removed");

        let group = names.user_group.as_str();
        runner
            .required("user_group", move || async move {
                absent_ok(layer.delete_user_group(pool, group).await)
            })
            .await?;

        tracker.advance(DeprovisioningState::DeletingResources)?;

        let key_name = names.api_key.as_str();
        runner
            .required("api_key", move || async move {
                absent_ok(layer.delete_api_key(key_name).await)
            })
            .await?;

        let rule = names.ingestion_rule.as_str();
        runner
            .required("ingestion_rule", move || async move {
                absent_ok(layer.delete_ingestion_rule(rule).await)
            })
            .await?;

        let kb = names.knowledge_base.as_str();
        let ds = names.data_source.as_str();
        runner
            .required("data_source", move || async move {
                absent_ok(layer.delete_data_source(kb, ds).await)
            })
            .await?;
        runner
            .required("knowledge_base", move || async move {
                absent_ok(layer.delete_knowledge_base(kb).await)
            })
            .await?;

        let prefix = names.storage_prefix.as_str();
        let objects_deleted = runner
            .required("storage_objects", move || async move {
                let keys = layer.list_objects(bucket, prefix).await?;
                if keys.is_empty() {
                    return Ok(0);
                }
                layer.delete_objects(bucket, &keys).await
            })
            .await?;

        tracker.advance(DeprovisioningState::Reporting)?;
        Ok(objects_deleted)
    }

    async fn report_failure(
        &self,
        request: &DeprovisionRequest,
        mut tracker: StateTracker<DeprovisioningState>,
        steps: Vec<StepReport>,
        error: JobError,
        started: Instant,
    ) -> Result<JobReport<DeprovisioningState>, JobError> {
        tracker.advance(DeprovisioningState::Failed)?;
        let summary = summarize(&error);
        tracing::error!(
            kind = %summary.kind,
            failed_step = ?summary.failed_step,
            error = %error,
            "deprovisioning failed"
        );

        let event = LifecycleEvent::DeprovisionFailure(JobFailure {
            registration_id: request.registration_id,
            tenant_id: request.tenant_id.clone(),
            summary: summary.clone(),
        });
        let envelope = publish_result(
            self.runtime.publisher.as_ref(),
            &self.runtime.settings.retry,
            event,
        )
        .await?;

        let outcome = JobOutcome::Failed(summary);
        crate::metrics::record_job("deprovisioning", outcome.label(), started.elapsed().as_secs_f64());
        Ok(JobReport {
            registration_id: request.registration_id,
            tenant_id: request.tenant_id.clone(),
            outcome,
            config: None,
            degraded: Vec::new(),
            steps,
            states: tracker.into_history(),
            event: envelope,
        })
    }
}
