//! Provisioning job
//!
//! Consumes an onboarding request and carves the tenant's slice out of the
//! shared resource layer:
//!
//! | State | Steps |
//! |---|---|
//! | `AllocatingResources` | storage prefix, knowledge base, data source, ingestion rule (optional) |
//! | `CreatingIdentity` | user group, admin user, group membership |
//! | `GeneratingCredentials` | API key, usage plan (optional) |
//! | `Reporting` | ingestion trigger (outcome ignored), result event |
//!
//! Every step is create-if-not-exists, so re-running the job for an already
//! provisioned tenant creates nothing new. Completed steps are not rolled
//! back on failure.

use crate::context::{JobContext, TenantResourceNames};
use crate::error::{JobError, PreconditionFailure};
use crate::events::{JobFailure, LifecycleEvent, OnboardingRequest, ProvisionSuccess};
use crate::job::{publish_result, summarize, JobOutcome, JobReport, JobRuntime};
use crate::lease::LeaseGuard;
use crate::policy::{with_retry, StepRunner};
use crate::resources::{AdminUserSpec, SharedResourceLayer};
use crate::state_machine::{JobState, StateTracker};
use crate::types::{validate_email, TenantConfig};
use chrono::Utc;
use std::time::Instant;

/// Provisioning job states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProvisioningState {
    Started,
    AllocatingResources,
    CreatingIdentity,
    GeneratingCredentials,
    Reporting,
    Done,
    Failed,
}

impl JobState for ProvisioningState {
    fn allowed_transitions(self) -> &'static [Self] {
        use ProvisioningState::*;
        match self {
            Started => &[AllocatingResources, Failed],
            AllocatingResources => &[CreatingIdentity, Failed],
            CreatingIdentity => &[GeneratingCredentials, Failed],
            GeneratingCredentials => &[Reporting, Failed],
            Reporting => &[Done, Failed],
            Done | Failed => &[],
        }
    }
}

/// Runs provisioning for one onboarding request at a time
#[derive(Debug, Clone)]
pub struct ProvisioningJob {
    runtime: JobRuntime,
}

impl ProvisioningJob {
    /// Create job
    #[must_use]
    pub fn new(runtime: JobRuntime) -> Self {
        Self { runtime }
    }

    /// Run to completion and publish `PROVISION_SUCCESS` or `PROVISION_FAILURE`.
    ///
    /// Returns `Err` only when no result event was published: the tenant
    /// lease is held by another job, or the result could not be published.
    #[tracing::instrument(
        name = "provisioning",
        skip(self, request),
        fields(tenant_id = %request.tenant_id, registration_id = %request.registration_id)
    )]
    pub async fn run(
        &self,
        request: OnboardingRequest,
    ) -> Result<JobReport<ProvisioningState>, JobError> {
        let started = Instant::now();
        let mut tracker = StateTracker::new(ProvisioningState::Started);

        if let Err(e) = check_preconditions(&request) {
            tracing::warn!(error = %e, "onboarding request rejected");
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
            tracing::warn!(error = %e, "duplicate provisioning dropped");
            JobError::from(e)
        })?;

        tracing::info!(tier = %request.tier, "provisioning started");
        let mut runner = StepRunner::new(&self.runtime.settings);
        match self.execute(&request, &mut tracker, &mut runner).await {
            Ok(config) => {
                let degraded = runner.degraded();
                let event = LifecycleEvent::ProvisionSuccess(ProvisionSuccess {
                    registration_id: request.registration_id,
                    tenant_id: request.tenant_id.clone(),
                    config: config.clone(),
                    degraded_steps: degraded.clone(),
                });
                let envelope = publish_result(
                    self.runtime.publisher.as_ref(),
                    &self.runtime.settings.retry,
                    event,
                )
                .await?;
                tracker.advance(ProvisioningState::Done)?;

                let elapsed = started.elapsed().as_secs_f64();
                crate::metrics::record_job("provisioning", JobOutcome::Succeeded.label(), elapsed);
                tracing::info!(degraded = ?degraded, elapsed_secs = elapsed, "provisioning complete");

                Ok(JobReport {
                    registration_id: request.registration_id,
                    tenant_id: request.tenant_id,
                    outcome: JobOutcome::Succeeded,
                    config: Some(config),
                    degraded,
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
        request: &OnboardingRequest,
        tracker: &mut StateTracker<ProvisioningState>,
        runner: &mut StepRunner<'_>,
    ) -> Result<TenantConfig, JobError> {
        let layer: &dyn SharedResourceLayer = self.runtime.layer.as_ref();
        let ctx = load_context(layer, runner).await?;
        let names = TenantResourceNames::for_tenant(&request.tenant_id);

        let bucket = ctx.data_bucket.as_str();
        let pool = ctx.user_pool_id.as_str();
        let prefix = names.storage_prefix.as_str();

        tracker.advance(ProvisioningState::AllocatingResources)?;

        let marker = runner
            .required("storage_prefix", move || {
                layer.ensure_storage_prefix(bucket, prefix)
            })
            .await?;
        tracing::debug!(created = marker.was_created(), prefix, "storage prefix ready");

        let kb_name = names.knowledge_base.as_str();
        let knowledge_base_id = runner
            .required("knowledge_base", move || layer.ensure_knowledge_base(kb_name))
            .await?
            .into_inner();

        let kb_id = knowledge_base_id.as_str();
        let ds_name = names.data_source.as_str();
        let data_source_id = runner
            .required("data_source", move || {
                layer.ensure_data_source(kb_id, ds_name, bucket, prefix)
            })
            .await?
            .into_inner();

        let rule = names.ingestion_rule.as_str();
        let target = ctx.ingestion_function_arn.as_str();
        runner
            .optional("ingestion_rule", move || {
                layer.ensure_ingestion_rule(rule, bucket, prefix, target)
            })
            .await?;

        tracker.advance(ProvisioningState::CreatingIdentity)?;

        let group = names.user_group.as_str();
        runner
            .required("user_group", move || layer.ensure_user_group(pool, group))
            .await?;

        let admin = AdminUserSpec::tenant_admin(&request.tenant_id, &request.admin_email);
        let admin = &admin;
        let username = runner
            .required("admin_user", move || layer.ensure_admin_user(pool, admin))
            .await?
            .into_inner();

        let user = username.as_str();
        runner
            .required("group_membership", move || {
                layer.add_user_to_group(pool, user, group)
            })
            .await?;

        tracker.advance(ProvisioningState::GeneratingCredentials)?;

        let key_name = names.api_key.as_str();
        let api_key = runner
            .required("api_key", move || layer.ensure_api_key(key_name))
            .await?
            .into_inner();

        let plan = ctx.usage_plan(request.tier);
        let key_id = api_key.id.as_str();
        let tier = request.tier;
        runner
            .optional("usage_plan", move || async move {
                match plan {
                    Some(plan_id) => layer.attach_usage_plan(plan_id, key_id).await,
                    None => Err(crate::error::ResourceError::NotFound {
                        kind: "usage plan",
                        name: tier.to_string(),
                    }),
                }
            })
            .await?;

        tracker.advance(ProvisioningState::Reporting)?;

        // outcome deliberately ignored
        match layer.trigger_ingestion(kb_id, &data_source_id).await {
            Ok(run_id) => tracing::debug!(%run_id, "ingestion started"),
            Err(e) => tracing::warn!(error = %e, "ingestion trigger failed"),
        }

        Ok(TenantConfig {
            api_key: api_key.value,
            knowledge_base_id,
            data_source_id,
            identity_client_id: ctx.user_pool_client_id.clone(),
            storage_prefix: names.storage_prefix.clone(),
            endpoints: ctx.endpoints(),
            generated_at: Utc::now(),
        })
    }

    async fn report_failure(
        &self,
        request: &OnboardingRequest,
        mut tracker: StateTracker<ProvisioningState>,
        steps: Vec<crate::policy::StepReport>,
        error: JobError,
        started: Instant,
    ) -> Result<JobReport<ProvisioningState>, JobError> {
        tracker.advance(ProvisioningState::Failed)?;
        let summary = summarize(&error);
        tracing::error!(
            kind = %summary.kind,
            failed_step = ?summary.failed_step,
            error = %error,
            "provisioning failed"
        );

        let event = LifecycleEvent::ProvisionFailure(JobFailure {
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
        crate::metrics::record_job("provisioning", outcome.label(), started.elapsed().as_secs_f64());
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

fn check_preconditions(request: &OnboardingRequest) -> Result<(), PreconditionFailure> {
    request.tenant_id.validate()?;
    validate_email(&request.admin_email)?;
    if request.company_name.trim().is_empty() {
        return Err(PreconditionFailure::EmptyField("companyName"));
    }
    Ok(())
}

/// Load the job context once, retrying transient failures of the outputs call
pub(crate) async fn load_context(
    layer: &dyn SharedResourceLayer,
    runner: &StepRunner<'_>,
) -> Result<JobContext, JobError> {
    let (outputs, _) = with_retry(&runner.settings().retry, "job_context", move || {
        layer.stack_outputs()
    })
    .await;
    let outputs = outputs.map_err(|source| JobError::step("job_context", source))?;
    Ok(JobContext::from_outputs(&outputs)?)
}
