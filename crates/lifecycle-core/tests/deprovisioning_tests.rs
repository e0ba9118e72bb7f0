use lifecycle_core::events::keys;
use lifecycle_core::{
    DeprovisioningJob, DeprovisioningState, EventName, JobOutcome, ProvisioningJob, ResourceError,
    ResourceOp, SharedResourceLayer, TenantId, Tier,
};
use lifecycle_test_utils::{
    deprovision_request, onboarding_request, usage_plan_id, JobHarness, BUCKET, USER_POOL,
};
use pretty_assertions::assert_eq;

async fn provisioned(tenant: &str) -> JobHarness {
    let harness = JobHarness::new();
    let report = ProvisioningJob::new(harness.runtime.clone())
        .run(onboarding_request(tenant))
        .await
        .unwrap();
    assert!(report.outcome.is_success());
    harness
}

#[tokio::test]
async fn removes_everything_provisioning_created() {
    let harness = provisioned("acme").await;
    harness
        .layer
        .put_object(BUCKET, "acme/docs/manual.pdf", b"pdf".to_vec())
        .await
        .unwrap();
    let job = DeprovisioningJob::new(harness.runtime.clone());

    let report = job.run(deprovision_request("acme")).await.unwrap();

    assert!(report.outcome.is_success());
    assert_eq!(
        report.states,
        vec![
            DeprovisioningState::Started,
            DeprovisioningState::DeletingIdentity,
            DeprovisioningState::DeletingResources,
            DeprovisioningState::Reporting,
            DeprovisioningState::Done,
        ]
    );

    let layer = &harness.layer;
    assert!(layer.object_keys(BUCKET, "acme/").is_empty());
    assert!(!layer.has_knowledge_base("acme"));
    assert!(!layer.has_ingestion_rule("acme-ingestion"));
    assert_eq!(layer.group_members(USER_POOL, "acme"), None);
    assert_eq!(layer.user_count(USER_POOL), 0);
    assert_eq!(layer.api_key_count(), 0);
    assert!(layer
        .usage_plan_keys(&usage_plan_id(Tier::Standard))
        .is_empty());

    let event = &report.event;
    assert_eq!(event.name, EventName::DeprovisionSuccess);
    assert_eq!(
        event.payload.get(keys::OBJECTS_DELETED).map(String::as_str),
        Some("2")
    );
}

#[tokio::test]
async fn leaves_other_tenants_alone() {
    let harness = provisioned("acme").await;
    ProvisioningJob::new(harness.runtime.clone())
        .run(onboarding_request("globex"))
        .await
        .unwrap();

    DeprovisioningJob::new(harness.runtime.clone())
        .run(deprovision_request("acme"))
        .await
        .unwrap();

    let layer = &harness.layer;
    assert_eq!(layer.object_keys(BUCKET, "globex/"), vec!["globex/".to_string()]);
    assert!(layer.has_knowledge_base("globex"));
    assert_eq!(layer.user_count(USER_POOL), 1);
    assert_eq!(layer.api_key_count(), 1);
}

#[tokio::test]
async fn rerun_treats_missing_resources_as_deleted() {
    let harness = provisioned("acme").await;
    let job = DeprovisioningJob::new(harness.runtime.clone());

    job.run(deprovision_request("acme")).await.unwrap();
    let again = job.run(deprovision_request("acme")).await.unwrap();

    assert!(again.outcome.is_success());
    assert_eq!(
        again.event.payload.get(keys::OBJECTS_DELETED).map(String::as_str),
        Some("0")
    );
}

#[tokio::test]
async fn never_provisioned_tenant_deprovisions_cleanly() {
    let harness = JobHarness::new();

    let report = DeprovisioningJob::new(harness.runtime.clone())
        .run(deprovision_request("ghost"))
        .await
        .unwrap();

    assert!(report.outcome.is_success());
}

#[tokio::test]
async fn user_delete_failure_reports_failure_and_keeps_resources() {
    let harness = provisioned("acme").await;
    harness.layer.fail_always(
        ResourceOp::DeleteUser,
        ResourceError::Unavailable("identity service down".to_string()),
    );
    let job = DeprovisioningJob::new(harness.runtime.clone());

    let report = job.run(deprovision_request("acme")).await.unwrap();

    let JobOutcome::Failed(summary) = &report.outcome else {
        panic!("expected failure");
    };
    assert_eq!(summary.failed_step.as_deref(), Some("admin_users"));
    assert_eq!(report.final_state(), Some(DeprovisioningState::Failed));
    assert!(harness.layer.has_knowledge_base("acme"));
    assert_eq!(
        harness.bus.names_for(&TenantId::new("acme")),
        vec![EventName::ProvisionSuccess, EventName::DeprovisionFailure]
    );

    // a later run finishes the job
    harness.layer.clear_faults();
    let retried = job.run(deprovision_request("acme")).await.unwrap();
    assert!(retried.outcome.is_success());
    assert!(!harness.layer.has_knowledge_base("acme"));
}

#[tokio::test]
async fn empty_tenant_is_rejected_without_touching_resources() {
    let harness = JobHarness::new();

    let report = DeprovisioningJob::new(harness.runtime.clone())
        .run(deprovision_request(""))
        .await
        .unwrap();

    assert!(!report.outcome.is_success());
    assert_eq!(harness.layer.calls(ResourceOp::ListTenantUsers), 0);
    assert_eq!(report.event.name, EventName::DeprovisionFailure);
}
