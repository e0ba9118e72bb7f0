use chrono::Utc;
use lifecycle_core::events::{keys, DeprovisionSuccess, JobFailure, ProvisionSuccess};
use lifecycle_core::{
    ControlPlane, ControlPlaneError, EventEnvelope, EventName, FailureKind, FailureSummary,
    FileRegistrationStore, InMemoryEventBus, InMemoryRegistrationStore, LifecycleEvent,
    RegistrationPatch, RegistrationStore, TenantConfig, TenantEndpoints, TenantId,
    TenantRegistration, TenantStatus, Tier,
};
use lifecycle_test_utils::{registration_request, API_URL};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

struct Fixture {
    bus: Arc<InMemoryEventBus>,
    plane: ControlPlane,
}

fn fixture() -> Fixture {
    with_store(Arc::new(InMemoryRegistrationStore::new()))
}

fn with_store(store: Arc<dyn RegistrationStore>) -> Fixture {
    let bus = Arc::new(InMemoryEventBus::new());
    let plane = ControlPlane::new(store, bus.clone());
    Fixture { bus, plane }
}

fn with_budget(store: Arc<dyn RegistrationStore>, budget: Duration) -> Fixture {
    let bus = Arc::new(InMemoryEventBus::new());
    let plane = ControlPlane::new(store, bus.clone()).with_job_budget(budget);
    Fixture { bus, plane }
}

fn config(tenant: &str) -> TenantConfig {
    TenantConfig {
        api_key: format!("{tenant}-key"),
        knowledge_base_id: "kb-000001".to_string(),
        data_source_id: "ds-000002".to_string(),
        identity_client_id: "client-main".to_string(),
        storage_prefix: format!("{tenant}/"),
        endpoints: TenantEndpoints {
            api_url: API_URL.to_string(),
            upload_url: format!("{API_URL}/upload"),
            query_url: format!("{API_URL}/query"),
        },
        generated_at: Utc::now(),
    }
}

fn success(registration: &TenantRegistration) -> LifecycleEvent {
    LifecycleEvent::ProvisionSuccess(ProvisionSuccess {
        registration_id: registration.id,
        tenant_id: registration.tenant_id.clone(),
        config: config(registration.tenant_id.as_str()),
        degraded_steps: Vec::new(),
    })
}

fn failure(registration: &TenantRegistration) -> JobFailure {
    JobFailure {
        registration_id: registration.id,
        tenant_id: registration.tenant_id.clone(),
        summary: FailureSummary {
            kind: FailureKind::TransientRemoteFailure,
            message: "user_group: throttled".to_string(),
            failed_step: Some("user_group".to_string()),
        },
    }
}

async fn complete(fx: &Fixture, tenant: &str) -> TenantRegistration {
    let registration = fx.plane.register(registration_request(tenant)).await.unwrap();
    fx.plane
        .apply_event(&success(&registration))
        .await
        .unwrap()
        .expect("success applies")
}

#[tokio::test]
async fn register_records_then_publishes() {
    let fx = fixture();

    let registration = fx.plane.register(registration_request("acme")).await.unwrap();

    assert_eq!(registration.status, TenantStatus::Provisioning);
    assert_eq!(registration.unpublished, None);
    assert_eq!(registration.company_name, "acme Ltd");

    let published = fx.bus.published();
    assert_eq!(published.len(), 1);
    let request = &published[0];
    assert_eq!(request.name, EventName::OnboardingRequest);
    assert_eq!(request.correlation_id, "acme");
    assert_eq!(
        request.payload.get(keys::REGISTRATION_ID),
        Some(&registration.id.to_string())
    );
}

#[tokio::test]
async fn failed_publish_is_delivered_by_reconcile() {
    let fx = fixture();
    fx.bus.fail_next_publishes(1);

    let registration = fx.plane.register(registration_request("acme")).await.unwrap();

    assert_eq!(registration.status, TenantStatus::Pending);
    assert_eq!(registration.unpublished, Some(EventName::OnboardingRequest));
    assert!(fx.bus.published().is_empty());

    assert_eq!(fx.plane.reconcile().await.unwrap(), 1);
    let after = fx.plane.get(registration.id).await.unwrap();
    assert_eq!(after.status, TenantStatus::Provisioning);
    assert_eq!(after.unpublished, None);
    assert_eq!(fx.bus.published().len(), 1);

    assert_eq!(fx.plane.reconcile().await.unwrap(), 0);
    assert_eq!(fx.bus.published().len(), 1);
}

#[tokio::test]
async fn unpublished_request_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("registrations.json");

    let id = {
        let store = FileRegistrationStore::open(&path).await.unwrap();
        let fx = with_store(Arc::new(store));
        fx.bus.fail_next_publishes(1);
        fx.plane
            .register(registration_request("acme"))
            .await
            .unwrap()
            .id
    };

    let store = FileRegistrationStore::open(&path).await.unwrap();
    let fx = with_store(Arc::new(store));
    assert_eq!(
        fx.plane.get(id).await.unwrap().status,
        TenantStatus::Pending
    );

    assert_eq!(fx.plane.reconcile().await.unwrap(), 1);
    assert_eq!(
        fx.bus.names_for(&TenantId::new("acme")),
        vec![EventName::OnboardingRequest]
    );
    assert_eq!(
        fx.plane.get(id).await.unwrap().status,
        TenantStatus::Provisioning
    );
}

#[tokio::test]
async fn stalled_provisioning_is_failed_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("registrations.json");

    // request acknowledged, but the process stops before any job result
    let id = {
        let store = FileRegistrationStore::open(&path).await.unwrap();
        let fx = with_store(Arc::new(store));
        let registration = fx.plane.register(registration_request("acme")).await.unwrap();
        assert_eq!(registration.status, TenantStatus::Provisioning);
        assert_eq!(registration.unpublished, None);
        registration.id
    };

    let store = FileRegistrationStore::open(&path).await.unwrap();
    let fx = with_budget(Arc::new(store), Duration::from_millis(20));
    tokio::time::sleep(Duration::from_millis(80)).await;

    assert_eq!(fx.plane.reconcile().await.unwrap(), 1);
    let failed = fx.plane.get(id).await.unwrap();
    assert_eq!(failed.status, TenantStatus::Failed);
    assert_eq!(failed.failure.map(|f| f.kind), Some(FailureKind::Timeout));
    assert_eq!(fx.plane.reconcile().await.unwrap(), 0);

    let deprovisioning = fx.plane.deprovision(id).await.unwrap();
    assert_eq!(deprovisioning.status, TenantStatus::Deprovisioning);
}

#[tokio::test]
async fn stalled_deprovisioning_is_failed() {
    let fx = with_budget(
        Arc::new(InMemoryRegistrationStore::new()),
        Duration::from_millis(20),
    );
    let registration = complete(&fx, "acme").await;
    fx.plane.deprovision(registration.id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;

    assert_eq!(fx.plane.reconcile().await.unwrap(), 1);
    let failed = fx.plane.get(registration.id).await.unwrap();
    assert_eq!(failed.status, TenantStatus::Failed);
    assert_eq!(failed.failure.map(|f| f.kind), Some(FailureKind::Timeout));

    // the tenant can be onboarded again
    let again = fx.plane.register(registration_request("acme")).await.unwrap();
    assert_eq!(again.id, registration.id);
    assert_eq!(again.status, TenantStatus::Provisioning);
}

#[tokio::test]
async fn in_flight_registration_within_budget_is_left_alone() {
    let fx = with_budget(
        Arc::new(InMemoryRegistrationStore::new()),
        Duration::from_secs(60),
    );
    let registration = fx.plane.register(registration_request("acme")).await.unwrap();

    assert_eq!(fx.plane.reconcile().await.unwrap(), 0);
    assert_eq!(
        fx.plane.get(registration.id).await.unwrap().status,
        TenantStatus::Provisioning
    );
}

#[tokio::test]
async fn duplicate_registration_while_in_flight_conflicts() {
    let fx = fixture();
    fx.plane.register(registration_request("acme")).await.unwrap();

    let err = fx
        .plane
        .register(registration_request("acme"))
        .await
        .unwrap_err();

    assert!(matches!(err, ControlPlaneError::Conflict(_)));
    assert_eq!(fx.plane.list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn success_completes_registration() {
    let fx = fixture();

    let done = complete(&fx, "acme").await;

    assert_eq!(done.status, TenantStatus::Complete);
    assert_eq!(done.active_config().map(|c| c.api_key.as_str()), Some("acme-key"));
    assert_eq!(done.failure, None);
}

#[tokio::test]
async fn success_may_overtake_publish_ack() {
    let fx = fixture();
    fx.bus.fail_next_publishes(1);
    let pending = fx.plane.register(registration_request("acme")).await.unwrap();
    assert_eq!(pending.status, TenantStatus::Pending);

    let done = fx
        .plane
        .apply_event(&success(&pending))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(done.status, TenantStatus::Complete);
    assert_eq!(done.unpublished, None);
    assert_eq!(fx.plane.reconcile().await.unwrap(), 0);
}

#[tokio::test]
async fn failure_records_summary() {
    let fx = fixture();
    let registration = fx.plane.register(registration_request("acme")).await.unwrap();

    let failed = fx
        .plane
        .apply_event(&LifecycleEvent::ProvisionFailure(failure(&registration)))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(failed.status, TenantStatus::Failed);
    let summary = failed.failure.unwrap();
    assert_eq!(summary.kind, FailureKind::TransientRemoteFailure);
    assert_eq!(summary.failed_step.as_deref(), Some("user_group"));
    assert_eq!(failed.config, None);
}

#[tokio::test]
async fn failure_after_complete_is_ignored() {
    let fx = fixture();
    let done = complete(&fx, "acme").await;

    let applied = fx
        .plane
        .apply_event(&LifecycleEvent::ProvisionFailure(failure(&done)))
        .await
        .unwrap();

    assert_eq!(applied, None);
    let current = fx.plane.get(done.id).await.unwrap();
    assert_eq!(current.status, TenantStatus::Complete);
    assert_eq!(current.version, done.version);
}

#[tokio::test]
async fn duplicate_success_replaces_config() {
    let fx = fixture();
    let done = complete(&fx, "acme").await;

    let mut event = success(&done);
    if let LifecycleEvent::ProvisionSuccess(s) = &mut event {
        s.config.api_key = "rotated".to_string();
    }
    let again = fx.plane.apply_event(&event).await.unwrap().unwrap();

    assert_eq!(again.status, TenantStatus::Complete);
    assert_eq!(again.config.unwrap().api_key, "rotated");
}

#[tokio::test]
async fn results_for_unknown_or_mismatched_registrations_are_ignored() {
    let fx = fixture();
    let registration = fx.plane.register(registration_request("acme")).await.unwrap();

    let mut stranger = registration.clone();
    stranger.id = lifecycle_core::RegistrationId::new();
    assert_eq!(fx.plane.apply_event(&success(&stranger)).await.unwrap(), None);

    let mut mismatched = registration.clone();
    mismatched.tenant_id = TenantId::new("globex");
    assert_eq!(
        fx.plane.apply_event(&success(&mismatched)).await.unwrap(),
        None
    );

    assert_eq!(
        fx.plane.get(registration.id).await.unwrap().status,
        TenantStatus::Provisioning
    );
}

#[tokio::test]
async fn malformed_envelope_is_dropped() {
    let fx = fixture();
    let registration = fx.plane.register(registration_request("acme")).await.unwrap();
    let mut envelope = EventEnvelope::seal(&success(&registration));
    envelope.payload.shift_remove(keys::API_KEY);

    assert_eq!(fx.plane.apply_envelope(&envelope).await.unwrap(), None);
    assert_eq!(
        fx.plane.get(registration.id).await.unwrap().status,
        TenantStatus::Provisioning
    );
}

#[tokio::test]
async fn reonboarding_reuses_failed_registration() {
    let fx = fixture();
    let registration = fx.plane.register(registration_request("acme")).await.unwrap();
    fx.plane
        .apply_event(&LifecycleEvent::ProvisionFailure(failure(&registration)))
        .await
        .unwrap();

    let retry = fx.plane.register(registration_request("acme")).await.unwrap();

    assert_eq!(retry.id, registration.id);
    assert_eq!(retry.status, TenantStatus::Provisioning);
    assert_eq!(retry.failure, None);
    assert_eq!(fx.plane.list().await.unwrap().len(), 1);
    assert_eq!(
        fx.bus.names_for(&TenantId::new("acme")),
        vec![EventName::OnboardingRequest, EventName::OnboardingRequest]
    );
}

#[tokio::test]
async fn deleted_tenant_gets_a_new_registration() {
    let fx = fixture();
    let done = complete(&fx, "acme").await;
    fx.plane.deprovision(done.id).await.unwrap();
    fx.plane
        .apply_event(&LifecycleEvent::DeprovisionSuccess(DeprovisionSuccess {
            registration_id: done.id,
            tenant_id: done.tenant_id.clone(),
            objects_deleted: 1,
        }))
        .await
        .unwrap();

    let again = fx.plane.register(registration_request("acme")).await.unwrap();

    assert_ne!(again.id, done.id);
    assert_eq!(fx.plane.list().await.unwrap().len(), 2);
    assert_eq!(
        fx.plane.get(done.id).await.unwrap().status,
        TenantStatus::Deleted
    );
}

#[tokio::test]
async fn deprovision_flow() {
    let fx = fixture();
    let done = complete(&fx, "acme").await;

    let requested = fx.plane.deprovision(done.id).await.unwrap();
    assert_eq!(requested.status, TenantStatus::Deprovisioning);
    assert_eq!(requested.unpublished, None);
    assert_eq!(
        fx.bus.names_for(&TenantId::new("acme")).last(),
        Some(&EventName::DeprovisionRequest)
    );

    let deleted = fx
        .plane
        .apply_event(&LifecycleEvent::DeprovisionSuccess(DeprovisionSuccess {
            registration_id: done.id,
            tenant_id: done.tenant_id.clone(),
            objects_deleted: 3,
        }))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(deleted.status, TenantStatus::Deleted);
    assert_eq!(deleted.config, None);
}

#[tokio::test]
async fn deprovision_failure_marks_failed() {
    let fx = fixture();
    let done = complete(&fx, "acme").await;
    fx.plane.deprovision(done.id).await.unwrap();

    let failed = fx
        .plane
        .apply_event(&LifecycleEvent::DeprovisionFailure(failure(&done)))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(failed.status, TenantStatus::Failed);
    assert_eq!(failed.active_config(), None);

    // a failed deprovisioning may be retried
    let retried = fx.plane.deprovision(done.id).await.unwrap();
    assert_eq!(retried.status, TenantStatus::Deprovisioning);
}

#[tokio::test]
async fn deprovision_requires_settled_registration() {
    let fx = fixture();
    let registration = fx.plane.register(registration_request("acme")).await.unwrap();

    let err = fx.plane.deprovision(registration.id).await.unwrap_err();
    assert!(matches!(err, ControlPlaneError::Conflict(_)));

    let missing = lifecycle_core::RegistrationId::new();
    assert!(matches!(
        fx.plane.deprovision(missing).await,
        Err(ControlPlaneError::NotFound(id)) if id == missing
    ));
}

#[tokio::test]
async fn patch_updates_metadata_only() {
    let fx = fixture();
    let done = complete(&fx, "acme").await;

    let patched = fx
        .plane
        .update(
            done.id,
            RegistrationPatch {
                email: Some("ops@acme.example".to_string()),
                tier: Some(Tier::Premium),
                company_name: None,
            },
        )
        .await
        .unwrap();

    assert_eq!(patched.admin_email, "ops@acme.example");
    assert_eq!(patched.tier, Tier::Premium);
    assert_eq!(patched.company_name, done.company_name);
    assert_eq!(patched.status, TenantStatus::Complete);
    assert_eq!(patched.config, done.config);
    assert_eq!(patched.version, done.version + 1);
    // no job is requested
    assert_eq!(fx.bus.published().len(), 1);
}

#[tokio::test]
async fn patch_rejects_invalid_input() {
    let fx = fixture();
    let done = complete(&fx, "acme").await;

    let empty = fx
        .plane
        .update(done.id, RegistrationPatch::default())
        .await
        .unwrap_err();
    assert!(matches!(empty, ControlPlaneError::InvalidUpdate(_)));

    let bad_email = fx
        .plane
        .update(
            done.id,
            RegistrationPatch {
                email: Some("not-an-email".to_string()),
                ..RegistrationPatch::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(bad_email, ControlPlaneError::InvalidUpdate(_)));

    let blank_company = fx
        .plane
        .update(
            done.id,
            RegistrationPatch {
                company_name: Some("  ".to_string()),
                ..RegistrationPatch::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(blank_company, ControlPlaneError::InvalidUpdate(_)));
}

#[tokio::test]
async fn patch_conflicts_while_job_in_flight() {
    let fx = fixture();
    let registration = fx.plane.register(registration_request("acme")).await.unwrap();

    let err = fx
        .plane
        .update(
            registration.id,
            RegistrationPatch {
                tier: Some(Tier::Basic),
                ..RegistrationPatch::default()
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(err, ControlPlaneError::Conflict(_)));
}
