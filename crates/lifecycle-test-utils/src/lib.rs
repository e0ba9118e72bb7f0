//! Testing utilities for the tenant lifecycle workspace
//!
//! Shared fixtures, a pre-wired in-memory system and polling helpers.

#![allow(missing_docs)]

use lifecycle_core::context::output_keys;
use lifecycle_core::events::{DeprovisionRequest, OnboardingRequest};
use lifecycle_core::{
    ControlPlane, InMemoryEventBus, InMemoryLeaseStore, InMemoryResourceLayer, JobRuntime,
    JobSettings, LifecycleSystem, RegistrationId, RegistrationRequest, RegistrationStore,
    RetryPolicy, StackOutputs, SystemBuilder, TenantId, TenantRegistration, TenantStatus, Tier,
};
use std::sync::Arc;
use std::time::Duration;

pub const BUCKET: &str = "tenant-data";
pub const USER_POOL: &str = "pool-main";
pub const USER_POOL_CLIENT: &str = "client-main";
pub const API_URL: &str = "https://api.example.test/prod";
pub const INGESTION_FUNCTION: &str = "arn:lambda:ingest";

/// Usage plan id published for `tier`
pub fn usage_plan_id(tier: Tier) -> String {
    format!("plan-{tier}")
}

/// Outputs with every key jobs read, including a usage plan per tier
pub fn stack_outputs() -> StackOutputs {
    let mut outputs = StackOutputs::new()
        .with(output_keys::DATA_BUCKET, BUCKET)
        .with(output_keys::USER_POOL, USER_POOL)
        .with(output_keys::USER_POOL_CLIENT, USER_POOL_CLIENT)
        .with(output_keys::API_URL, API_URL)
        .with(output_keys::INGESTION_FUNCTION, INGESTION_FUNCTION);
    for tier in Tier::ALL {
        outputs.insert(
            format!("{}{}", output_keys::USAGE_PLAN_PREFIX, tier.as_str()),
            usage_plan_id(tier),
        );
    }
    outputs
}

pub fn resource_layer() -> Arc<InMemoryResourceLayer> {
    Arc::new(InMemoryResourceLayer::new(stack_outputs()))
}

/// Settings that retry immediately
pub fn fast_settings() -> JobSettings {
    JobSettings::new()
        .with_retry(RetryPolicy::immediate(3))
        .with_lease_ttl(Duration::from_secs(60))
}

pub fn registration_request(tenant: &str) -> RegistrationRequest {
    RegistrationRequest::new(tenant, format!("admin@{tenant}.example"), Tier::Standard)
        .with_company_name(format!("{tenant} Ltd"))
}

pub fn onboarding_request(tenant: &str) -> OnboardingRequest {
    OnboardingRequest {
        registration_id: RegistrationId::new(),
        tenant_id: TenantId::new(tenant),
        tier: Tier::Standard,
        company_name: format!("{tenant} Ltd"),
        admin_email: format!("admin@{tenant}.example"),
    }
}

pub fn deprovision_request(tenant: &str) -> DeprovisionRequest {
    DeprovisionRequest {
        registration_id: RegistrationId::new(),
        tenant_id: TenantId::new(tenant),
    }
}

/// Jobs wired to an in-memory layer, bus and lease store
pub struct JobHarness {
    pub layer: Arc<InMemoryResourceLayer>,
    pub bus: Arc<InMemoryEventBus>,
    pub leases: Arc<InMemoryLeaseStore>,
    pub runtime: JobRuntime,
}

impl JobHarness {
    pub fn new() -> Self {
        Self::with_settings(fast_settings())
    }

    pub fn with_settings(settings: JobSettings) -> Self {
        let layer = resource_layer();
        let bus = Arc::new(InMemoryEventBus::new());
        let leases = Arc::new(InMemoryLeaseStore::new());
        let runtime = JobRuntime::new(layer.clone(), leases.clone(), bus.clone())
            .with_settings(settings);
        Self {
            layer,
            bus,
            leases,
            runtime,
        }
    }
}

impl Default for JobHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Started in-memory system plus a typed handle on its resource layer
pub struct TestSystem {
    pub system: LifecycleSystem,
    pub layer: Arc<InMemoryResourceLayer>,
}

impl TestSystem {
    /// Started system with fast settings and in-memory stores
    pub fn start() -> Self {
        Self::build(|builder| builder)
    }

    /// Started system customised by `configure`
    pub fn build(configure: impl FnOnce(SystemBuilder) -> SystemBuilder) -> Self {
        let layer = resource_layer();
        let builder = SystemBuilder::new(layer.clone()).with_settings(fast_settings());
        let mut system = configure(builder).build();
        system.start();
        Self { system, layer }
    }

    /// Started system over an existing registration store
    pub fn with_store(store: Arc<dyn RegistrationStore>) -> Self {
        Self::build(|builder| builder.with_store(store))
    }

    pub fn control_plane(&self) -> &ControlPlane {
        &self.system.control_plane
    }

    pub fn bus(&self) -> &InMemoryEventBus {
        &self.system.bus
    }

    /// Wait for the registration to reach `status`
    pub async fn wait_for_status(
        &self,
        id: RegistrationId,
        status: TenantStatus,
    ) -> TenantRegistration {
        wait_for_status(self.control_plane(), id, status, Duration::from_secs(5)).await
    }
}

/// Poll until the registration reaches `status`; panics after `timeout`
pub async fn wait_for_status(
    control_plane: &ControlPlane,
    id: RegistrationId,
    status: TenantStatus,
    timeout: Duration,
) -> TenantRegistration {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let current = control_plane
            .get(id)
            .await
            .expect("registration exists");
        if current.status == status {
            return current;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "registration {id} stuck in {} waiting for {status}",
            current.status
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
