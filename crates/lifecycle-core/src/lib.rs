//! Tenant Lifecycle Core
//!
//! Event-driven onboarding and offboarding of tenants in a shared SaaS
//! deployment:
//! - A typed lifecycle event contract and an in-process event bus
//! - Provisioning and deprovisioning jobs as explicit state machines
//! - A control plane that records registrations before publishing requests
//!   and updates them from job results
//! - A dispatcher that serialises jobs per tenant and enforces a job budget
//!
//! # Example
//!
//! ```rust,ignore
//! use lifecycle_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example(outputs: StackOutputs) -> Result<(), ControlPlaneError> {
//! let layer = Arc::new(InMemoryResourceLayer::new(outputs));
//! let mut system = SystemBuilder::new(layer).build();
//! system.start();
//!
//! let request = RegistrationRequest::new("acme", "ops@acme.io", Tier::Basic);
//! let registration = system.control_plane.register(request).await?;
//! println!("registered {} as {}", registration.tenant_id, registration.id);
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod bus;
pub mod context;
pub mod control_plane;
pub mod deprovisioning;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod job;
pub mod lease;
pub mod metrics;
pub mod policy;
pub mod provisioning;
pub mod registry;
pub mod resources;
pub mod state_machine;
pub mod system;
pub mod types;

pub use bus::{
    EventJournal, EventPublisher, EventSubscription, InMemoryEventBus, DEFAULT_JOURNAL_CAPACITY,
};
pub use context::{JobContext, StackOutputs, TenantResourceNames};
pub use control_plane::ControlPlane;
pub use deprovisioning::{DeprovisioningJob, DeprovisioningState};
pub use dispatcher::{DispatchStats, Dispatcher, DEFAULT_JOB_BUDGET};
pub use error::{
    BusError, ConfigError, ControlPlaneError, EventError, FailureKind, JobError, LeaseError,
    PreconditionFailure, RegistryError, ResourceError, StateMachineError,
};
pub use events::{EventEnvelope, EventName, LifecycleEvent};
pub use job::{JobOutcome, JobReport, JobRuntime};
pub use lease::{InMemoryLeaseStore, LeaseGuard, LeaseStore};
pub use policy::{FailurePolicy, JobSettings, RetryPolicy, StepCriticality};
pub use provisioning::{ProvisioningJob, ProvisioningState};
pub use registry::{FileRegistrationStore, InMemoryRegistrationStore, RegistrationStore};
pub use resources::{InMemoryResourceLayer, Provisioned, ResourceOp, SharedResourceLayer};
pub use state_machine::{JobState, StateTracker};
pub use system::{LifecycleSystem, SystemBuilder};
pub use types::{
    FailureSummary, RegistrationId, RegistrationPatch, RegistrationRequest, TenantConfig,
    TenantEndpoints, TenantId, TenantRegistration, TenantStatus, Tier,
};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with the lifecycle core
    pub use crate::{
        ControlPlane, ControlPlaneError, EventName, EventPublisher, FailurePolicy,
        InMemoryResourceLayer, JobSettings, LifecycleEvent, LifecycleSystem, RegistrationId,
        RegistrationRequest, RetryPolicy, SharedResourceLayer, StackOutputs, SystemBuilder,
        TenantId, TenantRegistration, TenantStatus, Tier,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
