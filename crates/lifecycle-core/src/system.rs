//! Wiring of the in-process lifecycle system
//!
//! ```rust,ignore
//! let layer = Arc::new(InMemoryResourceLayer::new(outputs));
//! let mut system = SystemBuilder::new(layer).build();
//! system.start();
//! let registration = system.control_plane.register(request).await?;
//! ```

use crate::bus::{EventPublisher, InMemoryEventBus};
use crate::control_plane::ControlPlane;
use crate::dispatcher::{Dispatcher, DEFAULT_JOB_BUDGET};
use crate::job::JobRuntime;
use crate::lease::{InMemoryLeaseStore, LeaseStore};
use crate::policy::JobSettings;
use crate::registry::{InMemoryRegistrationStore, RegistrationStore};
use crate::resources::SharedResourceLayer;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Builder for [`LifecycleSystem`]
pub struct SystemBuilder {
    layer: Arc<dyn SharedResourceLayer>,
    store: Option<Arc<dyn RegistrationStore>>,
    leases: Option<Arc<dyn LeaseStore>>,
    settings: JobSettings,
    job_budget: Duration,
}

impl SystemBuilder {
    /// Start building over a resource layer
    pub fn new(layer: Arc<dyn SharedResourceLayer>) -> Self {
        Self {
            layer,
            store: None,
            leases: None,
            settings: JobSettings::default(),
            job_budget: DEFAULT_JOB_BUDGET,
        }
    }

    /// With a registration store; in-memory by default
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn RegistrationStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// With a lease store; in-memory by default
    #[must_use]
    pub fn with_leases(mut self, leases: Arc<dyn LeaseStore>) -> Self {
        self.leases = Some(leases);
        self
    }

    /// With job settings
    #[must_use]
    pub fn with_settings(mut self, settings: JobSettings) -> Self {
        self.settings = settings;
        self
    }

    /// With the per-job wall-clock budget
    #[must_use]
    pub fn with_job_budget(mut self, budget: Duration) -> Self {
        self.job_budget = budget;
        self
    }

    /// Assemble the system; call [`LifecycleSystem::start`] to begin dispatching
    #[must_use]
    pub fn build(self) -> LifecycleSystem {
        let bus = Arc::new(InMemoryEventBus::new());
        let publisher: Arc<dyn EventPublisher> = bus.clone();
        let store: Arc<dyn RegistrationStore> = match self.store {
            Some(store) => store,
            None => Arc::new(InMemoryRegistrationStore::new()),
        };
        let leases: Arc<dyn LeaseStore> = match self.leases {
            Some(leases) => leases,
            None => Arc::new(InMemoryLeaseStore::new()),
        };

        let control_plane =
            Arc::new(ControlPlane::new(store, publisher.clone()).with_job_budget(self.job_budget));
        let runtime = JobRuntime::new(self.layer.clone(), leases.clone(), publisher)
            .with_settings(self.settings);
        let dispatcher =
            Dispatcher::with_job_budget(runtime, control_plane.clone(), self.job_budget);

        LifecycleSystem {
            bus,
            layer: self.layer,
            leases,
            control_plane,
            dispatcher,
            tasks: Vec::new(),
        }
    }
}

/// Running lifecycle system
pub struct LifecycleSystem {
    pub bus: Arc<InMemoryEventBus>,
    pub layer: Arc<dyn SharedResourceLayer>,
    pub leases: Arc<dyn LeaseStore>,
    pub control_plane: Arc<ControlPlane>,
    pub dispatcher: Dispatcher,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for LifecycleSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleSystem")
            .field("dispatcher", &self.dispatcher)
            .field("tasks", &self.tasks.len())
            .finish_non_exhaustive()
    }
}

impl LifecycleSystem {
    /// Subscribe the dispatcher to the bus
    pub fn start(&mut self) {
        let subscription = self.bus.subscribe();
        self.tasks.push(self.dispatcher.spawn(subscription));
        tracing::info!("lifecycle dispatcher started");
    }

    /// Run the reconciliation sweep every `every`
    pub fn start_reconciler(&mut self, every: Duration) {
        let control_plane = self.control_plane.clone();
        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = control_plane.reconcile().await {
                    tracing::warn!(error = %e, "reconciliation sweep failed");
                }
            }
        }));
    }

    /// Close the bus and stop background tasks
    pub async fn shutdown(mut self) {
        self.bus.close();
        self.dispatcher.shutdown();
        for task in &self.tasks {
            task.abort();
        }
        futures::future::join_all(self.tasks.drain(..)).await;
        tracing::info!("lifecycle system stopped");
    }
}
