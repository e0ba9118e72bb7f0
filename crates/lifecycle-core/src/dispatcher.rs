//! Event dispatcher
//!
//! Routes bus events:
//! - request events go to a per-tenant lane, a task that runs that tenant's
//!   jobs one at a time in publication order; different tenants run
//!   concurrently. A lane retires once its queue drains.
//! - result events go to the control plane, in publication order
//!
//! Every job runs under the configured wall-clock budget. A job that exceeds
//! it is dropped and reported as a failure of kind `Timeout`; completed steps
//! are not cleaned up.

use crate::bus::{EventPublisher, EventSubscription};
use crate::control_plane::ControlPlane;
use crate::deprovisioning::DeprovisioningJob;
use crate::error::JobError;
use crate::events::{EventEnvelope, JobFailure, LifecycleEvent};
use crate::job::{publish_result, summarize, JobRuntime};
use crate::policy::RetryPolicy;
use crate::provisioning::ProvisioningJob;
use crate::types::TenantId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Default wall-clock budget per job
pub const DEFAULT_JOB_BUDGET: Duration = Duration::from_secs(15 * 60);

/// Messages handled by a tenant lane
#[derive(Debug)]
enum LaneMessage {
    /// Run the job for a request event
    Run(LifecycleEvent),
    /// Finish queued work and stop
    Shutdown,
}

/// Dispatcher statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub jobs_started: u64,
    pub jobs_finished: u64,
    pub jobs_timed_out: u64,
    /// Requests dropped because another job held the tenant lease
    pub jobs_dropped: u64,
    pub results_applied: u64,
    pub malformed: u64,
}

struct Shared {
    provisioning: ProvisioningJob,
    deprovisioning: DeprovisioningJob,
    control_plane: Arc<ControlPlane>,
    publisher: Arc<dyn EventPublisher>,
    retry: RetryPolicy,
    job_budget: Duration,
    lanes: DashMap<TenantId, mpsc::UnboundedSender<LaneMessage>>,
    stats: Mutex<DispatchStats>,
}

/// Routes lifecycle events to jobs and the control plane
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("job_budget", &self.shared.job_budget)
            .field("lanes", &self.shared.lanes.len())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Create dispatcher with the default job budget
    pub fn new(runtime: JobRuntime, control_plane: Arc<ControlPlane>) -> Self {
        Self::with_job_budget(runtime, control_plane, DEFAULT_JOB_BUDGET)
    }

    /// Create dispatcher with a job budget
    pub fn with_job_budget(
        runtime: JobRuntime,
        control_plane: Arc<ControlPlane>,
        job_budget: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                publisher: runtime.publisher.clone(),
                retry: runtime.settings.retry,
                provisioning: ProvisioningJob::new(runtime.clone()),
                deprovisioning: DeprovisioningJob::new(runtime),
                control_plane,
                job_budget,
                lanes: DashMap::new(),
                stats: Mutex::new(DispatchStats::default()),
            }),
        }
    }

    /// Consume `subscription` on a background task until it ends
    pub fn spawn(&self, mut subscription: EventSubscription) -> JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            while let Some(envelope) = subscription.recv().await {
                dispatcher.dispatch(envelope).await;
            }
            tracing::info!("event subscription ended, stopping lanes");
            dispatcher.shutdown();
        })
    }

    /// Route one envelope
    pub async fn dispatch(&self, envelope: EventEnvelope) {
        let event = match envelope.decode() {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(event_id = %envelope.event_id, error = %e, "malformed envelope dropped");
                self.shared.stats.lock().malformed += 1;
                return;
            }
        };

        if event.name().is_request() {
            self.enqueue(event);
            return;
        }

        match self.shared.control_plane.apply_event(&event).await {
            Ok(Some(_)) => self.shared.stats.lock().results_applied += 1,
            Ok(None) => {}
            Err(e) => tracing::error!(event = %event.name(), error = %e, "failed to apply result"),
        }
    }

    /// Stop every lane after its queued work
    pub fn shutdown(&self) {
        for lane in self.shared.lanes.iter() {
            let _ = lane.value().send(LaneMessage::Shutdown);
        }
        self.shared.lanes.clear();
    }

    /// Snapshot of the statistics
    #[must_use]
    pub fn stats(&self) -> DispatchStats {
        self.shared.stats.lock().clone()
    }

    /// Number of tenant lanes
    #[must_use]
    pub fn lane_count(&self) -> usize {
        self.shared.lanes.len()
    }

    fn enqueue(&self, event: LifecycleEvent) {
        let tenant_id = event.tenant_id().clone();
        let mut message = LaneMessage::Run(event);
        // a lane whose task has ended is replaced once
        for _ in 0..2 {
            // sent under the entry lock so a lane cannot retire in between
            let sent = self
                .shared
                .lanes
                .entry(tenant_id.clone())
                .or_insert_with(|| self.open_lane(&tenant_id))
                .send(message);
            match sent {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => {
                    self.shared.lanes.remove(&tenant_id);
                    message = returned;
                }
            }
        }
        tracing::error!(tenant_id = %tenant_id, "could not enqueue request");
    }

    fn open_lane(&self, tenant_id: &TenantId) -> mpsc::UnboundedSender<LaneMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        tracing::debug!(tenant_id = %tenant_id, "opening tenant lane");
        tokio::spawn(lane_task(
            self.shared.clone(),
            tenant_id.clone(),
            tx.clone(),
            rx,
        ));
        tx
    }
}

/// Runs one tenant's jobs sequentially, retiring when the queue drains
async fn lane_task(
    shared: Arc<Shared>,
    tenant_id: TenantId,
    tx: mpsc::UnboundedSender<LaneMessage>,
    mut rx: mpsc::UnboundedReceiver<LaneMessage>,
) {
    while let Some(message) = rx.recv().await {
        match message {
            LaneMessage::Run(event) => run_job(&shared, event).await,
            LaneMessage::Shutdown => break,
        }
        if retire_if_idle(&shared, &tenant_id, &tx, &rx) {
            tracing::debug!(tenant_id = %tenant_id, "tenant lane retired");
            break;
        }
    }
}

fn retire_if_idle(
    shared: &Shared,
    tenant_id: &TenantId,
    tx: &mpsc::UnboundedSender<LaneMessage>,
    rx: &mpsc::UnboundedReceiver<LaneMessage>,
) -> bool {
    match shared.lanes.entry(tenant_id.clone()) {
        Entry::Occupied(entry) if entry.get().same_channel(tx) => {
            if rx.is_empty() {
                entry.remove();
                true
            } else {
                false
            }
        }
        // replaced or cleared: nothing new can arrive
        _ => rx.is_empty(),
    }
}

async fn run_job(shared: &Shared, event: LifecycleEvent) {
    shared.stats.lock().jobs_started += 1;
    let budget = shared.job_budget;

    let outcome = match &event {
        LifecycleEvent::OnboardingRequest(request) => {
            tokio::time::timeout(budget, shared.provisioning.run(request.clone()))
                .await
                .map(|r| r.map(|report| report.outcome))
        }
        LifecycleEvent::DeprovisionRequest(request) => {
            tokio::time::timeout(budget, shared.deprovisioning.run(request.clone()))
                .await
                .map(|r| r.map(|report| report.outcome))
        }
        other => {
            tracing::error!(event = %other.name(), "result event routed to a lane");
            return;
        }
    };

    match outcome {
        Ok(Ok(result)) => {
            tracing::debug!(success = result.is_success(), "job finished");
            shared.stats.lock().jobs_finished += 1;
        }
        Ok(Err(JobError::LeaseHeld(_))) => {
            shared.stats.lock().jobs_dropped += 1;
        }
        Ok(Err(e)) => {
            tracing::error!(event = %event.name(), error = %e, "job ended without a result");
            shared.stats.lock().jobs_finished += 1;
        }
        Err(_) => {
            shared.stats.lock().jobs_timed_out += 1;
            report_timeout(shared, &event).await;
        }
    }
}

async fn report_timeout(shared: &Shared, event: &LifecycleEvent) {
    let error = JobError::Timeout {
        budget_secs: shared.job_budget.as_secs(),
    };
    tracing::error!(tenant_id = %event.tenant_id(), error = %error, "job exceeded its budget");

    let failure = JobFailure {
        registration_id: event.registration_id(),
        tenant_id: event.tenant_id().clone(),
        summary: summarize(&error),
    };
    let result = match event {
        LifecycleEvent::DeprovisionRequest(_) => LifecycleEvent::DeprovisionFailure(failure),
        _ => LifecycleEvent::ProvisionFailure(failure),
    };
    if let Err(e) = publish_result(shared.publisher.as_ref(), &shared.retry, result).await {
        tracing::error!(error = %e, "could not report job timeout");
    }
}
