//! Control plane
//!
//! Owns tenant registrations. A request is recorded before its event is
//! published (the registration carries an outbox marker until the publish is
//! acknowledged), and result events drive the registration's status.
//! [`ControlPlane::reconcile`] republishes any request whose publish was never
//! acknowledged, and fails in-flight registrations whose job result never
//! arrived within twice the job budget.

use crate::bus::EventPublisher;
use crate::error::{ControlPlaneError, RegistryError};
use crate::error::JobError;
use crate::events::{
    DeprovisionRequest, EventEnvelope, EventName, LifecycleEvent, OnboardingRequest,
};
use crate::job::summarize;
use crate::registry::RegistrationStore;
use crate::state_machine::JobState;
use crate::types::{
    validate_email, RegistrationId, RegistrationPatch, RegistrationRequest, TenantRegistration,
    TenantStatus,
};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const MAX_WRITE_ATTEMPTS: u32 = 8;

/// Registration registry and lifecycle event router
pub struct ControlPlane {
    store: Arc<dyn RegistrationStore>,
    publisher: Arc<dyn EventPublisher>,
    /// Job budget; in-flight registrations idle for twice this are expired
    job_budget: Option<Duration>,
    // serialises the "no job in flight for this tenant" check with the write
    admission: Mutex<()>,
}

impl std::fmt::Debug for ControlPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlane").finish_non_exhaustive()
    }
}

fn can_move(from: TenantStatus, to: TenantStatus) -> bool {
    from.allowed_transitions().contains(&to)
}

/// Request event a registration's outbox marker stands for
fn request_event(registration: &TenantRegistration, name: EventName) -> Option<LifecycleEvent> {
    match name {
        EventName::OnboardingRequest => Some(LifecycleEvent::OnboardingRequest(OnboardingRequest {
            registration_id: registration.id,
            tenant_id: registration.tenant_id.clone(),
            tier: registration.tier,
            company_name: registration.company_name.clone(),
            admin_email: registration.admin_email.clone(),
        })),
        EventName::DeprovisionRequest => {
            Some(LifecycleEvent::DeprovisionRequest(DeprovisionRequest {
                registration_id: registration.id,
                tenant_id: registration.tenant_id.clone(),
            }))
        }
        _ => None,
    }
}

impl ControlPlane {
    /// Create control plane
    pub fn new(store: Arc<dyn RegistrationStore>, publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            store,
            publisher,
            job_budget: None,
            admission: Mutex::new(()),
        }
    }

    /// Expire in-flight registrations whose job outlived `budget`
    #[must_use]
    pub fn with_job_budget(mut self, budget: Duration) -> Self {
        self.job_budget = Some(budget);
        self
    }

    /// Register a tenant and request its provisioning.
    ///
    /// A tenant whose latest registration is `Complete` or `Failed` is
    /// re-onboarded on that registration. The registration is returned even
    /// when the publish fails; it then stays `Pending` until
    /// [`reconcile`](Self::reconcile) delivers the request.
    #[tracing::instrument(skip(self, request), fields(tenant_id = %request.tenant_id()))]
    pub async fn register(
        &self,
        request: RegistrationRequest,
    ) -> Result<TenantRegistration, ControlPlaneError> {
        let recorded = {
            let _admission = self.admission.lock().await;
            let tenant_id = request.tenant_id();
            let latest = self.store.find_by_tenant(&tenant_id).await?;

            if let Some(active) = latest.iter().find(|r| r.status.is_in_flight()) {
                return Err(ControlPlaneError::Conflict(format!(
                    "tenant '{tenant_id}' has a lifecycle job in flight (registration {}, {})",
                    active.id, active.status
                )));
            }

            match latest.into_iter().next() {
                Some(previous) if previous.status.accepts_onboarding() => {
                    tracing::info!(registration_id = %previous.id, from = %previous.status, "re-onboarding tenant");
                    let mut next = previous;
                    next.status = next.status.transition(TenantStatus::Pending)?;
                    next.company_name = request.company();
                    next.admin_email = request.email.clone();
                    next.tier = request.tier;
                    next.config = None;
                    next.failure = None;
                    next.unpublished = Some(EventName::OnboardingRequest);
                    self.store.update(next).await?
                }
                _ => self.store.insert(TenantRegistration::new(&request)).await?,
            }
        };
        tracing::info!(registration_id = %recorded.id, "registration recorded");

        self.publish_marked(recorded).await
    }

    /// Fetch a registration
    pub async fn get(&self, id: RegistrationId) -> Result<TenantRegistration, ControlPlaneError> {
        self.store
            .get(id)
            .await?
            .ok_or(ControlPlaneError::NotFound(id))
    }

    /// All registrations
    pub async fn list(&self) -> Result<Vec<TenantRegistration>, ControlPlaneError> {
        Ok(self.store.list().await?)
    }

    /// Change registration metadata. Does not re-provision.
    pub async fn update(
        &self,
        id: RegistrationId,
        patch: RegistrationPatch,
    ) -> Result<TenantRegistration, ControlPlaneError> {
        if patch.is_empty() {
            return Err(ControlPlaneError::InvalidUpdate(
                "no fields to update".to_string(),
            ));
        }
        if let Some(email) = &patch.email {
            validate_email(email).map_err(|e| ControlPlaneError::InvalidUpdate(e.to_string()))?;
        }
        if patch
            .company_name
            .as_ref()
            .is_some_and(|name| name.trim().is_empty())
        {
            return Err(ControlPlaneError::InvalidUpdate(
                "companyName must not be empty".to_string(),
            ));
        }

        self.mutate(id, |r| {
            if r.status.is_in_flight() || r.status == TenantStatus::Deleted {
                return Err(ControlPlaneError::Conflict(format!(
                    "registration {} is {}",
                    r.id, r.status
                )));
            }
            if let Some(email) = &patch.email {
                r.admin_email.clone_from(email);
            }
            if let Some(tier) = patch.tier {
                r.tier = tier;
            }
            if let Some(name) = &patch.company_name {
                r.company_name = name.trim().to_string();
            }
            Ok(true)
        })
        .await
    }

    /// Request deprovisioning of a `Complete` or `Failed` registration
    #[tracing::instrument(skip(self))]
    pub async fn deprovision(
        &self,
        id: RegistrationId,
    ) -> Result<TenantRegistration, ControlPlaneError> {
        let recorded = {
            let _admission = self.admission.lock().await;
            self.mutate(id, |r| {
                if !matches!(r.status, TenantStatus::Complete | TenantStatus::Failed) {
                    return Err(ControlPlaneError::Conflict(format!(
                        "registration {} is {}; only complete or failed tenants can be deprovisioned",
                        r.id, r.status
                    )));
                }
                r.status = r.status.transition(TenantStatus::Deprovisioning)?;
                r.unpublished = Some(EventName::DeprovisionRequest);
                Ok(true)
            })
            .await?
        };
        tracing::info!(tenant_id = %recorded.tenant_id, "deprovisioning recorded");

        self.publish_marked(recorded).await
    }

    /// Apply a result event to its registration.
    ///
    /// Returns the updated registration, or `None` when the event was
    /// ignored (request events, unknown registrations, stale or illegal
    /// transitions).
    pub async fn apply_event(
        &self,
        event: &LifecycleEvent,
    ) -> Result<Option<TenantRegistration>, ControlPlaneError> {
        if event.name().is_request() {
            return Ok(None);
        }
        let id = event.registration_id();
        let Some(registration) = self.store.get(id).await? else {
            tracing::warn!(registration_id = %id, event = %event.name(), "result for unknown registration ignored");
            return Ok(None);
        };
        if &registration.tenant_id != event.tenant_id() {
            tracing::warn!(
                registration_id = %id,
                expected = %registration.tenant_id,
                got = %event.tenant_id(),
                "result tenant does not match registration, ignored"
            );
            return Ok(None);
        }

        let mut applied = false;
        let updated = self
            .mutate(id, |r| {
                applied = apply_result(r, event);
                if !applied {
                    tracing::warn!(
                        registration_id = %r.id,
                        status = %r.status,
                        event = %event.name(),
                        "result does not apply to current status, ignored"
                    );
                }
                Ok(applied)
            })
            .await?;

        if !applied {
            return Ok(None);
        }
        tracing::info!(
            registration_id = %updated.id,
            tenant_id = %updated.tenant_id,
            status = %updated.status,
            "registration status updated"
        );
        Ok(Some(updated))
    }

    /// Decode an envelope and apply it; malformed envelopes are logged and dropped
    pub async fn apply_envelope(
        &self,
        envelope: &EventEnvelope,
    ) -> Result<Option<TenantRegistration>, ControlPlaneError> {
        match envelope.decode() {
            Ok(event) => self.apply_event(&event).await,
            Err(e) => {
                tracing::warn!(event_id = %envelope.event_id, error = %e, "malformed envelope dropped");
                Ok(None)
            }
        }
    }

    /// Republish every request whose publish was not acknowledged, then
    /// expire stale in-flight registrations.
    ///
    /// Returns how many registrations were recovered this sweep.
    pub async fn reconcile(&self) -> Result<usize, ControlPlaneError> {
        let registrations = self.store.list().await?;
        let stale_after = self.job_budget.map(|budget| budget.saturating_mul(2));

        let mut delivered = 0;
        let mut expired = 0;
        for registration in registrations {
            let id = registration.id;
            if registration.unpublished.is_some() {
                let after = self.publish_marked(registration).await?;
                if after.unpublished.is_none() {
                    delivered += 1;
                } else {
                    tracing::warn!(registration_id = %id, "request still undelivered");
                }
            } else if let Some(stale_after) = stale_after {
                if is_stale(&registration, stale_after) && self.expire(id, stale_after).await? {
                    expired += 1;
                }
            }
        }
        if delivered > 0 {
            tracing::info!(delivered, "reconciliation republished requests");
        }
        if expired > 0 {
            tracing::warn!(expired, "reconciliation expired stalled jobs");
        }
        let recovered = delivered + expired;
        if recovered > 0 {
            crate::metrics::record_reconciled(recovered);
        }
        Ok(recovered)
    }

    /// Fail a registration whose job result never arrived
    async fn expire(
        &self,
        id: RegistrationId,
        stale_after: Duration,
    ) -> Result<bool, ControlPlaneError> {
        let budget_secs = self.job_budget.map_or(0, |budget| budget.as_secs());
        let summary = summarize(&JobError::Timeout { budget_secs });
        let mut expired = false;
        let updated = self
            .mutate(id, |r| {
                // a result may have landed since the sweep listed the record
                expired = is_stale(r, stale_after);
                if !expired {
                    return Ok(false);
                }
                if r.status == TenantStatus::Provisioning {
                    r.config = None;
                }
                r.status = r.status.transition(TenantStatus::Failed)?;
                r.failure = Some(summary.clone());
                Ok(true)
            })
            .await?;
        if expired {
            tracing::warn!(
                registration_id = %updated.id,
                tenant_id = %updated.tenant_id,
                "no job result within budget, registration failed"
            );
        }
        Ok(expired)
    }

    /// Publish the request named by the registration's outbox marker and
    /// clear the marker once acknowledged
    async fn publish_marked(
        &self,
        registration: TenantRegistration,
    ) -> Result<TenantRegistration, ControlPlaneError> {
        let Some(name) = registration.unpublished else {
            return Ok(registration);
        };
        let Some(event) = request_event(&registration, name) else {
            tracing::error!(registration_id = %registration.id, marker = %name, "outbox marker is not a request");
            return Ok(registration);
        };

        match self.publisher.publish(event).await {
            Ok(envelope) => {
                tracing::debug!(event_id = %envelope.event_id, "request published");
                self.mutate(registration.id, |r| {
                    if r.unpublished != Some(name) {
                        return Ok(false);
                    }
                    r.unpublished = None;
                    if name == EventName::OnboardingRequest && r.status == TenantStatus::Pending {
                        r.status = r.status.transition(TenantStatus::Provisioning)?;
                    }
                    Ok(true)
                })
                .await
            }
            Err(e) => {
                tracing::warn!(
                    registration_id = %registration.id,
                    event = %name,
                    error = %e,
                    "publish failed, left for reconciliation"
                );
                Ok(registration)
            }
        }
    }

    /// Read-modify-write with retry on version conflicts.
    ///
    /// `f` returns whether it changed the record; unchanged records are not
    /// written.
    async fn mutate<F>(
        &self,
        id: RegistrationId,
        mut f: F,
    ) -> Result<TenantRegistration, ControlPlaneError>
    where
        F: FnMut(&mut TenantRegistration) -> Result<bool, ControlPlaneError> + Send,
    {
        let mut attempt = 1;
        loop {
            let mut record = self.get(id).await?;
            if !f(&mut record)? {
                return Ok(record);
            }
            match self.store.update(record).await {
                Ok(stored) => return Ok(stored),
                Err(RegistryError::VersionConflict { .. }) if attempt < MAX_WRITE_ATTEMPTS => {
                    tracing::debug!(registration_id = %id, attempt, "write conflict, retrying");
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Apply a result event to a registration; false when it does not apply
fn apply_result(r: &mut TenantRegistration, event: &LifecycleEvent) -> bool {
    match event {
        LifecycleEvent::ProvisionSuccess(success) => {
            match r.status {
                // a duplicate success replaces the configuration wholesale
                TenantStatus::Complete => {}
                // the result can overtake the publish acknowledgement
                TenantStatus::Pending | TenantStatus::Provisioning => {
                    r.status = TenantStatus::Complete;
                }
                _ => return false,
            }
            r.config = Some(success.config.clone());
            r.failure = None;
            if !success.degraded_steps.is_empty() {
                tracing::warn!(degraded = ?success.degraded_steps, "tenant provisioned with degraded steps");
            }
            clear_marker(r, EventName::OnboardingRequest);
            true
        }
        LifecycleEvent::ProvisionFailure(failure) => {
            if !can_move(r.status, TenantStatus::Failed)
                || r.status == TenantStatus::Deprovisioning
            {
                return false;
            }
            r.status = TenantStatus::Failed;
            r.failure = Some(failure.summary.clone());
            r.config = None;
            clear_marker(r, EventName::OnboardingRequest);
            true
        }
        LifecycleEvent::DeprovisionSuccess(_) => {
            if !can_move(r.status, TenantStatus::Deleted) {
                return false;
            }
            r.status = TenantStatus::Deleted;
            r.config = None;
            r.failure = None;
            clear_marker(r, EventName::DeprovisionRequest);
            true
        }
        LifecycleEvent::DeprovisionFailure(failure) => {
            if r.status != TenantStatus::Deprovisioning {
                return false;
            }
            r.status = TenantStatus::Failed;
            r.failure = Some(failure.summary.clone());
            clear_marker(r, EventName::DeprovisionRequest);
            true
        }
        LifecycleEvent::OnboardingRequest(_) | LifecycleEvent::DeprovisionRequest(_) => false,
    }
}

/// In flight with no pending publish and untouched for `stale_after`
fn is_stale(r: &TenantRegistration, stale_after: Duration) -> bool {
    matches!(
        r.status,
        TenantStatus::Provisioning | TenantStatus::Deprovisioning
    ) && r.unpublished.is_none()
        && (Utc::now() - r.updated_at)
            .to_std()
            .is_ok_and(|idle| idle >= stale_after)
}

fn clear_marker(r: &mut TenantRegistration, name: EventName) {
    if r.unpublished == Some(name) {
        r.unpublished = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MockEventPublisher;
    use crate::error::BusError;
    use crate::registry::InMemoryRegistrationStore;
    use crate::types::Tier;

    fn plane(publisher: MockEventPublisher) -> ControlPlane {
        ControlPlane::new(
            Arc::new(InMemoryRegistrationStore::new()),
            Arc::new(publisher),
        )
    }

    fn request() -> RegistrationRequest {
        RegistrationRequest::new("acme", "ops@acme.io", Tier::Standard)
    }

    #[tokio::test]
    async fn acknowledged_publish_moves_to_provisioning() {
        let mut publisher = MockEventPublisher::new();
        publisher
            .expect_publish()
            .withf(|event| event.name() == EventName::OnboardingRequest)
            .times(1)
            .returning(|event| Ok(EventEnvelope::seal(&event)));

        let registration = plane(publisher).register(request()).await.unwrap();

        assert_eq!(registration.status, TenantStatus::Provisioning);
        assert_eq!(registration.unpublished, None);
    }

    #[tokio::test]
    async fn failed_publish_stays_pending_with_marker() {
        let mut publisher = MockEventPublisher::new();
        publisher
            .expect_publish()
            .returning(|_| Err(BusError::Unavailable("down".to_string())));

        let plane = plane(publisher);
        let registration = plane.register(request()).await.unwrap();

        assert_eq!(registration.status, TenantStatus::Pending);
        assert_eq!(registration.unpublished, Some(EventName::OnboardingRequest));
        assert_eq!(plane.reconcile().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn in_flight_tenant_conflicts() {
        let mut publisher = MockEventPublisher::new();
        publisher
            .expect_publish()
            .returning(|event| Ok(EventEnvelope::seal(&event)));
        let plane = plane(publisher);
        plane.register(request()).await.unwrap();

        let err = plane.register(request()).await.unwrap_err();
        assert!(matches!(err, ControlPlaneError::Conflict(_)));
    }

    #[tokio::test]
    async fn deprovision_requires_settled_status() {
        let mut publisher = MockEventPublisher::new();
        publisher
            .expect_publish()
            .returning(|event| Ok(EventEnvelope::seal(&event)));
        let plane = plane(publisher);
        let registration = plane.register(request()).await.unwrap();

        let err = plane.deprovision(registration.id).await.unwrap_err();
        assert!(matches!(err, ControlPlaneError::Conflict(_)));
    }

    #[tokio::test]
    async fn empty_patch_is_rejected() {
        let plane = plane(MockEventPublisher::new());
        let err = plane
            .update(RegistrationId::new(), RegistrationPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ControlPlaneError::InvalidUpdate(_)));
    }
}
