//! Per-tenant leases
//!
//! A job must hold the tenant lease for its whole run. Leases expire after a
//! TTL so a crashed holder cannot block the tenant forever.

use crate::error::LeaseError;
use crate::types::TenantId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use ulid::Ulid;

/// An acquired lease
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub tenant_id: TenantId,
    /// Identifies this acquisition; release must present it
    pub token: Ulid,
    pub holder: String,
    pub expires_at: Instant,
}

impl Lease {
    /// Check if the lease has lapsed
    #[inline]
    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Store of tenant leases
pub trait LeaseStore: Send + Sync {
    /// Acquire the lease for `tenant_id` unless a live lease exists
    fn try_acquire(
        &self,
        tenant_id: &TenantId,
        holder: &str,
        ttl: Duration,
    ) -> Result<Lease, LeaseError>;

    /// Release a lease; only the acquiring token may release it
    fn release(&self, lease: &Lease) -> Result<(), LeaseError>;

    /// Current live holder, if any
    fn holder(&self, tenant_id: &TenantId) -> Option<String>;
}

/// Lease store held in process memory
#[derive(Debug, Default)]
pub struct InMemoryLeaseStore {
    leases: DashMap<TenantId, Lease>,
}

impl InMemoryLeaseStore {
    /// Create empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live leases
    #[must_use]
    pub fn active(&self) -> usize {
        let now = Instant::now();
        self.leases.iter().filter(|l| !l.is_expired(now)).count()
    }
}

impl LeaseStore for InMemoryLeaseStore {
    fn try_acquire(
        &self,
        tenant_id: &TenantId,
        holder: &str,
        ttl: Duration,
    ) -> Result<Lease, LeaseError> {
        let now = Instant::now();
        let lease = Lease {
            tenant_id: tenant_id.clone(),
            token: Ulid::new(),
            holder: holder.to_string(),
            expires_at: now + ttl,
        };

        match self.leases.entry(tenant_id.clone()) {
            Entry::Occupied(mut existing) => {
                if !existing.get().is_expired(now) {
                    return Err(LeaseError::Held {
                        tenant_id: tenant_id.to_string(),
                        holder: existing.get().holder.clone(),
                    });
                }
                tracing::warn!(
                    tenant_id = %tenant_id,
                    previous_holder = %existing.get().holder,
                    "taking over expired lease"
                );
                existing.insert(lease.clone());
            }
            Entry::Vacant(slot) => {
                slot.insert(lease.clone());
            }
        }
        Ok(lease)
    }

    fn release(&self, lease: &Lease) -> Result<(), LeaseError> {
        let removed = self
            .leases
            .remove_if(&lease.tenant_id, |_, current| current.token == lease.token);
        match removed {
            Some(_) => Ok(()),
            None => Err(LeaseError::NotHeld {
                tenant_id: lease.tenant_id.to_string(),
            }),
        }
    }

    fn holder(&self, tenant_id: &TenantId) -> Option<String> {
        let now = Instant::now();
        self.leases
            .get(tenant_id)
            .filter(|l| !l.is_expired(now))
            .map(|l| l.holder.clone())
    }
}

/// Holds a lease and releases it when dropped, including on cancellation
pub struct LeaseGuard {
    store: Arc<dyn LeaseStore>,
    lease: Option<Lease>,
}

impl LeaseGuard {
    /// Acquire the tenant lease
    pub fn acquire(
        store: Arc<dyn LeaseStore>,
        tenant_id: &TenantId,
        holder: &str,
        ttl: Duration,
    ) -> Result<Self, LeaseError> {
        let lease = store.try_acquire(tenant_id, holder, ttl)?;
        tracing::debug!(tenant_id = %tenant_id, token = %lease.token, "lease acquired");
        Ok(Self {
            store,
            lease: Some(lease),
        })
    }

    /// The held lease
    #[must_use]
    pub fn lease(&self) -> Option<&Lease> {
        self.lease.as_ref()
    }

    /// Release now instead of at drop
    pub fn release(mut self) -> Result<(), LeaseError> {
        match self.lease.take() {
            Some(lease) => self.store.release(&lease),
            None => Ok(()),
        }
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if let Some(lease) = self.lease.take() {
            if let Err(e) = self.store.release(&lease) {
                tracing::warn!(error = %e, "lease already gone at drop");
            }
        }
    }
}

impl std::fmt::Debug for LeaseGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseGuard")
            .field("lease", &self.lease)
            .finish_non_exhaustive()
    }
}
