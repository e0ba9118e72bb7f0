//! Lifecycle event bus
//!
//! Events are validated at the publish boundary, sealed into an
//! [`EventEnvelope`], appended to a hash-chained journal and fanned out to
//! every subscriber. Each subscriber sees events in publication order.
//!
//! The journal keeps a bounded window of recent entries with credentials
//! redacted; subscribers receive the envelope as published.

use crate::error::BusError;
use crate::events::{keys, EventEnvelope, EventName, LifecycleEvent};
use crate::types::TenantId;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::sync::mpsc;

/// Journal entries retained by default
pub const DEFAULT_JOURNAL_CAPACITY: usize = 10_000;

/// Payload fields masked before an envelope is journaled
const REDACTED_FIELDS: &[&str] = &[keys::API_KEY];
const REDACTED: &str = "<redacted>";

/// Publishes lifecycle events
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait EventPublisher: Send + Sync {
    /// Validate and publish; returns the envelope as delivered
    async fn publish(&self, event: LifecycleEvent) -> Result<EventEnvelope, BusError>;
}

/// Journal entry
#[derive(Debug, Clone)]
pub struct JournalEntry {
    pub sequence: u64,
    /// Envelope with credential fields redacted
    pub envelope: EventEnvelope,
    pub prev_hash: [u8; 32],
    pub hash: [u8; 32],
}

/// Hash-chained log of the most recent published envelopes
///
/// Once `capacity` entries are held the oldest is evicted; the chain is
/// verified from the hash of the last evicted entry.
#[derive(Debug)]
pub struct EventJournal {
    entries: VecDeque<JournalEntry>,
    capacity: usize,
    next_sequence: u64,
    // hash of the last evicted entry
    anchor: [u8; 32],
}

impl Default for EventJournal {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_JOURNAL_CAPACITY)
    }
}

impl EventJournal {
    /// Journal retaining at most `capacity` entries
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
            next_sequence: 0,
            anchor: [0u8; 32],
        }
    }

    fn append(&mut self, envelope: &EventEnvelope) -> &JournalEntry {
        let envelope = redact(envelope);
        let prev_hash = self.entries.back().map_or(self.anchor, |e| e.hash);
        let sequence = self.next_sequence;
        let hash = entry_hash(sequence, &envelope, &prev_hash);
        self.next_sequence += 1;

        if self.entries.len() == self.capacity {
            if let Some(evicted) = self.entries.pop_front() {
                self.anchor = evicted.hash;
            }
        }
        self.entries.push_back(JournalEntry {
            sequence,
            envelope,
            prev_hash,
            hash,
        });
        &self.entries[self.entries.len() - 1]
    }

    /// Retained entries in publication order
    pub fn entries(&self) -> impl Iterator<Item = &JournalEntry> + '_ {
        self.entries.iter()
    }

    /// Number of retained entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if nothing was retained
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Recompute the chain and compare against the stored hashes
    pub fn verify_integrity(&self) -> Result<(), BusError> {
        let mut prev = self.anchor;
        for entry in &self.entries {
            if entry.prev_hash != prev
                || entry.hash != entry_hash(entry.sequence, &entry.envelope, &entry.prev_hash)
            {
                return Err(BusError::IntegrityViolation {
                    sequence: entry.sequence,
                });
            }
            prev = entry.hash;
        }
        Ok(())
    }

    /// Hex digest of the chain head
    #[must_use]
    pub fn head(&self) -> Option<String> {
        self.entries.back().map(|e| hex::encode(e.hash))
    }
}

fn redact(envelope: &EventEnvelope) -> EventEnvelope {
    let mut redacted = envelope.clone();
    for field in REDACTED_FIELDS {
        if let Some(value) = redacted.payload.get_mut(*field) {
            *value = REDACTED.to_string();
        }
    }
    redacted
}

fn entry_hash(sequence: u64, envelope: &EventEnvelope, prev_hash: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(sequence.to_le_bytes());
    hasher.update(envelope.event_id.to_bytes());
    hasher.update(envelope.name.as_str().as_bytes());
    hasher.update([0]);
    hasher.update(envelope.correlation_id.as_bytes());
    hasher.update([0]);
    hasher.update(envelope.published_at.to_rfc3339().as_bytes());
    for (key, value) in &envelope.payload {
        hasher.update(key.as_bytes());
        hasher.update([0]);
        hasher.update(value.as_bytes());
        hasher.update([0]);
    }
    hasher.update(prev_hash);
    hasher.finalize().into()
}

/// Receiving side of a bus subscription
#[derive(Debug)]
pub struct EventSubscription {
    rx: mpsc::UnboundedReceiver<EventEnvelope>,
}

impl EventSubscription {
    /// Next envelope; `None` once the bus is closed and drained
    pub async fn recv(&mut self) -> Option<EventEnvelope> {
        self.rx.recv().await
    }

    /// Next envelope if one is already queued
    pub fn try_recv(&mut self) -> Option<EventEnvelope> {
        self.rx.try_recv().ok()
    }
}

#[derive(Debug, Default)]
struct BusInner {
    journal: EventJournal,
    subscribers: Vec<mpsc::UnboundedSender<EventEnvelope>>,
}

/// In-process event bus
#[derive(Debug, Default)]
pub struct InMemoryEventBus {
    inner: Mutex<BusInner>,
    closed: AtomicBool,
    outage: AtomicU32,
}

impl InMemoryEventBus {
    /// Create bus
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create bus whose journal retains at most `capacity` entries
    #[must_use]
    pub fn with_journal_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(BusInner {
                journal: EventJournal::with_capacity(capacity),
                subscribers: Vec::new(),
            }),
            ..Self::default()
        }
    }

    /// Register a subscriber; it receives events published from now on
    pub fn subscribe(&self) -> EventSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().subscribers.push(tx);
        EventSubscription { rx }
    }

    /// Reject the next `count` publishes as unavailable
    pub fn fail_next_publishes(&self, count: u32) {
        self.outage.store(count, Ordering::SeqCst);
    }

    /// Stop accepting events and end every subscription
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.inner.lock().subscribers.clear();
    }

    /// Check if the bus was closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Journaled envelopes, in order
    #[must_use]
    pub fn published(&self) -> Vec<EventEnvelope> {
        self.inner
            .lock()
            .journal
            .entries()
            .map(|e| e.envelope.clone())
            .collect()
    }

    /// Journaled envelopes correlated with `tenant_id`
    #[must_use]
    pub fn events_for(&self, tenant_id: &TenantId) -> Vec<EventEnvelope> {
        self.inner
            .lock()
            .journal
            .entries()
            .filter(|e| e.envelope.correlation_id == tenant_id.as_str())
            .map(|e| e.envelope.clone())
            .collect()
    }

    /// Names of the envelopes correlated with `tenant_id`
    #[must_use]
    pub fn names_for(&self, tenant_id: &TenantId) -> Vec<EventName> {
        self.events_for(tenant_id).iter().map(|e| e.name).collect()
    }

    /// Check the journal hash chain
    pub fn verify_journal(&self) -> Result<(), BusError> {
        self.inner.lock().journal.verify_integrity()
    }

    /// Hex digest of the latest journal entry
    #[must_use]
    pub fn journal_head(&self) -> Option<String> {
        self.inner.lock().journal.head()
    }

    fn take_outage(&self) -> bool {
        self.outage
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait::async_trait]
impl EventPublisher for InMemoryEventBus {
    async fn publish(&self, event: LifecycleEvent) -> Result<EventEnvelope, BusError> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        if let Err(e) = event.validate() {
            tracing::warn!(event = %event.name(), error = %e, "event rejected at publish");
            crate::metrics::record_rejected(event.name().as_str());
            return Err(e.into());
        }
        if self.take_outage() {
            return Err(BusError::Unavailable("simulated outage".to_string()));
        }

        let envelope = EventEnvelope::seal(&event);
        {
            let mut inner = self.inner.lock();
            let entry = inner.journal.append(&envelope);
            tracing::debug!(sequence = entry.sequence, "journal append");
            inner.subscribers.retain(|tx| tx.send(envelope.clone()).is_ok());
        }

        tracing::info!(
            event_id = %envelope.event_id,
            event = %envelope.name,
            tenant_id = %envelope.correlation_id,
            "event published"
        );
        crate::metrics::record_published(envelope.name.as_str());
        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::events::{DeprovisionRequest, JobFailure, ProvisionSuccess};
    use crate::types::{FailureSummary, RegistrationId, TenantConfig, TenantEndpoints};

    fn deprovision(tenant: &str) -> LifecycleEvent {
        LifecycleEvent::DeprovisionRequest(DeprovisionRequest {
            registration_id: RegistrationId::new(),
            tenant_id: TenantId::new(tenant),
        })
    }

    #[tokio::test]
    async fn subscribers_receive_in_order() {
        let bus = InMemoryEventBus::new();
        let mut sub = bus.subscribe();

        bus.publish(deprovision("a")).await.unwrap();
        bus.publish(deprovision("b")).await.unwrap();

        assert_eq!(sub.recv().await.unwrap().correlation_id, "a");
        assert_eq!(sub.recv().await.unwrap().correlation_id, "b");
    }

    #[tokio::test]
    async fn invalid_event_is_rejected_and_not_journaled() {
        let bus = InMemoryEventBus::new();
        let failure = LifecycleEvent::ProvisionFailure(JobFailure {
            registration_id: RegistrationId::new(),
            tenant_id: TenantId::new("a"),
            summary: FailureSummary {
                kind: FailureKind::Fatal,
                message: String::new(),
                failed_step: None,
            },
        });

        let err = bus.publish(failure).await.unwrap_err();

        assert!(matches!(err, BusError::Rejected(_)));
        assert!(bus.published().is_empty());
    }

    #[tokio::test]
    async fn journal_chain_verifies_and_detects_tampering() {
        let bus = InMemoryEventBus::new();
        for tenant in ["a", "b", "c"] {
            bus.publish(deprovision(tenant)).await.unwrap();
        }
        bus.verify_journal().unwrap();

        let mut inner = bus.inner.lock();
        inner.journal.entries[1]
            .envelope
            .payload
            .insert("tenantId".to_string(), "x".to_string());
        assert!(matches!(
            inner.journal.verify_integrity(),
            Err(BusError::IntegrityViolation { sequence: 1 })
        ));
    }

    #[tokio::test]
    async fn journal_evicts_oldest_and_still_verifies() {
        let bus = InMemoryEventBus::with_journal_capacity(2);
        for tenant in ["a", "b", "c"] {
            bus.publish(deprovision(tenant)).await.unwrap();
        }

        let inner = bus.inner.lock();
        let sequences: Vec<_> = inner.journal.entries().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![1, 2]);
        inner.journal.verify_integrity().unwrap();
        drop(inner);
        assert!(bus.names_for(&TenantId::new("a")).is_empty());
    }

    #[tokio::test]
    async fn journal_redacts_api_key() {
        let bus = InMemoryEventBus::new();
        let mut sub = bus.subscribe();
        let success = LifecycleEvent::ProvisionSuccess(ProvisionSuccess {
            registration_id: RegistrationId::new(),
            tenant_id: TenantId::new("a"),
            config: TenantConfig {
                api_key: "secret-key".to_string(),
                knowledge_base_id: "kb-1".to_string(),
                data_source_id: "ds-1".to_string(),
                identity_client_id: "client".to_string(),
                storage_prefix: "a/".to_string(),
                endpoints: TenantEndpoints {
                    api_url: "https://api".to_string(),
                    upload_url: "https://api/upload".to_string(),
                    query_url: "https://api/query".to_string(),
                },
                generated_at: chrono::Utc::now(),
            },
            degraded_steps: Vec::new(),
        });

        let delivered = bus.publish(success).await.unwrap();

        let api_key = |envelope: &EventEnvelope| envelope.payload.get(keys::API_KEY).cloned();
        assert_eq!(api_key(&delivered).as_deref(), Some("secret-key"));
        assert_eq!(
            api_key(&sub.recv().await.unwrap()).as_deref(),
            Some("secret-key")
        );
        assert_eq!(api_key(&bus.published()[0]).as_deref(), Some(REDACTED));
        bus.verify_journal().unwrap();
    }

    #[tokio::test]
    async fn outage_fails_requested_publishes() {
        let bus = InMemoryEventBus::new();
        bus.fail_next_publishes(1);

        assert!(matches!(
            bus.publish(deprovision("a")).await,
            Err(BusError::Unavailable(_))
        ));
        bus.publish(deprovision("a")).await.unwrap();
        assert_eq!(bus.names_for(&TenantId::new("a")).len(), 1);
    }

    #[tokio::test]
    async fn closed_bus_ends_subscriptions() {
        let bus = InMemoryEventBus::new();
        let mut sub = bus.subscribe();
        bus.close();

        assert!(sub.recv().await.is_none());
        assert!(matches!(
            bus.publish(deprovision("a")).await,
            Err(BusError::Closed)
        ));
    }
}
