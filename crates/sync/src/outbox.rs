//! Durable outbox of pending change events.
//!
//! Entries are claimed with a lease (claim-on-select) so overlapping worker
//! invocations never select the same entry while a claim is live. Entries
//! that exhaust their retries become **poisoned**: excluded from claiming
//! but kept queryable so operators can see them instead of losing them.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use giftwell_core::{OutboxEntryId, UserId};
use giftwell_profile::ProfileSnapshot;

/// Retries before an entry is poisoned.
pub const RETRY_CAP: u32 = 5;

/// What kind of change an entry carries.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Upsert,
    Delete,
}

/// One pending change event.
///
/// `snapshot` is the source state captured at enqueue time; the worker
/// applies that, never a fresh read, so the applied state matches what was
/// decided when the event was emitted. Entries are immutable once
/// `processed_at` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: OutboxEntryId,
    pub user_id: UserId,
    pub kind: ChangeKind,
    pub source_version: u64,
    /// Present for upserts, absent for deletes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<ProfileSnapshot>,
    /// Unique per logical change; re-enqueueing the same key is a no-op.
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
}

impl OutboxEntry {
    /// New upsert entry carrying the given snapshot.
    pub fn upsert(snapshot: ProfileSnapshot, idempotency_key: impl Into<String>) -> Self {
        Self {
            id: OutboxEntryId::new(),
            user_id: snapshot.user_id,
            kind: ChangeKind::Upsert,
            source_version: snapshot.version,
            snapshot: Some(snapshot),
            idempotency_key: idempotency_key.into(),
            created_at: Utc::now(),
            retry_count: 0,
            last_error: None,
            processed_at: None,
            claimed_by: None,
            claimed_at: None,
        }
    }

    /// New delete entry for a user whose source record is gone.
    pub fn delete(
        user_id: UserId,
        source_version: u64,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            id: OutboxEntryId::new(),
            user_id,
            kind: ChangeKind::Delete,
            source_version,
            snapshot: None,
            idempotency_key: idempotency_key.into(),
            created_at: Utc::now(),
            retry_count: 0,
            last_error: None,
            processed_at: None,
            claimed_by: None,
            claimed_at: None,
        }
    }

    /// Freshly generated idempotency key for a change to `user_id` at
    /// `version`. The uuid suffix keeps re-emissions distinct.
    pub fn fresh_key(prefix: &str, user_id: UserId, version: u64) -> String {
        format!("{prefix}-{user_id}-v{version}-{}", Uuid::now_v7())
    }

    pub fn is_processed(&self) -> bool {
        self.processed_at.is_some()
    }

    /// Exhausted retries without ever processing.
    pub fn is_poisoned(&self) -> bool {
        self.processed_at.is_none() && self.retry_count >= RETRY_CAP
    }

    fn claim_expired(&self, now: DateTime<Utc>, lease: Duration) -> bool {
        match self.claimed_at {
            None => true,
            Some(at) => {
                let lease = chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::zero());
                at + lease <= now
            }
        }
    }

    /// Eligible for claiming: unprocessed, below the retry cap, and not
    /// held by a live lease.
    pub fn claimable(&self, now: DateTime<Utc>, lease: Duration) -> bool {
        !self.is_processed() && !self.is_poisoned() && self.claim_expired(now, lease)
    }
}

/// Outbox store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum OutboxStoreError {
    #[error("outbox entry not found: {0}")]
    NotFound(OutboxEntryId),
    #[error("outbox entry already processed: {0}")]
    AlreadyProcessed(OutboxEntryId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Durable outbox abstraction.
pub trait OutboxStore: Send + Sync {
    /// Enqueue an entry. Enqueueing an idempotency key that already exists
    /// returns the existing entry's id without modifying it.
    fn enqueue(&self, entry: OutboxEntry) -> Result<OutboxEntryId, OutboxStoreError>;

    /// Claim up to `limit` eligible entries oldest-first, leasing them to
    /// `claimer` for `lease`. Entries under a live lease are skipped.
    fn claim_batch(
        &self,
        limit: usize,
        claimer: &str,
        lease: Duration,
    ) -> Result<Vec<OutboxEntry>, OutboxStoreError>;

    /// Mark an entry processed (terminal) and release its claim.
    fn mark_processed(&self, id: OutboxEntryId) -> Result<(), OutboxStoreError>;

    /// Record a per-item failure: bump `retry_count`, store the error,
    /// release the claim so a later invocation can retry.
    fn record_failure(&self, id: OutboxEntryId, error: &str) -> Result<(), OutboxStoreError>;

    /// Get an entry by id.
    fn get(&self, id: OutboxEntryId) -> Result<Option<OutboxEntry>, OutboxStoreError>;

    /// Number of unprocessed, unpoisoned entries.
    fn depth(&self) -> Result<u64, OutboxStoreError>;

    /// Entries that exhausted their retries, oldest first.
    fn list_poisoned(&self, limit: usize) -> Result<Vec<OutboxEntry>, OutboxStoreError>;
}

impl<S> OutboxStore for Arc<S>
where
    S: OutboxStore + ?Sized,
{
    fn enqueue(&self, entry: OutboxEntry) -> Result<OutboxEntryId, OutboxStoreError> {
        (**self).enqueue(entry)
    }

    fn claim_batch(
        &self,
        limit: usize,
        claimer: &str,
        lease: Duration,
    ) -> Result<Vec<OutboxEntry>, OutboxStoreError> {
        (**self).claim_batch(limit, claimer, lease)
    }

    fn mark_processed(&self, id: OutboxEntryId) -> Result<(), OutboxStoreError> {
        (**self).mark_processed(id)
    }

    fn record_failure(&self, id: OutboxEntryId, error: &str) -> Result<(), OutboxStoreError> {
        (**self).record_failure(id, error)
    }

    fn get(&self, id: OutboxEntryId) -> Result<Option<OutboxEntry>, OutboxStoreError> {
        (**self).get(id)
    }

    fn depth(&self) -> Result<u64, OutboxStoreError> {
        (**self).depth()
    }

    fn list_poisoned(&self, limit: usize) -> Result<Vec<OutboxEntry>, OutboxStoreError> {
        (**self).list_poisoned(limit)
    }
}

/// In-memory outbox for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryOutboxStore {
    entries: RwLock<HashMap<OutboxEntryId, OutboxEntry>>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl OutboxStore for InMemoryOutboxStore {
    fn enqueue(&self, entry: OutboxEntry) -> Result<OutboxEntryId, OutboxStoreError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| OutboxStoreError::Storage("lock poisoned".to_string()))?;

        if let Some(existing) = entries
            .values()
            .find(|e| e.idempotency_key == entry.idempotency_key)
        {
            return Ok(existing.id);
        }

        let id = entry.id;
        entries.insert(id, entry);
        Ok(id)
    }

    fn claim_batch(
        &self,
        limit: usize,
        claimer: &str,
        lease: Duration,
    ) -> Result<Vec<OutboxEntry>, OutboxStoreError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| OutboxStoreError::Storage("lock poisoned".to_string()))?;

        let now = Utc::now();

        // Oldest first, id as stable tiebreak (FIFO fairness).
        let mut eligible: Vec<OutboxEntryId> = entries
            .values()
            .filter(|e| e.claimable(now, lease))
            .map(|e| e.id)
            .collect();
        eligible.sort_by_key(|id| {
            let e = &entries[id];
            (e.created_at, e.id)
        });
        eligible.truncate(limit);

        let mut claimed = Vec::with_capacity(eligible.len());
        for id in eligible {
            if let Some(e) = entries.get_mut(&id) {
                e.claimed_by = Some(claimer.to_string());
                e.claimed_at = Some(now);
                claimed.push(e.clone());
            }
        }

        Ok(claimed)
    }

    fn mark_processed(&self, id: OutboxEntryId) -> Result<(), OutboxStoreError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| OutboxStoreError::Storage("lock poisoned".to_string()))?;

        let entry = entries.get_mut(&id).ok_or(OutboxStoreError::NotFound(id))?;
        if entry.is_processed() {
            return Err(OutboxStoreError::AlreadyProcessed(id));
        }

        entry.processed_at = Some(Utc::now());
        entry.claimed_by = None;
        entry.claimed_at = None;
        Ok(())
    }

    fn record_failure(&self, id: OutboxEntryId, error: &str) -> Result<(), OutboxStoreError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| OutboxStoreError::Storage("lock poisoned".to_string()))?;

        let entry = entries.get_mut(&id).ok_or(OutboxStoreError::NotFound(id))?;
        if entry.is_processed() {
            return Err(OutboxStoreError::AlreadyProcessed(id));
        }

        entry.retry_count += 1;
        entry.last_error = Some(error.to_string());
        entry.claimed_by = None;
        entry.claimed_at = None;

        if entry.is_poisoned() {
            warn!(
                entry_id = %id,
                user_id = %entry.user_id,
                retry_count = entry.retry_count,
                "outbox entry poisoned after exhausting retries"
            );
        }

        Ok(())
    }

    fn get(&self, id: OutboxEntryId) -> Result<Option<OutboxEntry>, OutboxStoreError> {
        let entries = self
            .entries
            .read()
            .map_err(|_| OutboxStoreError::Storage("lock poisoned".to_string()))?;
        Ok(entries.get(&id).cloned())
    }

    fn depth(&self) -> Result<u64, OutboxStoreError> {
        let entries = self
            .entries
            .read()
            .map_err(|_| OutboxStoreError::Storage("lock poisoned".to_string()))?;
        Ok(entries
            .values()
            .filter(|e| !e.is_processed() && !e.is_poisoned())
            .count() as u64)
    }

    fn list_poisoned(&self, limit: usize) -> Result<Vec<OutboxEntry>, OutboxStoreError> {
        let entries = self
            .entries
            .read()
            .map_err(|_| OutboxStoreError::Storage("lock poisoned".to_string()))?;

        let mut poisoned: Vec<OutboxEntry> = entries
            .values()
            .filter(|e| e.is_poisoned())
            .cloned()
            .collect();
        poisoned.sort_by_key(|e| (e.created_at, e.id));
        poisoned.truncate(limit);
        Ok(poisoned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use giftwell_profile::ProfileSnapshot;

    fn entry_for(version: u64) -> OutboxEntry {
        let snapshot = ProfileSnapshot::new(UserId::new(), "Test", version);
        let key = OutboxEntry::fresh_key("profile", snapshot.user_id, version);
        OutboxEntry::upsert(snapshot, key)
    }

    const LEASE: Duration = Duration::from_secs(60);

    #[test]
    fn enqueue_then_claim_oldest_first() {
        let store = InMemoryOutboxStore::new();
        let first = store.enqueue(entry_for(1)).unwrap();
        let second = store.enqueue(entry_for(1)).unwrap();

        let claimed = store.claim_batch(1, "w1", LEASE).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, first);

        let claimed = store.claim_batch(1, "w1", LEASE).unwrap();
        assert_eq!(claimed[0].id, second);
    }

    #[test]
    fn duplicate_idempotency_key_is_a_no_op() {
        let store = InMemoryOutboxStore::new();
        let snapshot = ProfileSnapshot::new(UserId::new(), "Test", 1);
        let key = "profile-key-1".to_string();

        let first = store
            .enqueue(OutboxEntry::upsert(snapshot.clone(), key.clone()))
            .unwrap();
        let second = store.enqueue(OutboxEntry::upsert(snapshot, key)).unwrap();

        assert_eq!(first, second);
        assert_eq!(store.depth().unwrap(), 1);
    }

    #[test]
    fn live_lease_blocks_overlapping_claims() {
        let store = InMemoryOutboxStore::new();
        store.enqueue(entry_for(1)).unwrap();

        let first = store.claim_batch(10, "w1", LEASE).unwrap();
        assert_eq!(first.len(), 1);

        // A second invocation while the lease is live sees nothing.
        let second = store.claim_batch(10, "w2", LEASE).unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn expired_lease_is_reclaimable() {
        let store = InMemoryOutboxStore::new();
        store.enqueue(entry_for(1)).unwrap();

        let first = store.claim_batch(10, "w1", Duration::ZERO).unwrap();
        assert_eq!(first.len(), 1);

        // Zero lease expires immediately; a crashed worker's entry comes back.
        let second = store.claim_batch(10, "w2", Duration::ZERO).unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].claimed_by.as_deref(), Some("w2"));
    }

    #[test]
    fn failure_releases_claim_and_counts_retries() {
        let store = InMemoryOutboxStore::new();
        let id = store.enqueue(entry_for(1)).unwrap();

        store.claim_batch(1, "w1", LEASE).unwrap();
        store.record_failure(id, "boom").unwrap();

        let entry = store.get(id).unwrap().unwrap();
        assert_eq!(entry.retry_count, 1);
        assert_eq!(entry.last_error.as_deref(), Some("boom"));
        assert!(entry.claimed_at.is_none());

        // Retryable right away by the next invocation.
        let claimed = store.claim_batch(1, "w2", LEASE).unwrap();
        assert_eq!(claimed.len(), 1);
    }

    #[test]
    fn retry_cap_poisons_and_excludes_from_claiming() {
        let store = InMemoryOutboxStore::new();
        let id = store.enqueue(entry_for(1)).unwrap();

        for _ in 0..RETRY_CAP {
            let claimed = store.claim_batch(1, "w1", LEASE).unwrap();
            assert_eq!(claimed.len(), 1);
            store.record_failure(id, "deterministic failure").unwrap();
        }

        // Poisoned: invisible to claiming, visible on the poisoned surface.
        assert!(store.claim_batch(1, "w1", LEASE).unwrap().is_empty());
        assert_eq!(store.depth().unwrap(), 0);

        let poisoned = store.list_poisoned(10).unwrap();
        assert_eq!(poisoned.len(), 1);
        assert_eq!(poisoned[0].id, id);
        assert_eq!(poisoned[0].retry_count, RETRY_CAP);
    }

    #[test]
    fn processed_entries_are_immutable() {
        let store = InMemoryOutboxStore::new();
        let id = store.enqueue(entry_for(1)).unwrap();

        store.claim_batch(1, "w1", LEASE).unwrap();
        store.mark_processed(id).unwrap();

        assert!(matches!(
            store.mark_processed(id),
            Err(OutboxStoreError::AlreadyProcessed(_))
        ));
        assert!(matches!(
            store.record_failure(id, "late"),
            Err(OutboxStoreError::AlreadyProcessed(_))
        ));
    }
}
