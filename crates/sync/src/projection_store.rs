//! Public projection storage with a version + checksum guard.
//!
//! Last writer wins **by version, not by arrival time**: the guard is the
//! one mechanism that keeps overlapping batches and redelivered entries
//! from regressing the projection.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use giftwell_core::UserId;
use giftwell_projector::PublicProfile;

/// Current public state for one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionRecord {
    pub user_id: UserId,
    /// Non-decreasing per user.
    pub version: u64,
    pub checksum: String,
    pub payload: PublicProfile,
    pub source_updated_at: DateTime<Utc>,
    pub last_synced_at: DateTime<Utc>,
}

/// What a guarded upsert did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// Newer version, written.
    Applied,
    /// Same or older version with the same checksum — redelivery, nothing
    /// to do.
    IdempotentNoOp,
    /// Older version with different content — a delayed event that must
    /// not clobber the newer projection.
    StaleIgnored { stored_version: u64 },
    /// Same version but different content: drift that should be impossible
    /// for a deterministic projector. Logged and repaired in favor of the
    /// incoming source-derived payload.
    ChecksumRepaired,
}

/// Projection store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProjectionStoreError {
    #[error("storage error: {0}")]
    Storage(String),
}

/// Public projection store abstraction.
pub trait ProjectionStore: Send + Sync {
    fn get(&self, user_id: UserId) -> Result<Option<ProjectionRecord>, ProjectionStoreError>;

    /// Upsert under the version guard. See [`UpsertOutcome`].
    fn upsert_guarded(
        &self,
        record: ProjectionRecord,
    ) -> Result<UpsertOutcome, ProjectionStoreError>;

    /// Remove a user's projection. Returns whether a row existed.
    fn remove(&self, user_id: UserId) -> Result<bool, ProjectionStoreError>;

    /// All current projections (reconciliation support).
    fn list(&self) -> Result<Vec<ProjectionRecord>, ProjectionStoreError>;
}

impl<S> ProjectionStore for Arc<S>
where
    S: ProjectionStore + ?Sized,
{
    fn get(&self, user_id: UserId) -> Result<Option<ProjectionRecord>, ProjectionStoreError> {
        (**self).get(user_id)
    }

    fn upsert_guarded(
        &self,
        record: ProjectionRecord,
    ) -> Result<UpsertOutcome, ProjectionStoreError> {
        (**self).upsert_guarded(record)
    }

    fn remove(&self, user_id: UserId) -> Result<bool, ProjectionStoreError> {
        (**self).remove(user_id)
    }

    fn list(&self) -> Result<Vec<ProjectionRecord>, ProjectionStoreError> {
        (**self).list()
    }
}

/// Decide what a guarded upsert should do given the stored row's version
/// and checksum.
///
/// Shared by every store implementation so the guard cannot drift between
/// backends.
pub(crate) fn decide_upsert(
    stored: Option<(u64, &str)>,
    incoming_version: u64,
    incoming_checksum: &str,
) -> UpsertOutcome {
    let Some((stored_version, stored_checksum)) = stored else {
        return UpsertOutcome::Applied;
    };

    if incoming_version > stored_version {
        return UpsertOutcome::Applied;
    }

    if incoming_checksum == stored_checksum {
        return UpsertOutcome::IdempotentNoOp;
    }

    if incoming_version == stored_version {
        return UpsertOutcome::ChecksumRepaired;
    }

    UpsertOutcome::StaleIgnored { stored_version }
}

/// In-memory projection store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryProjectionStore {
    rows: RwLock<HashMap<UserId, ProjectionRecord>>,
}

impl InMemoryProjectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Write a row bypassing the guard. Test/ops hook for simulating
    /// manual edits and corruption; production writes go through
    /// [`ProjectionStore::upsert_guarded`].
    pub fn put_unchecked(&self, record: ProjectionRecord) {
        if let Ok(mut rows) = self.rows.write() {
            rows.insert(record.user_id, record);
        }
    }
}

impl ProjectionStore for InMemoryProjectionStore {
    fn get(&self, user_id: UserId) -> Result<Option<ProjectionRecord>, ProjectionStoreError> {
        let rows = self
            .rows
            .read()
            .map_err(|_| ProjectionStoreError::Storage("lock poisoned".to_string()))?;
        Ok(rows.get(&user_id).cloned())
    }

    fn upsert_guarded(
        &self,
        record: ProjectionRecord,
    ) -> Result<UpsertOutcome, ProjectionStoreError> {
        let mut rows = self
            .rows
            .write()
            .map_err(|_| ProjectionStoreError::Storage("lock poisoned".to_string()))?;

        let outcome = decide_upsert(
            rows.get(&record.user_id)
                .map(|r| (r.version, r.checksum.as_str())),
            record.version,
            &record.checksum,
        );

        match &outcome {
            UpsertOutcome::Applied => {
                rows.insert(record.user_id, record);
            }
            UpsertOutcome::ChecksumRepaired => {
                warn!(
                    user_id = %record.user_id,
                    version = record.version,
                    "projection checksum mismatch at equal version, repairing from source-derived payload"
                );
                rows.insert(record.user_id, record);
            }
            UpsertOutcome::IdempotentNoOp | UpsertOutcome::StaleIgnored { .. } => {}
        }

        Ok(outcome)
    }

    fn remove(&self, user_id: UserId) -> Result<bool, ProjectionStoreError> {
        let mut rows = self
            .rows
            .write()
            .map_err(|_| ProjectionStoreError::Storage("lock poisoned".to_string()))?;
        Ok(rows.remove(&user_id).is_some())
    }

    fn list(&self) -> Result<Vec<ProjectionRecord>, ProjectionStoreError> {
        let rows = self
            .rows
            .read()
            .map_err(|_| ProjectionStoreError::Storage("lock poisoned".to_string()))?;
        let mut all: Vec<ProjectionRecord> = rows.values().cloned().collect();
        all.sort_by_key(|r| r.user_id);
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(user_id: UserId, version: u64, checksum: &str) -> ProjectionRecord {
        ProjectionRecord {
            user_id,
            version,
            checksum: checksum.to_string(),
            payload: PublicProfile {
                user_id,
                display_name: "Test".to_string(),
                city: None,
                age: None,
                interests: vec![],
                occasions: Default::default(),
                media: vec![],
                idea_cards: vec![],
            },
            source_updated_at: Utc::now(),
            last_synced_at: Utc::now(),
        }
    }

    #[test]
    fn first_write_applies() {
        let store = InMemoryProjectionStore::new();
        let user = UserId::new();
        let outcome = store.upsert_guarded(record(user, 1, "aaa")).unwrap();
        assert_eq!(outcome, UpsertOutcome::Applied);
        assert_eq!(store.get(user).unwrap().unwrap().version, 1);
    }

    #[test]
    fn newer_version_wins() {
        let store = InMemoryProjectionStore::new();
        let user = UserId::new();
        store.upsert_guarded(record(user, 3, "v3")).unwrap();
        let outcome = store.upsert_guarded(record(user, 5, "v5")).unwrap();
        assert_eq!(outcome, UpsertOutcome::Applied);
        assert_eq!(store.get(user).unwrap().unwrap().checksum, "v5");
    }

    #[test]
    fn delayed_older_version_never_clobbers() {
        let store = InMemoryProjectionStore::new();
        let user = UserId::new();
        store.upsert_guarded(record(user, 5, "v5")).unwrap();

        let outcome = store.upsert_guarded(record(user, 3, "v3")).unwrap();
        assert_eq!(outcome, UpsertOutcome::StaleIgnored { stored_version: 5 });

        let stored = store.get(user).unwrap().unwrap();
        assert_eq!(stored.version, 5);
        assert_eq!(stored.checksum, "v5");
    }

    #[test]
    fn redelivery_is_an_idempotent_no_op() {
        let store = InMemoryProjectionStore::new();
        let user = UserId::new();
        store.upsert_guarded(record(user, 5, "v5")).unwrap();

        let outcome = store.upsert_guarded(record(user, 5, "v5")).unwrap();
        assert_eq!(outcome, UpsertOutcome::IdempotentNoOp);

        // Older version with identical content is likewise a no-op.
        let outcome = store.upsert_guarded(record(user, 4, "v5")).unwrap();
        assert_eq!(outcome, UpsertOutcome::IdempotentNoOp);
    }

    #[test]
    fn equal_version_different_checksum_is_repaired() {
        let store = InMemoryProjectionStore::new();
        let user = UserId::new();
        store.upsert_guarded(record(user, 5, "corrupted")).unwrap();

        let outcome = store.upsert_guarded(record(user, 5, "fresh")).unwrap();
        assert_eq!(outcome, UpsertOutcome::ChecksumRepaired);
        assert_eq!(store.get(user).unwrap().unwrap().checksum, "fresh");
    }
}
