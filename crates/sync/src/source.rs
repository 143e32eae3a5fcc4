//! Read-only access to the source-of-truth profile records.
//!
//! The CRUD layer owns and mutates these; the sync core only reads
//! snapshots (the reconciliation sweep reads fresh ones).

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use giftwell_core::{DomainError, DomainResult, UserId};
use giftwell_profile::ProfileSnapshot;

/// Source record reader.
pub trait SourceStore: Send + Sync {
    /// All users that currently have a source record.
    fn list_users(&self) -> DomainResult<Vec<UserId>>;

    /// Fresh snapshot of one user's current source state.
    fn get(&self, user_id: UserId) -> DomainResult<Option<ProfileSnapshot>>;
}

impl<S> SourceStore for Arc<S>
where
    S: SourceStore + ?Sized,
{
    fn list_users(&self) -> DomainResult<Vec<UserId>> {
        (**self).list_users()
    }

    fn get(&self, user_id: UserId) -> DomainResult<Option<ProfileSnapshot>> {
        (**self).get(user_id)
    }
}

/// In-memory source store for tests/dev, standing in for the external
/// CRUD layer's tables.
#[derive(Debug, Default)]
pub struct InMemorySourceStore {
    records: RwLock<HashMap<UserId, ProfileSnapshot>>,
}

impl InMemorySourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Store a record as the CRUD layer would (version supplied by caller).
    pub fn put(&self, snapshot: ProfileSnapshot) {
        if let Ok(mut records) = self.records.write() {
            records.insert(snapshot.user_id, snapshot);
        }
    }

    /// Delete a record, as the CRUD layer would on account removal.
    pub fn remove(&self, user_id: UserId) {
        if let Ok(mut records) = self.records.write() {
            records.remove(&user_id);
        }
    }
}

impl SourceStore for InMemorySourceStore {
    fn list_users(&self) -> DomainResult<Vec<UserId>> {
        let records = self
            .records
            .read()
            .map_err(|_| DomainError::conflict("source store lock poisoned"))?;
        let mut users: Vec<UserId> = records.keys().copied().collect();
        users.sort();
        Ok(users)
    }

    fn get(&self, user_id: UserId) -> DomainResult<Option<ProfileSnapshot>> {
        let records = self
            .records
            .read()
            .map_err(|_| DomainError::conflict("source store lock poisoned"))?;
        Ok(records.get(&user_id).cloned())
    }
}
