//! Read-only auxiliary data sources consumed at projection time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use giftwell_core::{DomainError, DomainResult, UserId};
use giftwell_profile::{IdeaEnrichment, MediaAsset};

/// Media assets attached to profiles (only the public ones are served).
pub trait MediaCatalog: Send + Sync {
    fn public_media(&self, user_id: UserId) -> DomainResult<Vec<MediaAsset>>;
}

/// Cached image-enrichment records keyed by idea text.
pub trait EnrichmentCache: Send + Sync {
    /// All cached records for the given idea strings. May return multiple
    /// records per idea; callers deduplicate.
    fn lookup(&self, ideas: &[String]) -> DomainResult<Vec<IdeaEnrichment>>;
}

impl<S> MediaCatalog for Arc<S>
where
    S: MediaCatalog + ?Sized,
{
    fn public_media(&self, user_id: UserId) -> DomainResult<Vec<MediaAsset>> {
        (**self).public_media(user_id)
    }
}

impl<S> EnrichmentCache for Arc<S>
where
    S: EnrichmentCache + ?Sized,
{
    fn lookup(&self, ideas: &[String]) -> DomainResult<Vec<IdeaEnrichment>> {
        (**self).lookup(ideas)
    }
}

/// In-memory media catalog for tests/dev.
///
/// `fail_lookups` simulates an unavailable media backend so degradation
/// paths can be exercised.
#[derive(Debug, Default)]
pub struct InMemoryMediaCatalog {
    assets: RwLock<Vec<MediaAsset>>,
    fail_lookups: AtomicBool,
}

impl InMemoryMediaCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, asset: MediaAsset) {
        if let Ok(mut assets) = self.assets.write() {
            assets.push(asset);
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_lookups.store(failing, Ordering::SeqCst);
    }
}

impl MediaCatalog for InMemoryMediaCatalog {
    fn public_media(&self, user_id: UserId) -> DomainResult<Vec<MediaAsset>> {
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(DomainError::conflict("media catalog unavailable"));
        }

        let assets = self
            .assets
            .read()
            .map_err(|_| DomainError::conflict("media catalog lock poisoned"))?;

        Ok(assets
            .iter()
            .filter(|a| a.user_id == user_id && a.public)
            .cloned()
            .collect())
    }
}

/// In-memory enrichment cache for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryEnrichmentCache {
    records: RwLock<HashMap<String, Vec<IdeaEnrichment>>>,
    fail_lookups: AtomicBool,
}

impl InMemoryEnrichmentCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: IdeaEnrichment) {
        if let Ok(mut records) = self.records.write() {
            records.entry(record.idea.clone()).or_default().push(record);
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_lookups.store(failing, Ordering::SeqCst);
    }
}

impl EnrichmentCache for InMemoryEnrichmentCache {
    fn lookup(&self, ideas: &[String]) -> DomainResult<Vec<IdeaEnrichment>> {
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(DomainError::conflict("enrichment cache unavailable"));
        }

        let records = self
            .records
            .read()
            .map_err(|_| DomainError::conflict("enrichment cache lock poisoned"))?;

        Ok(ideas
            .iter()
            .filter_map(|idea| records.get(idea))
            .flatten()
            .cloned()
            .collect())
    }
}
