//! Stateless replication batch worker.
//!
//! Each invocation claims one bounded batch, applies every entry
//! independently, and returns. One bad item never blocks the rest; only a
//! setup failure (the claim itself) escalates to the caller.

use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use giftwell_observability::MetricsSink;
use giftwell_projector::{EnrichmentCache, MediaCatalog, Projector};
use serde::Serialize;

use crate::outbox::{ChangeKind, OutboxEntry, OutboxStore, OutboxStoreError};
use crate::projection_store::{ProjectionRecord, ProjectionStore, UpsertOutcome};

/// Result of one batch invocation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub processed: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

/// Worker identity + claim lease configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name recorded on claimed entries and in logs.
    pub name: String,
    /// How long a claim shields entries from overlapping invocations.
    pub claim_lease: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "replication-worker".to_string(),
            claim_lease: Duration::from_secs(60),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease = lease;
        self
    }
}

/// Replication worker: drains outbox entries into the public projection.
pub struct ReplicationWorker<O, P, M, E, X> {
    outbox: O,
    projections: P,
    projector: Projector<M, E>,
    metrics: X,
    config: WorkerConfig,
}

impl<O, P, M, E, X> ReplicationWorker<O, P, M, E, X>
where
    O: OutboxStore,
    P: ProjectionStore,
    M: MediaCatalog,
    E: EnrichmentCache,
    X: MetricsSink,
{
    pub fn new(outbox: O, projections: P, projector: Projector<M, E>, metrics: X) -> Self {
        Self {
            outbox,
            projections,
            projector,
            metrics,
            config: WorkerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Claim and apply up to `limit` entries.
    ///
    /// Per-item failures are recorded on the entry and reported, never
    /// escalated; the claim failure is the only error path out.
    pub fn process_batch(&self, limit: usize) -> Result<BatchReport, OutboxStoreError> {
        let entries =
            self.outbox
                .claim_batch(limit, &self.config.name, self.config.claim_lease)?;

        let mut report = BatchReport::default();

        for entry in &entries {
            match self.apply_entry(entry) {
                Ok(()) => {
                    self.outbox.mark_processed(entry.id)?;
                    report.processed += 1;
                }
                Err(err) => {
                    warn!(
                        worker = %self.config.name,
                        entry_id = %entry.id,
                        user_id = %entry.user_id,
                        error = %err,
                        "outbox entry failed, continuing batch"
                    );
                    self.outbox.record_failure(entry.id, &err)?;
                    report.failed += 1;
                    report.errors.push(format!("{}: {err}", entry.id));
                }
            }
        }

        self.metrics.incr("outbox.processed", report.processed as u64);
        self.metrics.incr("outbox.failed", report.failed as u64);

        info!(
            worker = %self.config.name,
            claimed = entries.len(),
            processed = report.processed,
            failed = report.failed,
            "replication batch finished"
        );

        Ok(report)
    }

    /// Apply one entry from its embedded snapshot.
    fn apply_entry(&self, entry: &OutboxEntry) -> Result<(), String> {
        match entry.kind {
            ChangeKind::Upsert => {
                let snapshot = entry
                    .snapshot
                    .as_ref()
                    .ok_or_else(|| "upsert entry carries no snapshot".to_string())?;

                let projected = self
                    .projector
                    .project_snapshot(snapshot, Utc::now().date_naive())
                    .map_err(|e| e.to_string())?;

                let record = ProjectionRecord {
                    user_id: entry.user_id,
                    version: entry.source_version,
                    checksum: projected.checksum,
                    payload: projected.payload,
                    source_updated_at: snapshot.updated_at,
                    last_synced_at: Utc::now(),
                };

                let outcome = self
                    .projections
                    .upsert_guarded(record)
                    .map_err(|e| e.to_string())?;

                match outcome {
                    UpsertOutcome::Applied => {
                        debug!(entry_id = %entry.id, version = entry.source_version, "projection applied");
                    }
                    UpsertOutcome::IdempotentNoOp => {
                        debug!(entry_id = %entry.id, "redelivered entry, no-op");
                    }
                    UpsertOutcome::StaleIgnored { stored_version } => {
                        debug!(
                            entry_id = %entry.id,
                            entry_version = entry.source_version,
                            stored_version,
                            "stale entry ignored by version guard"
                        );
                    }
                    UpsertOutcome::ChecksumRepaired => {
                        warn!(
                            entry_id = %entry.id,
                            version = entry.source_version,
                            "checksum conflict at equal version repaired"
                        );
                    }
                }

                Ok(())
            }
            ChangeKind::Delete => {
                let existed = self
                    .projections
                    .remove(entry.user_id)
                    .map_err(|e| e.to_string())?;
                debug!(entry_id = %entry.id, user_id = %entry.user_id, existed, "projection removed");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use giftwell_core::UserId;
    use giftwell_observability::InMemoryMetrics;
    use giftwell_profile::ProfileSnapshot;
    use giftwell_projector::{InMemoryEnrichmentCache, InMemoryMediaCatalog};

    use crate::outbox::{InMemoryOutboxStore, RETRY_CAP};
    use crate::projection_store::InMemoryProjectionStore;

    type TestWorker = ReplicationWorker<
        Arc<InMemoryOutboxStore>,
        Arc<InMemoryProjectionStore>,
        Arc<InMemoryMediaCatalog>,
        Arc<InMemoryEnrichmentCache>,
        Arc<InMemoryMetrics>,
    >;

    struct Harness {
        outbox: Arc<InMemoryOutboxStore>,
        projections: Arc<InMemoryProjectionStore>,
        metrics: Arc<InMemoryMetrics>,
        worker: TestWorker,
    }

    fn harness() -> Harness {
        let outbox = InMemoryOutboxStore::arc();
        let projections = InMemoryProjectionStore::arc();
        let media = Arc::new(InMemoryMediaCatalog::new());
        let enrichment = Arc::new(InMemoryEnrichmentCache::new());
        let metrics = Arc::new(InMemoryMetrics::new());

        let worker = ReplicationWorker::new(
            outbox.clone(),
            projections.clone(),
            Projector::new(media, enrichment),
            metrics.clone(),
        );

        Harness {
            outbox,
            projections,
            metrics,
            worker,
        }
    }

    fn snapshot(user_id: UserId, version: u64) -> ProfileSnapshot {
        let mut s = ProfileSnapshot::new(user_id, "Alice", version);
        s.interests = vec![format!("interest-v{version}")];
        s
    }

    fn enqueue_upsert(h: &Harness, user_id: UserId, version: u64) {
        let s = snapshot(user_id, version);
        let key = OutboxEntry::fresh_key("profile", user_id, version);
        h.outbox.enqueue(OutboxEntry::upsert(s, key)).unwrap();
    }

    #[test]
    fn batch_applies_entries_and_updates_metrics() {
        let h = harness();
        let user = UserId::new();
        enqueue_upsert(&h, user, 1);

        let report = h.worker.process_batch(50).unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(report.failed, 0);

        let stored = h.projections.get(user).unwrap().unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(h.metrics.value("outbox.processed"), 1);
        assert_eq!(h.outbox.depth().unwrap(), 0);
    }

    #[test]
    fn applying_the_same_entry_twice_leaves_projection_identical() {
        let h = harness();
        let user = UserId::new();

        let s = snapshot(user, 2);
        h.outbox
            .enqueue(OutboxEntry::upsert(s.clone(), "key-a".to_string()))
            .unwrap();
        h.worker.process_batch(50).unwrap();
        let first = h.projections.get(user).unwrap().unwrap();

        // The same logical event redelivered under a different key.
        h.outbox
            .enqueue(OutboxEntry::upsert(s, "key-b".to_string()))
            .unwrap();
        let report = h.worker.process_batch(50).unwrap();
        assert_eq!(report.processed, 1);

        let second = h.projections.get(user).unwrap().unwrap();
        assert_eq!(second.version, first.version);
        assert_eq!(second.checksum, first.checksum);
        assert_eq!(second.payload, first.payload);
    }

    #[test]
    fn out_of_order_delivery_never_regresses_version() {
        let h = harness();
        let user = UserId::new();

        // Version 5 arrives first, version 3 afterwards.
        enqueue_upsert(&h, user, 5);
        h.worker.process_batch(50).unwrap();
        enqueue_upsert(&h, user, 3);
        let report = h.worker.process_batch(50).unwrap();

        // The late v3 entry is consumed successfully but changes nothing.
        assert_eq!(report.processed, 1);
        let stored = h.projections.get(user).unwrap().unwrap();
        assert_eq!(stored.version, 5);
        assert!(stored.payload.interests.contains(&"interest-v5".to_string()));
    }

    #[test]
    fn one_bad_entry_does_not_block_the_batch() {
        let h = harness();
        let good_before = UserId::new();
        let bad = UserId::new();
        let good_after = UserId::new();

        enqueue_upsert(&h, good_before, 1);

        // Malformed: an upsert with no snapshot attached.
        let mut broken = OutboxEntry::upsert(snapshot(bad, 1), "bad-key".to_string());
        broken.snapshot = None;
        h.outbox.enqueue(broken).unwrap();

        enqueue_upsert(&h, good_after, 1);

        let report = h.worker.process_batch(50).unwrap();
        assert_eq!(report.processed, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.errors.len(), 1);

        assert!(h.projections.get(good_before).unwrap().is_some());
        assert!(h.projections.get(good_after).unwrap().is_some());
        assert!(h.projections.get(bad).unwrap().is_none());
        assert_eq!(h.metrics.value("outbox.failed"), 1);
    }

    #[test]
    fn deterministic_failure_is_retried_to_the_cap_then_poisoned() {
        let h = harness();
        let user = UserId::new();

        let mut broken = OutboxEntry::upsert(snapshot(user, 1), "always-bad".to_string());
        broken.snapshot = None;
        let id = h.outbox.enqueue(broken).unwrap();

        for expected_retry in 1..=RETRY_CAP {
            let report = h.worker.process_batch(50).unwrap();
            assert_eq!(report.failed, 1);
            let entry = h.outbox.get(id).unwrap().unwrap();
            assert_eq!(entry.retry_count, expected_retry);
        }

        // Past the cap the entry is no longer selected.
        let report = h.worker.process_batch(50).unwrap();
        assert_eq!(report.processed + report.failed, 0);
        assert_eq!(h.outbox.list_poisoned(10).unwrap().len(), 1);
    }

    #[test]
    fn delete_entry_removes_the_projection() {
        let h = harness();
        let user = UserId::new();

        enqueue_upsert(&h, user, 1);
        h.worker.process_batch(50).unwrap();
        assert!(h.projections.get(user).unwrap().is_some());

        h.outbox
            .enqueue(OutboxEntry::delete(user, 2, "delete-key".to_string()))
            .unwrap();
        let report = h.worker.process_batch(50).unwrap();
        assert_eq!(report.processed, 1);
        assert!(h.projections.get(user).unwrap().is_none());
    }
}
