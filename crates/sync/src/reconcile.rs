//! Periodic consistency audit between source records and the projection.
//!
//! The sweep never writes the projection itself — divergent users get a
//! fresh outbox entry and the replication worker's normal path performs
//! the write, keeping a single code path for projection mutation.

use chrono::Utc;
use tracing::{debug, info, warn};

use giftwell_core::{DomainError, UserId};
use giftwell_observability::MetricsSink;
use giftwell_projector::{EnrichmentCache, MediaCatalog, Projector};

use crate::outbox::{OutboxEntry, OutboxStore};
use crate::projection_store::ProjectionStore;
use crate::source::SourceStore;
use crate::worker::BatchReport;

/// Why a user was considered out of sync.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Drift {
    MissingProjection,
    ChecksumMismatch,
    StaleVersion { stored: u64, source: u64 },
    OrphanedProjection,
}

/// Reconciliation sweep over all known users.
pub struct ReconciliationSweep<S, O, P, M, E, X> {
    source: S,
    outbox: O,
    projections: P,
    projector: Projector<M, E>,
    metrics: X,
}

impl<S, O, P, M, E, X> ReconciliationSweep<S, O, P, M, E, X>
where
    S: SourceStore,
    O: OutboxStore,
    P: ProjectionStore,
    M: MediaCatalog,
    E: EnrichmentCache,
    X: MetricsSink,
{
    pub fn new(
        source: S,
        outbox: O,
        projections: P,
        projector: Projector<M, E>,
        metrics: X,
    ) -> Self {
        Self {
            source,
            outbox,
            projections,
            projector,
            metrics,
        }
    }

    /// Audit every user and re-inject outbox entries for the divergent
    /// ones. `processed` counts re-enqueued users; `failed` counts users
    /// whose audit errored.
    pub fn reconcile(&self) -> Result<BatchReport, DomainError> {
        let users = self.source.list_users()?;
        let mut report = BatchReport::default();

        for user_id in &users {
            match self.audit_user(*user_id) {
                Ok(Some(drift)) => {
                    debug!(user_id = %user_id, ?drift, "drift detected, entry re-injected");
                    report.processed += 1;
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(user_id = %user_id, error = %err, "reconciliation audit failed for user");
                    report.failed += 1;
                    report.errors.push(format!("{user_id}: {err}"));
                }
            }
        }

        // Projection rows whose source record is gone get a delete entry.
        match self.sweep_orphans(&users) {
            Ok(orphans) => report.processed += orphans,
            Err(err) => {
                warn!(error = %err, "orphan sweep failed");
                report.errors.push(format!("orphan sweep: {err}"));
                report.failed += 1;
            }
        }

        self.metrics
            .incr("reconcile.enqueued", report.processed as u64);

        info!(
            users = users.len(),
            enqueued = report.processed,
            failed = report.failed,
            "reconciliation sweep finished"
        );

        Ok(report)
    }

    /// Compare one user's fresh source projection against the stored row.
    /// On drift, enqueue a fresh entry (new snapshot, new idempotency key)
    /// and report what diverged.
    fn audit_user(&self, user_id: UserId) -> Result<Option<Drift>, String> {
        let snapshot = self
            .source
            .get(user_id)
            .map_err(|e| e.to_string())?
            .ok_or_else(|| "source record disappeared mid-sweep".to_string())?;

        let fresh = self
            .projector
            .project_snapshot(&snapshot, Utc::now().date_naive())
            .map_err(|e| e.to_string())?;

        let stored = self.projections.get(user_id).map_err(|e| e.to_string())?;

        let drift = match stored {
            None => Some(Drift::MissingProjection),
            Some(row) if row.version < snapshot.version => Some(Drift::StaleVersion {
                stored: row.version,
                source: snapshot.version,
            }),
            Some(row) if row.checksum != fresh.checksum => Some(Drift::ChecksumMismatch),
            Some(_) => None,
        };

        if drift.is_some() {
            let key = OutboxEntry::fresh_key("reconcile", user_id, snapshot.version);
            self.outbox
                .enqueue(OutboxEntry::upsert(snapshot, key))
                .map_err(|e| e.to_string())?;
        }

        Ok(drift)
    }

    /// Enqueue delete entries for projections with no surviving source.
    fn sweep_orphans(&self, users: &[UserId]) -> Result<usize, String> {
        let mut orphans = 0;

        for row in self.projections.list().map_err(|e| e.to_string())? {
            if users.contains(&row.user_id) {
                continue;
            }
            debug!(user_id = %row.user_id, drift = ?Drift::OrphanedProjection, "source gone, delete re-injected");
            let key = OutboxEntry::fresh_key("reconcile-delete", row.user_id, row.version);
            self.outbox
                .enqueue(OutboxEntry::delete(row.user_id, row.version, key))
                .map_err(|e| e.to_string())?;
            orphans += 1;
        }

        Ok(orphans)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use giftwell_observability::InMemoryMetrics;
    use giftwell_profile::ProfileSnapshot;
    use giftwell_projector::{InMemoryEnrichmentCache, InMemoryMediaCatalog};

    use crate::outbox::InMemoryOutboxStore;
    use crate::projection_store::InMemoryProjectionStore;
    use crate::worker::ReplicationWorker;

    struct Harness {
        source: Arc<InMemorySourceStore>,
        outbox: Arc<InMemoryOutboxStore>,
        projections: Arc<InMemoryProjectionStore>,
        sweep: ReconciliationSweep<
            Arc<InMemorySourceStore>,
            Arc<InMemoryOutboxStore>,
            Arc<InMemoryProjectionStore>,
            Arc<InMemoryMediaCatalog>,
            Arc<InMemoryEnrichmentCache>,
            Arc<InMemoryMetrics>,
        >,
        worker: ReplicationWorker<
            Arc<InMemoryOutboxStore>,
            Arc<InMemoryProjectionStore>,
            Arc<InMemoryMediaCatalog>,
            Arc<InMemoryEnrichmentCache>,
            Arc<InMemoryMetrics>,
        >,
    }

    use crate::source::InMemorySourceStore;

    fn harness() -> Harness {
        let source = InMemorySourceStore::arc();
        let outbox = InMemoryOutboxStore::arc();
        let projections = InMemoryProjectionStore::arc();
        let media = Arc::new(InMemoryMediaCatalog::new());
        let enrichment = Arc::new(InMemoryEnrichmentCache::new());
        let metrics = Arc::new(InMemoryMetrics::new());

        let sweep = ReconciliationSweep::new(
            source.clone(),
            outbox.clone(),
            projections.clone(),
            Projector::new(media.clone(), enrichment.clone()),
            metrics.clone(),
        );
        let worker = ReplicationWorker::new(
            outbox.clone(),
            projections.clone(),
            Projector::new(media, enrichment),
            metrics,
        );

        Harness {
            source,
            outbox,
            projections,
            sweep,
            worker,
        }
    }

    fn seed_user(h: &Harness, version: u64) -> giftwell_core::UserId {
        let user_id = giftwell_core::UserId::new();
        let mut s = ProfileSnapshot::new(user_id, "Alice", version);
        s.interests = vec!["pottery".to_string()];
        h.source.put(s);
        user_id
    }

    #[test]
    fn in_sync_users_are_left_alone() {
        let h = harness();
        seed_user(&h, 1);

        // First sweep backfills the missing projection via the worker.
        h.sweep.reconcile().unwrap();
        h.worker.process_batch(50).unwrap();

        // Second sweep finds nothing to do.
        let report = h.sweep.reconcile().unwrap();
        assert_eq!(report.processed, 0);
        assert_eq!(h.outbox.depth().unwrap(), 0);
    }

    #[test]
    fn missing_projection_is_backfilled() {
        let h = harness();
        let user = seed_user(&h, 3);

        let report = h.sweep.reconcile().unwrap();
        assert_eq!(report.processed, 1);

        h.worker.process_batch(50).unwrap();
        let row = h.projections.get(user).unwrap().unwrap();
        assert_eq!(row.version, 3);
    }

    #[test]
    fn manually_corrupted_projection_converges_after_one_sweep_and_one_batch() {
        let h = harness();
        let user = seed_user(&h, 2);

        h.sweep.reconcile().unwrap();
        h.worker.process_batch(50).unwrap();
        let healthy = h.projections.get(user).unwrap().unwrap();

        // Corrupt the row directly, bypassing the guard.
        let mut corrupted = healthy.clone();
        corrupted.checksum = "deadbeef".to_string();
        corrupted.payload.display_name = "Mallory".to_string();
        h.projections.put_unchecked(corrupted);

        h.sweep.reconcile().unwrap();
        h.worker.process_batch(50).unwrap();

        let repaired = h.projections.get(user).unwrap().unwrap();
        assert_eq!(repaired.checksum, healthy.checksum);
        assert_eq!(repaired.payload.display_name, "Alice");
    }

    #[test]
    fn stale_version_is_detected_and_refreshed() {
        let h = harness();
        let user = seed_user(&h, 1);

        h.sweep.reconcile().unwrap();
        h.worker.process_batch(50).unwrap();

        // The CRUD layer bumps the source without emitting an event.
        let mut newer = h.source.get(user).unwrap().unwrap();
        newer.version = 2;
        newer.interests.push("cycling".to_string());
        h.source.put(newer);

        h.sweep.reconcile().unwrap();
        h.worker.process_batch(50).unwrap();

        let row = h.projections.get(user).unwrap().unwrap();
        assert_eq!(row.version, 2);
        assert!(row.payload.interests.contains(&"cycling".to_string()));
    }

    #[test]
    fn orphaned_projection_gets_a_delete_entry() {
        let h = harness();
        let user = seed_user(&h, 1);

        h.sweep.reconcile().unwrap();
        h.worker.process_batch(50).unwrap();
        assert!(h.projections.get(user).unwrap().is_some());

        h.source.remove(user);
        let report = h.sweep.reconcile().unwrap();
        assert_eq!(report.processed, 1);

        h.worker.process_batch(50).unwrap();
        assert!(h.projections.get(user).unwrap().is_none());
    }
}
