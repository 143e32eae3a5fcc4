//! Postgres-backed outbox and projection stores.
//!
//! Conceptual schema (migrations live with the deployment):
//!
//! ```sql
//! CREATE TABLE profile_outbox (
//!     id              UUID PRIMARY KEY,
//!     user_id         UUID NOT NULL,
//!     kind            TEXT NOT NULL,
//!     source_version  BIGINT NOT NULL,
//!     snapshot        JSONB,
//!     idempotency_key TEXT NOT NULL UNIQUE,
//!     created_at      TIMESTAMPTZ NOT NULL,
//!     retry_count     INTEGER NOT NULL DEFAULT 0,
//!     last_error      TEXT,
//!     processed_at    TIMESTAMPTZ,
//!     claimed_by      TEXT,
//!     claimed_at      TIMESTAMPTZ
//! );
//! -- Claim scans only ever touch live entries.
//! CREATE INDEX profile_outbox_pending
//!     ON profile_outbox (created_at, id)
//!     WHERE processed_at IS NULL AND retry_count < 5;
//!
//! CREATE TABLE public_projection (
//!     user_id           UUID PRIMARY KEY,
//!     version           BIGINT NOT NULL,
//!     checksum          TEXT NOT NULL,
//!     payload           JSONB NOT NULL,
//!     source_updated_at TIMESTAMPTZ NOT NULL,
//!     last_synced_at    TIMESTAMPTZ NOT NULL
//! );
//! ```
//!
//! The sync store traits are implemented by blocking on the pool from the
//! ambient tokio runtime, mirroring how the projection cursor store does it
//! elsewhere in this workspace's lineage: worker invocations run on the
//! runtime already, so the handle is always available in production.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::warn;

use giftwell_core::{OutboxEntryId, UserId};

use crate::outbox::{ChangeKind, OutboxEntry, OutboxStore, OutboxStoreError, RETRY_CAP};
use crate::projection_store::{
    decide_upsert, ProjectionRecord, ProjectionStore, ProjectionStoreError, UpsertOutcome,
};

/// Postgres-backed outbox store.
#[derive(Debug, Clone)]
pub struct PostgresOutboxStore {
    pool: Arc<PgPool>,
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    fn block_on<T>(
        &self,
        fut: impl core::future::Future<Output = Result<T, sqlx::Error>>,
    ) -> Result<T, OutboxStoreError> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| OutboxStoreError::Storage(format!("no tokio runtime: {e}")))?;
        handle
            .block_on(fut)
            .map_err(|e| OutboxStoreError::Storage(e.to_string()))
    }
}

fn row_to_entry(row: &sqlx::postgres::PgRow) -> Result<OutboxEntry, sqlx::Error> {
    let kind: String = row.try_get("kind")?;
    let kind = match kind.as_str() {
        "upsert" => ChangeKind::Upsert,
        "delete" => ChangeKind::Delete,
        other => {
            return Err(sqlx::Error::Decode(
                format!("unrecognized outbox entry kind: {other}").into(),
            ))
        }
    };

    let snapshot: Option<serde_json::Value> = row.try_get("snapshot")?;
    let snapshot = match snapshot {
        Some(value) => Some(
            serde_json::from_value(value)
                .map_err(|e| sqlx::Error::Decode(e.to_string().into()))?,
        ),
        None => None,
    };

    Ok(OutboxEntry {
        id: OutboxEntryId::from_uuid(row.try_get("id")?),
        user_id: UserId::from_uuid(row.try_get("user_id")?),
        kind,
        source_version: row.try_get::<i64, _>("source_version")? as u64,
        snapshot,
        idempotency_key: row.try_get("idempotency_key")?,
        created_at: row.try_get("created_at")?,
        retry_count: row.try_get::<i32, _>("retry_count")? as u32,
        last_error: row.try_get("last_error")?,
        processed_at: row.try_get("processed_at")?,
        claimed_by: row.try_get("claimed_by")?,
        claimed_at: row.try_get("claimed_at")?,
    })
}

impl OutboxStore for PostgresOutboxStore {
    fn enqueue(&self, entry: OutboxEntry) -> Result<OutboxEntryId, OutboxStoreError> {
        let pool = self.pool.clone();
        let snapshot = match &entry.snapshot {
            Some(s) => Some(
                serde_json::to_value(s)
                    .map_err(|e| OutboxStoreError::Storage(e.to_string()))?,
            ),
            None => None,
        };
        let kind = match entry.kind {
            ChangeKind::Upsert => "upsert",
            ChangeKind::Delete => "delete",
        };

        self.block_on(async move {
            // The unique key makes re-emission a no-op; RETURNING on
            // conflict yields nothing, so fall back to the existing row.
            let inserted = sqlx::query(
                r#"
                INSERT INTO profile_outbox (
                    id, user_id, kind, source_version, snapshot,
                    idempotency_key, created_at, retry_count
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, 0)
                ON CONFLICT (idempotency_key) DO NOTHING
                RETURNING id
                "#,
            )
            .bind(entry.id.as_uuid())
            .bind(entry.user_id.as_uuid())
            .bind(kind)
            .bind(entry.source_version as i64)
            .bind(&snapshot)
            .bind(&entry.idempotency_key)
            .bind(entry.created_at)
            .fetch_optional(&*pool)
            .await?;

            if let Some(row) = inserted {
                return Ok(OutboxEntryId::from_uuid(row.try_get("id")?));
            }

            let existing = sqlx::query(
                "SELECT id FROM profile_outbox WHERE idempotency_key = $1",
            )
            .bind(&entry.idempotency_key)
            .fetch_one(&*pool)
            .await?;
            Ok(OutboxEntryId::from_uuid(existing.try_get("id")?))
        })
    }

    fn claim_batch(
        &self,
        limit: usize,
        claimer: &str,
        lease: Duration,
    ) -> Result<Vec<OutboxEntry>, OutboxStoreError> {
        let pool = self.pool.clone();
        let claimer = claimer.to_string();
        let lease_secs = lease.as_secs_f64();

        self.block_on(async move {
            // SKIP LOCKED keeps overlapping invocations off the same rows
            // even before the lease columns land.
            let rows = sqlx::query(
                r#"
                UPDATE profile_outbox
                SET claimed_by = $1, claimed_at = NOW()
                WHERE id IN (
                    SELECT id FROM profile_outbox
                    WHERE processed_at IS NULL
                      AND retry_count < $2
                      AND (claimed_at IS NULL
                           OR claimed_at + make_interval(secs => $3) <= NOW())
                    ORDER BY created_at, id
                    LIMIT $4
                    FOR UPDATE SKIP LOCKED
                )
                RETURNING *
                "#,
            )
            .bind(&claimer)
            .bind(RETRY_CAP as i32)
            .bind(lease_secs)
            .bind(limit as i64)
            .fetch_all(&*pool)
            .await?;

            let mut entries = Vec::with_capacity(rows.len());
            for row in &rows {
                entries.push(row_to_entry(row)?);
            }
            entries.sort_by_key(|e| (e.created_at, e.id));
            Ok(entries)
        })
    }

    fn mark_processed(&self, id: OutboxEntryId) -> Result<(), OutboxStoreError> {
        let pool = self.pool.clone();
        let uuid = *id.as_uuid();

        let affected = self.block_on(async move {
            let result = sqlx::query(
                r#"
                UPDATE profile_outbox
                SET processed_at = NOW(), claimed_by = NULL, claimed_at = NULL
                WHERE id = $1 AND processed_at IS NULL
                "#,
            )
            .bind(uuid)
            .execute(&*pool)
            .await?;
            Ok(result.rows_affected())
        })?;

        if affected == 0 {
            return Err(OutboxStoreError::NotFound(id));
        }
        Ok(())
    }

    fn record_failure(&self, id: OutboxEntryId, error: &str) -> Result<(), OutboxStoreError> {
        let pool = self.pool.clone();
        let uuid = *id.as_uuid();
        let error = error.to_string();

        let retry_count = self.block_on(async move {
            let row = sqlx::query(
                r#"
                UPDATE profile_outbox
                SET retry_count = retry_count + 1,
                    last_error = $2,
                    claimed_by = NULL,
                    claimed_at = NULL
                WHERE id = $1 AND processed_at IS NULL
                RETURNING retry_count
                "#,
            )
            .bind(uuid)
            .bind(&error)
            .fetch_optional(&*pool)
            .await?;
            Ok(row.map(|r| r.try_get::<i32, _>("retry_count")).transpose()?)
        })?;

        match retry_count {
            None => Err(OutboxStoreError::NotFound(id)),
            Some(count) if count as u32 >= RETRY_CAP => {
                warn!(entry_id = %id, retry_count = count, "outbox entry poisoned after exhausting retries");
                Ok(())
            }
            Some(_) => Ok(()),
        }
    }

    fn get(&self, id: OutboxEntryId) -> Result<Option<OutboxEntry>, OutboxStoreError> {
        let pool = self.pool.clone();
        let uuid = *id.as_uuid();

        self.block_on(async move {
            let row = sqlx::query("SELECT * FROM profile_outbox WHERE id = $1")
                .bind(uuid)
                .fetch_optional(&*pool)
                .await?;
            row.as_ref().map(row_to_entry).transpose()
        })
    }

    fn depth(&self) -> Result<u64, OutboxStoreError> {
        let pool = self.pool.clone();

        self.block_on(async move {
            let row = sqlx::query(
                r#"
                SELECT COUNT(*) AS depth
                FROM profile_outbox
                WHERE processed_at IS NULL AND retry_count < $1
                "#,
            )
            .bind(RETRY_CAP as i32)
            .fetch_one(&*pool)
            .await?;
            Ok(row.try_get::<i64, _>("depth")? as u64)
        })
    }

    fn list_poisoned(&self, limit: usize) -> Result<Vec<OutboxEntry>, OutboxStoreError> {
        let pool = self.pool.clone();

        self.block_on(async move {
            let rows = sqlx::query(
                r#"
                SELECT * FROM profile_outbox
                WHERE processed_at IS NULL AND retry_count >= $1
                ORDER BY created_at, id
                LIMIT $2
                "#,
            )
            .bind(RETRY_CAP as i32)
            .bind(limit as i64)
            .fetch_all(&*pool)
            .await?;

            let mut entries = Vec::with_capacity(rows.len());
            for row in &rows {
                entries.push(row_to_entry(row)?);
            }
            Ok(entries)
        })
    }
}

/// Postgres-backed projection store.
#[derive(Debug, Clone)]
pub struct PostgresProjectionStore {
    pool: Arc<PgPool>,
}

impl PostgresProjectionStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    fn block_on<T>(
        &self,
        fut: impl core::future::Future<Output = Result<T, sqlx::Error>>,
    ) -> Result<T, ProjectionStoreError> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| ProjectionStoreError::Storage(format!("no tokio runtime: {e}")))?;
        handle
            .block_on(fut)
            .map_err(|e| ProjectionStoreError::Storage(e.to_string()))
    }
}

fn row_to_record(row: &sqlx::postgres::PgRow) -> Result<ProjectionRecord, sqlx::Error> {
    let payload: serde_json::Value = row.try_get("payload")?;
    let payload =
        serde_json::from_value(payload).map_err(|e| sqlx::Error::Decode(e.to_string().into()))?;

    Ok(ProjectionRecord {
        user_id: UserId::from_uuid(row.try_get("user_id")?),
        version: row.try_get::<i64, _>("version")? as u64,
        checksum: row.try_get("checksum")?,
        payload,
        source_updated_at: row.try_get("source_updated_at")?,
        last_synced_at: row.try_get("last_synced_at")?,
    })
}

impl ProjectionStore for PostgresProjectionStore {
    fn get(&self, user_id: UserId) -> Result<Option<ProjectionRecord>, ProjectionStoreError> {
        let pool = self.pool.clone();
        let uuid = *user_id.as_uuid();

        self.block_on(async move {
            let row = sqlx::query("SELECT * FROM public_projection WHERE user_id = $1")
                .bind(uuid)
                .fetch_optional(&*pool)
                .await?;
            row.as_ref().map(row_to_record).transpose()
        })
    }

    fn upsert_guarded(
        &self,
        record: ProjectionRecord,
    ) -> Result<UpsertOutcome, ProjectionStoreError> {
        let pool = self.pool.clone();
        let payload = serde_json::to_value(&record.payload)
            .map_err(|e| ProjectionStoreError::Storage(e.to_string()))?;
        let uuid = *record.user_id.as_uuid();
        let version = record.version;
        let checksum = record.checksum.clone();
        let source_updated_at: DateTime<Utc> = record.source_updated_at;
        let last_synced_at: DateTime<Utc> = record.last_synced_at;

        let outcome = self.block_on(async move {
            let mut tx = pool.begin().await?;

            // Row-lock the stored version so concurrent upserts for the
            // same user serialize on the guard decision.
            let stored = sqlx::query(
                "SELECT version, checksum FROM public_projection WHERE user_id = $1 FOR UPDATE",
            )
            .bind(uuid)
            .fetch_optional(&mut *tx)
            .await?;

            let stored = stored
                .map(|row| {
                    Ok::<_, sqlx::Error>((
                        row.try_get::<i64, _>("version")? as u64,
                        row.try_get::<String, _>("checksum")?,
                    ))
                })
                .transpose()?;

            let outcome = decide_upsert(
                stored.as_ref().map(|(v, c)| (*v, c.as_str())),
                version,
                &checksum,
            );

            if matches!(
                outcome,
                UpsertOutcome::Applied | UpsertOutcome::ChecksumRepaired
            ) {
                sqlx::query(
                    r#"
                    INSERT INTO public_projection (
                        user_id, version, checksum, payload,
                        source_updated_at, last_synced_at
                    )
                    VALUES ($1, $2, $3, $4, $5, $6)
                    ON CONFLICT (user_id) DO UPDATE SET
                        version = EXCLUDED.version,
                        checksum = EXCLUDED.checksum,
                        payload = EXCLUDED.payload,
                        source_updated_at = EXCLUDED.source_updated_at,
                        last_synced_at = EXCLUDED.last_synced_at
                    "#,
                )
                .bind(uuid)
                .bind(version as i64)
                .bind(&checksum)
                .bind(&payload)
                .bind(source_updated_at)
                .bind(last_synced_at)
                .execute(&mut *tx)
                .await?;
            }

            tx.commit().await?;
            Ok(outcome)
        })?;

        if outcome == UpsertOutcome::ChecksumRepaired {
            warn!(
                user_id = %record.user_id,
                version = record.version,
                "projection checksum mismatch at equal version, repairing from source-derived payload"
            );
        }

        Ok(outcome)
    }

    fn remove(&self, user_id: UserId) -> Result<bool, ProjectionStoreError> {
        let pool = self.pool.clone();
        let uuid = *user_id.as_uuid();

        self.block_on(async move {
            let result = sqlx::query("DELETE FROM public_projection WHERE user_id = $1")
                .bind(uuid)
                .execute(&*pool)
                .await?;
            Ok(result.rows_affected() > 0)
        })
    }

    fn list(&self) -> Result<Vec<ProjectionRecord>, ProjectionStoreError> {
        let pool = self.pool.clone();

        self.block_on(async move {
            let rows = sqlx::query("SELECT * FROM public_projection ORDER BY user_id")
                .fetch_all(&*pool)
                .await?;

            let mut records = Vec::with_capacity(rows.len());
            for row in &rows {
                records.push(row_to_record(row)?);
            }
            Ok(records)
        })
    }
}
