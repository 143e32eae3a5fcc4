//! `giftwell-sync` — the asynchronous consistency core.
//!
//! A durable outbox of pending change events, a stateless replication
//! worker that drains it into the public projection under a version +
//! checksum guard, and a reconciliation sweep that re-injects entries for
//! drifted users. All projection mutation flows through the worker — the
//! sweep only enqueues.

pub mod outbox;
pub mod projection_store;
pub mod reconcile;
pub mod source;
pub mod worker;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use outbox::{
    ChangeKind, InMemoryOutboxStore, OutboxEntry, OutboxStore, OutboxStoreError, RETRY_CAP,
};
pub use projection_store::{
    InMemoryProjectionStore, ProjectionRecord, ProjectionStore, ProjectionStoreError,
    UpsertOutcome,
};
pub use reconcile::ReconciliationSweep;
pub use source::{InMemorySourceStore, SourceStore};
pub use worker::{BatchReport, ReplicationWorker, WorkerConfig};
