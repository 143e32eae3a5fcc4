//! Profile domain module (source-of-truth consumer records).
//!
//! This crate contains the mutable profile/preference aggregate as the sync
//! core sees it, implemented purely as deterministic domain types (no IO, no
//! HTTP, no storage). The CRUD layer that mutates these records lives
//! outside this workspace; the sync core only reads snapshots of them.

pub mod media;
pub mod occasion;
pub mod snapshot;

pub use media::{IdeaEnrichment, MediaAsset};
pub use occasion::{normalize_occasion, OccasionKey, OccasionPrefs};
pub use snapshot::ProfileSnapshot;
