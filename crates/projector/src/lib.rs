//! `giftwell-projector` — pure transformation from source snapshots to the
//! whitelisted public payload and its content checksum.
//!
//! No IO beyond the read-only [`MediaCatalog`] / [`EnrichmentCache`]
//! lookups; given the same inputs the projector always yields the same
//! payload and checksum. That determinism is what the version/checksum
//! guard and the reconciliation diff are built on.

pub mod checksum;
pub mod payload;
pub mod project;
pub mod sources;

pub use checksum::payload_checksum;
pub use payload::{IdeaCard, PublicMedia, PublicOccasion, PublicProfile};
pub use project::{project, ProjectError, Projected, Projector, RELEVANCE_THRESHOLD};
pub use sources::{EnrichmentCache, InMemoryEnrichmentCache, InMemoryMediaCatalog, MediaCatalog};
