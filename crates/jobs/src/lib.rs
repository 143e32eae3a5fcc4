//! `giftwell-jobs` — long-running, checkpointed bulk regeneration.
//!
//! A second queue/worker pair, structurally similar to the sync core: a
//! job record tracks counts and an append-only log, the engine pulls a
//! working set and processes it in small paced batches, and progress is
//! persisted after every item so a crash loses at most one item's work.

pub mod engine;
pub mod sources;
pub mod store;
pub mod types;

pub use engine::{EngineConfig, EngineError, RegenEngine};
pub use sources::{
    AssetSource, GeneratedAsset, GenerationRequest, HeuristicImageSource, IdeaCatalog,
    IdeaCategory, ImageSource, InMemoryIdeaCatalog, KeywordImageSource, RegenItem, SourceChain,
    StaticAssetSource, classify_idea,
};
pub use store::{InMemoryJobStore, JobStore, JobStoreError};
pub use types::{JobStats, JobStatus, RegenJob};
