//! Service wiring: stores, workers, engine, and the catalog bridge that
//! lets the job engine write derived assets back into the enrichment
//! cache the projector reads.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use giftwell_core::DomainResult;
use giftwell_jobs::{
    EngineConfig, GeneratedAsset, IdeaCatalog, InMemoryJobStore, JobStore, RegenEngine, RegenItem,
    SourceChain,
};
use giftwell_observability::{InMemoryMetrics, MetricsSink};
use giftwell_profile::IdeaEnrichment;
use giftwell_projector::{
    EnrichmentCache, InMemoryEnrichmentCache, InMemoryMediaCatalog, MediaCatalog, Projector,
};
use giftwell_sync::{
    InMemoryOutboxStore, InMemoryProjectionStore, InMemorySourceStore, OutboxStore,
    ProjectionStore, ReconciliationSweep, ReplicationWorker, SourceStore,
};

use crate::config::ApiConfig;

pub type DynWorker = ReplicationWorker<
    Arc<dyn OutboxStore>,
    Arc<dyn ProjectionStore>,
    Arc<dyn MediaCatalog>,
    Arc<dyn EnrichmentCache>,
    Arc<dyn MetricsSink>,
>;

pub type DynSweep = ReconciliationSweep<
    Arc<dyn SourceStore>,
    Arc<dyn OutboxStore>,
    Arc<dyn ProjectionStore>,
    Arc<dyn MediaCatalog>,
    Arc<dyn EnrichmentCache>,
    Arc<dyn MetricsSink>,
>;

pub type DynEngine = RegenEngine<Arc<dyn JobStore>, Arc<dyn IdeaCatalog>, Arc<dyn MetricsSink>>;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub worker: Arc<DynWorker>,
    pub sweep: Arc<DynSweep>,
    pub engine: DynEngine,
    pub outbox: Arc<dyn OutboxStore>,
    pub jobs: Arc<dyn JobStore>,
    pub metrics: Arc<dyn MetricsSink>,
    pub default_batch_size: u32,
}

/// Working-set view over the source records' gift ideas.
///
/// Item ids are idea slugs; saving an asset writes an enrichment record
/// the payload projector picks up on the next sync — the job engine never
/// touches the projection directly.
pub struct IdeaCatalogBridge {
    source: Arc<dyn SourceStore>,
    enrichment: Arc<InMemoryEnrichmentCache>,
}

impl IdeaCatalogBridge {
    pub fn new(source: Arc<dyn SourceStore>, enrichment: Arc<InMemoryEnrichmentCache>) -> Self {
        Self { source, enrichment }
    }

    fn distinct_ideas(&self) -> DomainResult<Vec<RegenItem>> {
        let mut seen = std::collections::BTreeMap::new();
        for user_id in self.source.list_users()? {
            let Some(snapshot) = self.source.get(user_id)? else {
                continue;
            };
            for idea in snapshot.gift_ideas {
                seen.entry(idea_slug(&idea)).or_insert(idea);
            }
        }
        Ok(seen
            .into_iter()
            .map(|(id, idea)| RegenItem { id, idea })
            .collect())
    }
}

/// Stable slug for an idea string, used as the regen item id.
pub fn idea_slug(idea: &str) -> String {
    idea.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

impl IdeaCatalog for IdeaCatalogBridge {
    fn items_missing_assets(&self) -> DomainResult<Vec<RegenItem>> {
        let items = self.distinct_ideas()?;
        let mut missing = Vec::new();
        for item in items {
            let cached = self.enrichment.lookup(std::slice::from_ref(&item.idea))?;
            if cached.is_empty() {
                missing.push(item);
            }
        }
        Ok(missing)
    }

    fn all_items(&self) -> DomainResult<Vec<RegenItem>> {
        self.distinct_ideas()
    }

    fn get_item(&self, item_id: &str) -> DomainResult<Option<RegenItem>> {
        Ok(self
            .distinct_ideas()?
            .into_iter()
            .find(|i| i.id == item_id))
    }

    fn save_asset(&self, item_id: &str, asset: &GeneratedAsset) -> DomainResult<()> {
        let Some(item) = self.get_item(item_id)? else {
            // The idea was removed mid-run; the asset has nowhere to land.
            return Ok(());
        };
        self.enrichment.insert(IdeaEnrichment {
            idea: item.idea,
            image_url: asset.url.clone(),
            relevance: asset.confidence,
            cached_at: Utc::now(),
        });
        Ok(())
    }
}

/// All in-memory services plus the concrete store handles (tests and dev
/// seeding go through these; handlers only see [`AppState`]).
pub struct InMemoryServices {
    pub source: Arc<InMemorySourceStore>,
    pub outbox: Arc<InMemoryOutboxStore>,
    pub projections: Arc<InMemoryProjectionStore>,
    pub media: Arc<InMemoryMediaCatalog>,
    pub enrichment: Arc<InMemoryEnrichmentCache>,
    pub jobs: Arc<InMemoryJobStore>,
    pub metrics: Arc<InMemoryMetrics>,
    pub state: AppState,
}

/// Wire every component against in-memory stores (dev/test).
pub fn build_in_memory_services(config: &ApiConfig) -> InMemoryServices {
    let source = InMemorySourceStore::arc();
    let outbox = InMemoryOutboxStore::arc();
    let projections = InMemoryProjectionStore::arc();
    let media = Arc::new(InMemoryMediaCatalog::new());
    let enrichment = Arc::new(InMemoryEnrichmentCache::new());
    let jobs = InMemoryJobStore::arc();
    let metrics = Arc::new(InMemoryMetrics::new());

    let state = build_state(
        source.clone() as Arc<dyn SourceStore>,
        outbox.clone() as Arc<dyn OutboxStore>,
        projections.clone() as Arc<dyn ProjectionStore>,
        media.clone() as Arc<dyn MediaCatalog>,
        enrichment.clone(),
        jobs.clone() as Arc<dyn JobStore>,
        metrics.clone() as Arc<dyn MetricsSink>,
        config,
    );

    info!("in-memory service wiring ready");

    InMemoryServices {
        source,
        outbox,
        projections,
        media,
        enrichment,
        jobs,
        metrics,
        state,
    }
}

/// Wire against Postgres-backed outbox + projection stores. The source
/// records, media and enrichment caches stay in-process: they are owned
/// by the external CRUD layer and the job engine respectively.
#[cfg(feature = "postgres")]
pub fn build_postgres_state(config: &ApiConfig, pool: sqlx::PgPool) -> AppState {
    use giftwell_sync::postgres::{PostgresOutboxStore, PostgresProjectionStore};

    let source = InMemorySourceStore::arc();
    let outbox: Arc<dyn OutboxStore> = Arc::new(PostgresOutboxStore::new(pool.clone()));
    let projections: Arc<dyn ProjectionStore> = Arc::new(PostgresProjectionStore::new(pool));
    let media = Arc::new(InMemoryMediaCatalog::new());
    let enrichment = Arc::new(InMemoryEnrichmentCache::new());
    let jobs = InMemoryJobStore::arc();
    let metrics = Arc::new(InMemoryMetrics::new());

    let state = build_state(
        source as Arc<dyn SourceStore>,
        outbox,
        projections,
        media as Arc<dyn MediaCatalog>,
        enrichment,
        jobs as Arc<dyn JobStore>,
        metrics as Arc<dyn MetricsSink>,
        config,
    );

    info!("postgres service wiring ready");
    state
}

#[allow(clippy::too_many_arguments)]
fn build_state(
    source: Arc<dyn SourceStore>,
    outbox: Arc<dyn OutboxStore>,
    projections: Arc<dyn ProjectionStore>,
    media: Arc<dyn MediaCatalog>,
    enrichment: Arc<InMemoryEnrichmentCache>,
    jobs: Arc<dyn JobStore>,
    metrics: Arc<dyn MetricsSink>,
    config: &ApiConfig,
) -> AppState {
    let enrichment_dyn: Arc<dyn EnrichmentCache> = enrichment.clone();

    let worker = Arc::new(
        ReplicationWorker::new(
            outbox.clone(),
            projections.clone(),
            Projector::new(media.clone(), enrichment_dyn.clone()),
            metrics.clone(),
        )
        .with_config(
            giftwell_sync::worker::WorkerConfig::default().with_claim_lease(config.claim_lease),
        ),
    );

    let sweep = Arc::new(ReconciliationSweep::new(
        source.clone(),
        outbox.clone(),
        projections,
        Projector::new(media, enrichment_dyn),
        metrics.clone(),
    ));

    let catalog: Arc<dyn IdeaCatalog> =
        Arc::new(IdeaCatalogBridge::new(source, enrichment));

    let engine = RegenEngine::new(
        jobs.clone(),
        catalog,
        SourceChain::heuristic(&config.asset_base_url),
        metrics.clone(),
    )
    .with_config(EngineConfig {
        batch_pause: config.job_batch_pause,
        ..EngineConfig::default()
    });

    AppState {
        worker,
        sweep,
        engine,
        outbox,
        jobs,
        metrics,
        default_batch_size: config.default_batch_size,
    }
}
