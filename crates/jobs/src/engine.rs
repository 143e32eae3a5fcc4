//! Bulk regeneration engine.
//!
//! `start` materializes the working set, records the job, and returns
//! immediately; a background thread processes the items sequentially in
//! small paced batches. Progress (counters, checkpoint, log line,
//! heartbeat) is persisted after every item, so a crash mid-run loses at
//! most one item's work and leaves a `Running` record the reaper can fail.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use giftwell_core::JobId;
use giftwell_observability::MetricsSink;

use super::sources::{GeneratedAsset, GenerationRequest, IdeaCatalog, RegenItem, SourceChain};
use super::store::{JobStore, JobStoreError};
use super::types::{JobStatus, RegenJob};

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Job type recorded on created jobs.
    pub job_type: String,
    /// Items per batch.
    pub batch_size: usize,
    /// Pause between batches (downstream rate-limit backpressure).
    pub batch_pause: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            job_type: "idea_image_regeneration".to_string(),
            batch_size: 5,
            batch_pause: Duration::from_millis(250),
        }
    }
}

/// Engine error.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error("working set unavailable: {0}")]
    Setup(String),
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job {0} is not a terminal failed run")]
    NotRetryable(JobId),
    #[error("job {0} has no failed items to retry")]
    NothingToRetry(JobId),
}

/// Fire-and-continue regeneration engine.
///
/// Cheap to clone (the background run thread carries its own clone).
#[derive(Clone)]
pub struct RegenEngine<J, C, X> {
    jobs: J,
    catalog: C,
    chain: Arc<SourceChain>,
    metrics: X,
    config: EngineConfig,
}

impl<J, C, X> RegenEngine<J, C, X>
where
    J: JobStore + Clone + 'static,
    C: IdeaCatalog + Clone + 'static,
    X: MetricsSink + Clone + 'static,
{
    pub fn new(jobs: J, catalog: C, chain: SourceChain, metrics: X) -> Self {
        Self {
            jobs,
            catalog,
            chain: Arc::new(chain),
            metrics,
            config: EngineConfig::default(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Start a run over items missing a derived asset (or every item when
    /// `force` is set). Returns as soon as the job record exists; the run
    /// continues in the background.
    pub fn start(&self, force: bool) -> Result<JobId, EngineError> {
        let items = self.materialize(force)?;
        self.start_with_items(items, self.config.job_type.clone())
    }

    /// Small smoke-test run over at most two items.
    pub fn start_test(&self) -> Result<JobId, EngineError> {
        let mut items = self.materialize(true)?;
        items.truncate(2);
        self.start_with_items(items, format!("{}_test", self.config.job_type))
    }

    /// Current state of a job.
    pub fn status(&self, job_id: JobId) -> Result<Option<RegenJob>, EngineError> {
        Ok(self.jobs.get(job_id)?)
    }

    /// Start a new run scoped to exactly the failed items of a terminal
    /// failed job, parsed back out of its log.
    pub fn retry_failed(&self, job_id: JobId) -> Result<JobId, EngineError> {
        let job = self
            .jobs
            .get(job_id)?
            .ok_or(EngineError::NotFound(job_id))?;

        if job.status != JobStatus::Failed {
            return Err(EngineError::NotRetryable(job_id));
        }

        let mut items = Vec::new();
        for item_id in job.failed_item_ids() {
            match self.catalog.get_item(&item_id) {
                Ok(Some(item)) => items.push(item),
                Ok(None) => {
                    warn!(job_id = %job_id, item_id, "failed item no longer in catalog, skipping retry")
                }
                Err(err) => return Err(EngineError::Setup(err.to_string())),
            }
        }

        if items.is_empty() {
            return Err(EngineError::NothingToRetry(job_id));
        }

        self.start_with_items(items, format!("{}_retry", job.job_type))
    }

    /// Fail `Running` jobs whose heartbeat went stale (crashed or
    /// abandoned runs). Returns how many were reaped.
    pub fn reap_abandoned(&self, lease: Duration) -> Result<usize, EngineError> {
        let lease = chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::zero());
        let now = Utc::now();
        let mut reaped = 0;

        for mut job in self.jobs.list_by_status(JobStatus::Running, usize::MAX)? {
            if job.heartbeat_at + lease > now {
                continue;
            }
            warn!(
                job_id = %job.id,
                processed = job.processed_items,
                total = job.total_items,
                "reaping abandoned job with stale heartbeat"
            );
            job.fail("heartbeat expired, run abandoned");
            self.jobs.update(&job)?;
            reaped += 1;
        }

        if reaped > 0 {
            self.metrics.incr("jobs.reaped", reaped as u64);
        }
        Ok(reaped)
    }

    fn materialize(&self, force: bool) -> Result<Vec<RegenItem>, EngineError> {
        let items = if force {
            self.catalog.all_items()
        } else {
            self.catalog.items_missing_assets()
        };
        items.map_err(|e| EngineError::Setup(e.to_string()))
    }

    fn start_with_items(
        &self,
        items: Vec<RegenItem>,
        job_type: String,
    ) -> Result<JobId, EngineError> {
        let job = RegenJob::new(job_type, items.len() as u32);
        let job_id = self.jobs.create(job)?;
        self.metrics.incr("jobs.started", 1);

        info!(job_id = %job_id, total = items.len(), "regeneration job accepted");

        let engine = self.clone();
        thread::Builder::new()
            .name(format!("regen-{job_id}"))
            .spawn(move || engine.run(job_id, items))
            .map_err(|e| EngineError::Setup(format!("failed to spawn run thread: {e}")))?;

        Ok(job_id)
    }

    /// The background run: sequential items, paced batches.
    fn run(&self, job_id: JobId, items: Vec<RegenItem>) {
        for (batch_index, batch) in items.chunks(self.config.batch_size.max(1)).enumerate() {
            if batch_index > 0 {
                thread::sleep(self.config.batch_pause);
            }
            for item in batch {
                if !self.apply_item(job_id, item) {
                    return;
                }
            }
        }

        match self.jobs.get(job_id) {
            Ok(Some(mut job)) if job.status == JobStatus::Running => {
                job.finish();
                if let Err(err) = self.jobs.update(&job) {
                    error!(job_id = %job_id, error = %err, "failed to persist finished job");
                    return;
                }
                self.metrics.incr("jobs.completed", 1);
                info!(
                    job_id = %job_id,
                    status = ?job.status,
                    success = job.success_items,
                    failed = job.failed_items,
                    "regeneration job finished"
                );
            }
            Ok(_) => {}
            Err(err) => error!(job_id = %job_id, error = %err, "failed to load job at finish"),
        }
    }

    /// Process one item and persist the result. Returns `false` when the
    /// run should stop (job reaped mid-run or the store is unreachable).
    fn apply_item(&self, job_id: JobId, item: &RegenItem) -> bool {
        let mut job = match self.jobs.get(job_id) {
            Ok(Some(job)) => job,
            Ok(None) => {
                error!(job_id = %job_id, "job record disappeared mid-run");
                return false;
            }
            Err(err) => {
                error!(job_id = %job_id, error = %err, "job store unreachable mid-run");
                return false;
            }
        };

        if job.status != JobStatus::Running {
            info!(job_id = %job_id, status = ?job.status, "job no longer running, stopping run");
            return false;
        }

        match self.process_item(item) {
            Ok(asset) => {
                job.record_success(&item.id, asset.source.as_str(), asset.confidence);
                self.metrics.incr("jobs.items_processed", 1);
            }
            Err(err) => {
                warn!(job_id = %job_id, item_id = %item.id, error = %err, "item failed, continuing run");
                job.record_failure(&item.id, &err);
                self.metrics.incr("jobs.items_processed", 1);
                self.metrics.incr("jobs.items_failed", 1);
            }
        }

        if let Err(err) = self.jobs.update(&job) {
            error!(job_id = %job_id, error = %err, "failed to persist item progress");
            return false;
        }
        true
    }

    /// Per-item pipeline: classify → build parameters → resolve through
    /// the source chain → write the derived asset back.
    fn process_item(&self, item: &RegenItem) -> Result<GeneratedAsset, String> {
        let request = GenerationRequest::for_item(item);
        let asset = self.chain.resolve(&request)?;
        self.catalog
            .save_asset(&item.id, &asset)
            .map_err(|e| format!("saving asset: {e}"))?;
        Ok(asset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    use giftwell_core::{DomainError, DomainResult};
    use giftwell_observability::InMemoryMetrics;

    use crate::sources::{
        AssetSource, ImageSource, InMemoryIdeaCatalog, KeywordImageSource, StaticAssetSource,
    };

    type TestEngine =
        RegenEngine<Arc<InMemoryJobStore>, Arc<InMemoryIdeaCatalog>, Arc<InMemoryMetrics>>;

    use crate::store::InMemoryJobStore;

    /// Primary source that refuses ideas containing a marker word.
    struct Picky;

    impl ImageSource for Picky {
        fn generate(&self, request: &GenerationRequest) -> DomainResult<GeneratedAsset> {
            if request.idea.contains("broken") {
                return Err(DomainError::validation("unrenderable idea"));
            }
            Ok(GeneratedAsset {
                url: format!("https://ai.test/{}", request.item_id),
                confidence: 0.9,
                source: AssetSource::Primary,
            })
        }
    }

    /// Chain whose every source refuses marker ideas, so those items fail
    /// completely.
    fn picky_chain() -> SourceChain {
        struct Refuse;
        impl ImageSource for Refuse {
            fn generate(&self, request: &GenerationRequest) -> DomainResult<GeneratedAsset> {
                if request.idea.contains("broken") {
                    return Err(DomainError::validation("unrenderable idea"));
                }
                KeywordImageSource::new("https://images.test").generate(request)
            }
        }
        struct RefuseStatic;
        impl ImageSource for RefuseStatic {
            fn generate(&self, request: &GenerationRequest) -> DomainResult<GeneratedAsset> {
                if request.idea.contains("broken") {
                    return Err(DomainError::validation("unrenderable idea"));
                }
                StaticAssetSource::new("https://static.test").generate(request)
            }
        }
        SourceChain::new(Box::new(Picky), Box::new(Refuse), Box::new(RefuseStatic))
    }

    struct Harness {
        jobs: Arc<InMemoryJobStore>,
        catalog: Arc<InMemoryIdeaCatalog>,
        metrics: Arc<InMemoryMetrics>,
        engine: TestEngine,
    }

    fn harness(chain: SourceChain) -> Harness {
        let jobs = InMemoryJobStore::arc();
        let catalog = InMemoryIdeaCatalog::arc();
        let metrics = Arc::new(InMemoryMetrics::new());

        let engine = RegenEngine::new(jobs.clone(), catalog.clone(), chain, metrics.clone())
            .with_config(EngineConfig {
                batch_pause: Duration::from_millis(5),
                ..EngineConfig::default()
            });

        Harness {
            jobs,
            catalog,
            metrics,
            engine,
        }
    }

    fn seed_items(h: &Harness, count: usize) {
        for i in 0..count {
            h.catalog.add_item(RegenItem {
                id: format!("item-{i}"),
                idea: format!("gift idea {i}"),
            });
        }
    }

    fn wait_terminal(h: &Harness, job_id: JobId) -> RegenJob {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let job = h.engine.status(job_id).unwrap().unwrap();
            if job.status.is_terminal() {
                return job;
            }
            assert!(Instant::now() < deadline, "job did not finish in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn run_completes_and_freezes_stats() {
        let h = harness(SourceChain::heuristic("https://assets.test"));
        seed_items(&h, 7);

        let job_id = h.engine.start(false).unwrap();
        let job = wait_terminal(&h, job_id);

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.total_items, 7);
        assert_eq!(job.processed_items, 7);
        assert_eq!(job.success_items, 7);
        assert_eq!(job.log.len(), 7);
        assert!(job.stats.is_some());
        assert!(job.completed_at.is_some());

        // Derived assets landed back in the catalog.
        for i in 0..7 {
            assert!(h.catalog.asset_for(&format!("item-{i}")).is_some());
        }
        assert_eq!(h.metrics.value("jobs.items_processed"), 7);
    }

    #[test]
    fn start_skips_items_that_already_have_assets() {
        let h = harness(SourceChain::heuristic("https://assets.test"));
        seed_items(&h, 4);

        let first = h.engine.start(false).unwrap();
        wait_terminal(&h, first);

        // Nothing missing: the next non-forced run is empty, a forced run
        // takes everything again.
        let second = h.engine.start(false).unwrap();
        let job = wait_terminal(&h, second);
        assert_eq!(job.total_items, 0);

        let forced = h.engine.start(true).unwrap();
        let job = wait_terminal(&h, forced);
        assert_eq!(job.total_items, 4);
    }

    #[test]
    fn failing_items_fail_the_run_but_not_each_other() {
        let h = harness(picky_chain());
        h.catalog.add_item(RegenItem {
            id: "item-ok".to_string(),
            idea: "wool scarf".to_string(),
        });
        h.catalog.add_item(RegenItem {
            id: "item-bad".to_string(),
            idea: "broken idea".to_string(),
        });
        h.catalog.add_item(RegenItem {
            id: "item-ok-2".to_string(),
            idea: "ceramic mug".to_string(),
        });

        let job_id = h.engine.start(false).unwrap();
        let job = wait_terminal(&h, job_id);

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.processed_items, 3);
        assert_eq!(job.success_items, 2);
        assert_eq!(job.failed_items, 1);
        assert_eq!(job.failed_item_ids(), vec!["item-bad"]);
    }

    #[test]
    fn retry_failed_scopes_to_exactly_the_failed_subset() {
        let h = harness(picky_chain());
        h.catalog.add_item(RegenItem {
            id: "item-ok".to_string(),
            idea: "wool scarf".to_string(),
        });
        h.catalog.add_item(RegenItem {
            id: "item-bad".to_string(),
            idea: "broken idea".to_string(),
        });

        let job_id = h.engine.start(false).unwrap();
        wait_terminal(&h, job_id);

        let retry_id = h.engine.retry_failed(job_id).unwrap();
        assert_ne!(retry_id, job_id);

        let retry = wait_terminal(&h, retry_id);
        assert_eq!(retry.total_items, 1);
        assert_eq!(retry.failed_item_ids(), vec!["item-bad"]);
        assert!(retry.job_type.ends_with("_retry"));
    }

    #[test]
    fn retry_of_a_completed_job_is_rejected() {
        let h = harness(SourceChain::heuristic("https://assets.test"));
        seed_items(&h, 1);

        let job_id = h.engine.start(false).unwrap();
        wait_terminal(&h, job_id);

        assert!(matches!(
            h.engine.retry_failed(job_id),
            Err(EngineError::NotRetryable(_))
        ));
    }

    #[test]
    fn crash_mid_run_loses_at_most_one_item() {
        let h = harness(SourceChain::heuristic("https://assets.test"));
        seed_items(&h, 5);

        // Drive the per-item path by hand and stop after three items,
        // simulating a crash before the run loop could continue.
        let items = h.catalog.all_items().unwrap();
        let job = RegenJob::new("idea_image_regeneration", items.len() as u32);
        let job_id = h.jobs.create(job).unwrap();

        for item in items.iter().take(3) {
            assert!(h.engine.apply_item(job_id, item));
        }

        let job = h.jobs.get(job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.processed_items, 3);
        assert_eq!(job.success_items + job.failed_items, 3);
        assert_eq!(job.log.len(), 3);
        assert_eq!(job.current_checkpoint.as_deref(), Some("item-2"));
    }

    #[test]
    fn reaper_fails_abandoned_runs() {
        let h = harness(SourceChain::heuristic("https://assets.test"));
        seed_items(&h, 5);

        let items = h.catalog.all_items().unwrap();
        let job = RegenJob::new("idea_image_regeneration", items.len() as u32);
        let job_id = h.jobs.create(job).unwrap();
        h.engine.apply_item(job_id, &items[0]);

        // A zero lease treats any heartbeat as stale.
        let reaped = h.engine.reap_abandoned(Duration::ZERO).unwrap();
        assert_eq!(reaped, 1);

        let job = h.jobs.get(job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.processed_items, 1);

        // A reaped job stops a still-live run loop at the next item.
        assert!(!h.engine.apply_item(job_id, &items[1]));
    }

    #[test]
    fn test_run_caps_the_working_set() {
        let h = harness(SourceChain::heuristic("https://assets.test"));
        seed_items(&h, 9);

        let job_id = h.engine.start_test().unwrap();
        let job = wait_terminal(&h, job_id);
        assert_eq!(job.total_items, 2);
        assert!(job.job_type.ends_with("_test"));
    }
}
