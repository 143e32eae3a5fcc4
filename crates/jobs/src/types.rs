//! Job record and lifecycle.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use giftwell_core::JobId;

/// Job execution status.
///
/// `Running → Completed` or `Running → Failed`; there is no paused state.
/// A crashed run leaves the record `Running` with partial progress until
/// the heartbeat reaper fails it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Summary statistics frozen onto the record when a run finishes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobStats {
    /// Successful items per producing source.
    pub by_source: BTreeMap<String, u32>,
    /// Mean confidence across successful items.
    pub avg_confidence: f64,
}

/// One bulk regeneration run.
///
/// Counters and the log are updated after **every** item, not per batch,
/// so progress is inspectable while the run is live and a crash loses at
/// most one item's work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegenJob {
    pub id: JobId,
    pub job_type: String,
    pub status: JobStatus,
    pub total_items: u32,
    pub processed_items: u32,
    pub success_items: u32,
    pub failed_items: u32,
    /// Id of the last item whose result was persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_checkpoint: Option<String>,
    /// Frozen on completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<JobStats>,
    /// Append-only, one timestamped line per processed item.
    pub log: Vec<String>,
    pub started_at: DateTime<Utc>,
    /// Bumped with every persisted item; stale heartbeats mark an
    /// abandoned run.
    pub heartbeat_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl RegenJob {
    pub fn new(job_type: impl Into<String>, total_items: u32) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            job_type: job_type.into(),
            status: JobStatus::Running,
            total_items,
            processed_items: 0,
            success_items: 0,
            failed_items: 0,
            current_checkpoint: None,
            stats: None,
            log: Vec::new(),
            started_at: now,
            heartbeat_at: now,
            completed_at: None,
        }
    }

    /// Record one successful item.
    pub fn record_success(&mut self, item_id: &str, source: &str, confidence: f64) {
        self.processed_items += 1;
        self.success_items += 1;
        self.current_checkpoint = Some(item_id.to_string());
        self.heartbeat_at = Utc::now();
        self.log.push(format!(
            "{} {item_id} ok via {source} confidence={confidence:.2}",
            Utc::now().to_rfc3339()
        ));
    }

    /// Record one failed item.
    pub fn record_failure(&mut self, item_id: &str, error: &str) {
        self.processed_items += 1;
        self.failed_items += 1;
        self.current_checkpoint = Some(item_id.to_string());
        self.heartbeat_at = Utc::now();
        self.log.push(format!(
            "{} {item_id} failed: {error}",
            Utc::now().to_rfc3339()
        ));
    }

    /// Close the run: freeze stats from the log and settle the terminal
    /// status (`Failed` iff any item failed).
    pub fn finish(&mut self) {
        self.stats = Some(self.summarize());
        self.status = if self.failed_items > 0 {
            JobStatus::Failed
        } else {
            JobStatus::Completed
        };
        self.completed_at = Some(Utc::now());
        self.heartbeat_at = Utc::now();
    }

    /// Fail the run outright (setup error, abandoned heartbeat).
    pub fn fail(&mut self, reason: &str) {
        self.log
            .push(format!("{} run failed: {reason}", Utc::now().to_rfc3339()));
        self.status = JobStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.heartbeat_at = Utc::now();
    }

    /// Item ids of every failed item, parsed back out of the log.
    pub fn failed_item_ids(&self) -> Vec<String> {
        self.log
            .iter()
            .filter_map(|line| {
                let mut parts = line.splitn(3, ' ');
                let _timestamp = parts.next()?;
                let item_id = parts.next()?;
                let rest = parts.next()?;
                rest.starts_with("failed:").then(|| item_id.to_string())
            })
            .collect()
    }

    /// Per-source counts and mean confidence, derived from the log so the
    /// summary stays correct even for a resumed or reaped record.
    fn summarize(&self) -> JobStats {
        let mut by_source: BTreeMap<String, u32> = BTreeMap::new();
        let mut confidence_sum = 0.0;
        let mut successes = 0u32;

        for line in &self.log {
            let mut parts = line.split(' ');
            let _timestamp = parts.next();
            let _item_id = parts.next();
            if parts.next() != Some("ok") {
                continue;
            }
            let _via = parts.next();
            let Some(source) = parts.next() else { continue };
            *by_source.entry(source.to_string()).or_insert(0) += 1;
            if let Some(confidence) = parts
                .next()
                .and_then(|t| t.strip_prefix("confidence="))
                .and_then(|v| v.parse::<f64>().ok())
            {
                confidence_sum += confidence;
                successes += 1;
            }
        }

        let avg_confidence = if successes > 0 {
            confidence_sum / f64::from(successes)
        } else {
            0.0
        };

        JobStats {
            by_source,
            avg_confidence,
        }
    }
}
