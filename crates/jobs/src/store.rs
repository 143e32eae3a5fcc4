//! Job record storage.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use giftwell_core::JobId;

use super::types::{JobStatus, RegenJob};

/// Job store abstraction.
pub trait JobStore: Send + Sync {
    /// Persist a new job record.
    fn create(&self, job: RegenJob) -> Result<JobId, JobStoreError>;

    /// Get a job by id.
    fn get(&self, job_id: JobId) -> Result<Option<RegenJob>, JobStoreError>;

    /// Persist the current state of a job.
    fn update(&self, job: &RegenJob) -> Result<(), JobStoreError>;

    /// Jobs with the given status, oldest first.
    fn list_by_status(&self, status: JobStatus, limit: usize)
        -> Result<Vec<RegenJob>, JobStoreError>;

    /// Counts per status.
    fn counts(&self) -> Result<JobCounts, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Aggregate job counts.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct JobCounts {
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    fn create(&self, job: RegenJob) -> Result<JobId, JobStoreError> {
        (**self).create(job)
    }

    fn get(&self, job_id: JobId) -> Result<Option<RegenJob>, JobStoreError> {
        (**self).get(job_id)
    }

    fn update(&self, job: &RegenJob) -> Result<(), JobStoreError> {
        (**self).update(job)
    }

    fn list_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<RegenJob>, JobStoreError> {
        (**self).list_by_status(status, limit)
    }

    fn counts(&self) -> Result<JobCounts, JobStoreError> {
        (**self).counts()
    }
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, RegenJob>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl JobStore for InMemoryJobStore {
    fn create(&self, job: RegenJob) -> Result<JobId, JobStoreError> {
        let mut jobs = self
            .jobs
            .write()
            .map_err(|_| JobStoreError::Storage("lock poisoned".to_string()))?;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    fn get(&self, job_id: JobId) -> Result<Option<RegenJob>, JobStoreError> {
        let jobs = self
            .jobs
            .read()
            .map_err(|_| JobStoreError::Storage("lock poisoned".to_string()))?;
        Ok(jobs.get(&job_id).cloned())
    }

    fn update(&self, job: &RegenJob) -> Result<(), JobStoreError> {
        let mut jobs = self
            .jobs
            .write()
            .map_err(|_| JobStoreError::Storage("lock poisoned".to_string()))?;
        if !jobs.contains_key(&job.id) {
            return Err(JobStoreError::NotFound(job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    fn list_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<RegenJob>, JobStoreError> {
        let jobs = self
            .jobs
            .read()
            .map_err(|_| JobStoreError::Storage("lock poisoned".to_string()))?;
        let mut result: Vec<RegenJob> = jobs
            .values()
            .filter(|j| j.status == status)
            .cloned()
            .collect();
        result.sort_by_key(|j| (j.started_at, j.id));
        result.truncate(limit);
        Ok(result)
    }

    fn counts(&self) -> Result<JobCounts, JobStoreError> {
        let jobs = self
            .jobs
            .read()
            .map_err(|_| JobStoreError::Storage("lock poisoned".to_string()))?;

        let mut counts = JobCounts::default();
        for job in jobs.values() {
            match job.status {
                JobStatus::Running => counts.running += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_get_update_round_trip() {
        let store = InMemoryJobStore::new();
        let job = RegenJob::new("idea_image_regeneration", 10);
        let id = store.create(job.clone()).unwrap();

        let mut loaded = store.get(id).unwrap().unwrap();
        assert_eq!(loaded.total_items, 10);

        loaded.record_success("item-1", "primary", 0.9);
        store.update(&loaded).unwrap();

        let reloaded = store.get(id).unwrap().unwrap();
        assert_eq!(reloaded.processed_items, 1);
    }

    #[test]
    fn duplicate_create_is_rejected() {
        let store = InMemoryJobStore::new();
        let job = RegenJob::new("idea_image_regeneration", 1);
        store.create(job.clone()).unwrap();
        assert!(matches!(
            store.create(job),
            Err(JobStoreError::AlreadyExists(_))
        ));
    }

    #[test]
    fn counts_track_statuses() {
        let store = InMemoryJobStore::new();

        let running = RegenJob::new("idea_image_regeneration", 1);
        store.create(running).unwrap();

        let mut done = RegenJob::new("idea_image_regeneration", 1);
        done.record_success("item-1", "primary", 0.9);
        done.finish();
        store.create(done).unwrap();

        let counts = store.counts().unwrap();
        assert_eq!(counts.running, 1);
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.failed, 0);
    }
}
