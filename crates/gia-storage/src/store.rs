use std::collections::HashSet;

use async_trait::async_trait;
use gia_core::{AggregationJob, IngestedImageRecord, JobFilter, JobPage, PageRequest};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("serializing stored value: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("corrupt stored row: {0}")]
    Corrupt(String),
}

/// Deduplicating persistence for normalized image records.
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Unordered bulk insert. Records whose `(source.name, original_id)` already
    /// exists are skipped without affecting the rest; returns how many were written.
    async fn insert_batch(&self, records: &[IngestedImageRecord]) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn any_running(&self) -> Result<bool, StoreError>;
    async fn insert_job(&self, job: &AggregationJob) -> Result<(), StoreError>;
    async fn update_job(&self, job: &AggregationJob) -> Result<(), StoreError>;
    async fn get_job(&self, id: Uuid) -> Result<Option<AggregationJob>, StoreError>;
    async fn list_jobs(&self, filter: &JobFilter, page: PageRequest) -> Result<JobPage, StoreError>;
}

#[derive(Debug, Default)]
struct ImageTable {
    keys: HashSet<(String, String)>,
    rows: Vec<IngestedImageRecord>,
}

/// Process-local store with the same uniqueness rules as the Postgres schema.
#[derive(Debug, Default)]
pub struct MemoryStore {
    jobs: Mutex<Vec<AggregationJob>>,
    images: Mutex<ImageTable>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn images(&self) -> Vec<IngestedImageRecord> {
        self.images.lock().await.rows.clone()
    }

    pub async fn images_for_job(&self, job_id: Uuid) -> Vec<IngestedImageRecord> {
        self.images
            .lock()
            .await
            .rows
            .iter()
            .filter(|r| r.job_id == Some(job_id))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ImageStore for MemoryStore {
    async fn insert_batch(&self, records: &[IngestedImageRecord]) -> Result<u64, StoreError> {
        let mut table = self.images.lock().await;
        let mut inserted = 0;
        for record in records {
            if let Some((source, id)) = record.dedup_key() {
                if !table.keys.insert((source.to_string(), id.to_string())) {
                    continue;
                }
            }
            table.rows.push(record.clone());
            inserted += 1;
        }
        Ok(inserted)
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn any_running(&self) -> Result<bool, StoreError> {
        Ok(self.jobs.lock().await.iter().any(AggregationJob::is_running))
    }

    async fn insert_job(&self, job: &AggregationJob) -> Result<(), StoreError> {
        self.jobs.lock().await.push(job.clone());
        Ok(())
    }

    async fn update_job(&self, job: &AggregationJob) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().await;
        match jobs.iter_mut().find(|j| j.id == job.id) {
            Some(existing) => {
                *existing = job.clone();
                Ok(())
            }
            None => Err(StoreError::Corrupt(format!("job {} was never inserted", job.id))),
        }
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<AggregationJob>, StoreError> {
        Ok(self.jobs.lock().await.iter().find(|j| j.id == id).cloned())
    }

    async fn list_jobs(&self, filter: &JobFilter, page: PageRequest) -> Result<JobPage, StoreError> {
        let mut matched = self
            .jobs
            .lock()
            .await
            .iter()
            .filter(|j| filter.status.map_or(true, |status| j.status == status))
            .cloned()
            .collect::<Vec<_>>();
        matched.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        let total = matched.len() as u64;
        let jobs = matched
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.limit as usize)
            .collect();
        Ok(JobPage {
            total,
            page: page.page,
            jobs,
        })
    }
}
