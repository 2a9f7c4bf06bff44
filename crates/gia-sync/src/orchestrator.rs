use std::sync::Arc;

use gia_core::{
    AggregationJob, JobFilter, JobKind, JobPage, PageRequest, SourceName, SourceOutcome, UnknownSource,
};
use gia_fetchers::FetcherFactory;
use gia_storage::{ImageStore, JobStore, StoreError};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::collector::SourceCollector;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Another aggregation job is already running")]
    Conflict,
    #[error(transparent)]
    UnknownSource(#[from] UnknownSource),
    #[error("aggregation job {0} not found")]
    NotFound(Uuid),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A job that has been persisted as running, plus the handle of its
/// collection task. The handle resolves to the finished job.
#[derive(Debug)]
pub struct LaunchedJob {
    pub job: AggregationJob,
    pub completion: JoinHandle<AggregationJob>,
}

/// Creates jobs, runs their collection in the background and records the
/// outcome. At most one job is expected to be running at a time.
#[derive(Clone)]
pub struct AggregationService {
    jobs: Arc<dyn JobStore>,
    collector: Arc<SourceCollector>,
}

impl AggregationService {
    pub fn new(jobs: Arc<dyn JobStore>, images: Arc<dyn ImageStore>, factory: Arc<dyn FetcherFactory>) -> Self {
        Self {
            jobs,
            collector: Arc::new(SourceCollector::new(images, factory)),
        }
    }

    pub fn supported_sources(&self) -> Vec<String> {
        self.collector.supported_sources()
    }

    /// Persists a running job and returns it immediately; collection
    /// continues in the background.
    pub async fn start_job(&self, kind: JobKind, source_names: &[String]) -> Result<AggregationJob, OrchestratorError> {
        Ok(self.launch(kind, source_names).await?.job)
    }

    /// Like [`start_job`](Self::start_job), but also hands back the collection task.
    pub async fn launch(&self, kind: JobKind, source_names: &[String]) -> Result<LaunchedJob, OrchestratorError> {
        for name in source_names {
            name.parse::<SourceName>()?;
        }
        // Check-then-insert is not atomic; two concurrent callers can both pass.
        if self.jobs.any_running().await? {
            return Err(OrchestratorError::Conflict);
        }

        // An empty list stays empty; the collector resolves it to every supported source.
        let job = AggregationJob::start(kind, source_names);
        self.jobs.insert_job(&job).await?;
        info!(job_id = %job.id, %kind, sources = ?source_names, "aggregation job started");

        let service = self.clone();
        let running = job.clone();
        let completion = tokio::spawn(async move {
            let outcomes = service.collector.collect(&running).await;
            service.finish_job(running, outcomes).await
        });
        Ok(LaunchedJob { job, completion })
    }

    /// Scheduled trigger: a job already in flight turns this into a no-op.
    pub async fn run_scheduled(&self) {
        match self.start_job(JobKind::Scheduled, &[]).await {
            Ok(job) => info!(job_id = %job.id, "scheduled aggregation started"),
            Err(OrchestratorError::Conflict) => {
                warn!("skipping scheduled aggregation: another job is already running")
            }
            Err(err) => error!(error = %err, "scheduled aggregation could not start"),
        }
    }

    /// Marks the job finished with its outcomes. A persistence failure is
    /// logged; the job then stays `running` in the store.
    pub async fn finish_job(&self, mut job: AggregationJob, outcomes: Vec<SourceOutcome>) -> AggregationJob {
        job.finish(outcomes);
        match self.jobs.update_job(&job).await {
            Ok(()) => info!(
                job_id = %job.id,
                fetched = job.sources.iter().map(|s| s.fetched_count).sum::<u64>(),
                inserted = job.sources.iter().map(|s| s.inserted_count).sum::<u64>(),
                "aggregation job finished"
            ),
            Err(err) => error!(job_id = %job.id, error = %err, "failed to record finished job"),
        }
        job
    }

    pub async fn get_job(&self, id: Uuid) -> Result<AggregationJob, OrchestratorError> {
        self.jobs
            .get_job(id)
            .await?
            .ok_or(OrchestratorError::NotFound(id))
    }

    pub async fn list_jobs(&self, filter: &JobFilter, page: PageRequest) -> Result<JobPage, OrchestratorError> {
        Ok(self.jobs.list_jobs(filter, page).await?)
    }
}
