use std::sync::Arc;

use gia_core::{AggregationJob, SourceOutcome};
use gia_fetchers::{FetcherError, FetcherFactory};
use gia_storage::{ImageStore, StoreError};
use thiserror::Error;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

#[derive(Debug, Error)]
enum SourceError {
    #[error(transparent)]
    Fetcher(#[from] FetcherError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Fans a job out to one task per source and gathers the outcomes in request order.
pub struct SourceCollector {
    images: Arc<dyn ImageStore>,
    factory: Arc<dyn FetcherFactory>,
}

impl SourceCollector {
    pub fn new(images: Arc<dyn ImageStore>, factory: Arc<dyn FetcherFactory>) -> Self {
        Self { images, factory }
    }

    pub fn supported_sources(&self) -> Vec<String> {
        self.factory.supported_sources()
    }

    /// Never fails: a source that errors or panics becomes a `failed` outcome
    /// and the others still run to completion.
    pub async fn collect(&self, job: &AggregationJob) -> Vec<SourceOutcome> {
        let mut names = job.requested_sources();
        if names.is_empty() {
            names = self.factory.supported_sources();
        }

        let tasks = names
            .into_iter()
            .map(|name| {
                let images = self.images.clone();
                let factory = self.factory.clone();
                let span = info_span!("source", job_id = %job.id, source = %name);
                let task = tokio::spawn(run_one_source(images, factory, name.clone(), job.id).instrument(span));
                (name, task)
            })
            .collect::<Vec<_>>();

        let mut outcomes = Vec::with_capacity(tasks.len());
        for (name, task) in tasks {
            let outcome = match task.await {
                Ok(outcome) => outcome,
                Err(err) => {
                    error!(job_id = %job.id, source = %name, error = %err, "source task aborted");
                    SourceOutcome::failed(name)
                }
            };
            outcomes.push(outcome);
        }
        outcomes
    }
}

async fn run_one_source(
    images: Arc<dyn ImageStore>,
    factory: Arc<dyn FetcherFactory>,
    name: String,
    job_id: Uuid,
) -> SourceOutcome {
    match fetch_and_store(images.as_ref(), factory.as_ref(), &name, job_id).await {
        Ok((fetched, inserted)) => {
            info!(fetched, inserted, "source finished");
            SourceOutcome::success(name, fetched, inserted)
        }
        Err(err) => {
            error!(error = %err, "source failed");
            SourceOutcome::failed(name)
        }
    }
}

async fn fetch_and_store(
    images: &dyn ImageStore,
    factory: &dyn FetcherFactory,
    name: &str,
    job_id: Uuid,
) -> Result<(u64, u64), SourceError> {
    let fetcher = factory.create(name)?;
    let mut records = fetcher.fetch_all().await?;
    for record in &mut records {
        record.job_id = Some(job_id);
    }
    let inserted = images.insert_batch(&records).await?;
    Ok((records.len() as u64, inserted))
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::time::Duration;

    use async_trait::async_trait;
    use gia_core::{IngestedImageRecord, SourceRef, UnknownSource};
    use gia_fetchers::{FetcherError, FetcherFactory, ImageFetcher};
    use tokio::sync::Semaphore;

    #[derive(Clone)]
    pub enum Script {
        Records(Vec<IngestedImageRecord>),
        Delayed(Duration, Vec<IngestedImageRecord>),
        /// Holds until a permit is released on the gate.
        Gated(std::sync::Arc<Semaphore>, Vec<IngestedImageRecord>),
        Fail,
        Panic,
    }

    pub fn records(source: &str, ids: &[&str]) -> Vec<IngestedImageRecord> {
        ids.iter()
            .map(|id| {
                let mut record = IngestedImageRecord::new(
                    SourceRef::new(source, false),
                    format!("https://img.test/{source}/{id}.png"),
                );
                record.original_id = Some(id.to_string());
                record
            })
            .collect()
    }

    struct ScriptedFetcher {
        name: String,
        script: Script,
    }

    #[async_trait]
    impl ImageFetcher for ScriptedFetcher {
        fn source(&self) -> SourceRef {
            SourceRef::new(self.name.clone(), false)
        }

        async fn fetch_all(&self) -> Result<Vec<IngestedImageRecord>, FetcherError> {
            match &self.script {
                Script::Records(records) => Ok(records.clone()),
                Script::Delayed(delay, records) => {
                    tokio::time::sleep(*delay).await;
                    Ok(records.clone())
                }
                Script::Gated(gate, records) => {
                    let _permit = gate
                        .acquire()
                        .await
                        .map_err(|e| FetcherError::Browser(e.to_string()))?;
                    Ok(records.clone())
                }
                Script::Fail => Err(FetcherError::Browser("page crashed".into())),
                Script::Panic => panic!("fetcher bug"),
            }
        }
    }

    #[derive(Clone, Default)]
    pub struct ScriptedFactory {
        pub scripts: Vec<(String, Script)>,
    }

    impl ScriptedFactory {
        pub fn with(mut self, name: &str, script: Script) -> Self {
            self.scripts.push((name.to_string(), script));
            self
        }
    }

    impl FetcherFactory for ScriptedFactory {
        fn create(&self, name: &str) -> Result<Box<dyn ImageFetcher>, FetcherError> {
            let scripts = self.scripts.iter().cloned().collect::<HashMap<_, _>>();
            let script = scripts
                .get(name)
                .cloned()
                .ok_or_else(|| FetcherError::UnknownSource(UnknownSource(name.to_string())))?;
            Ok(Box::new(ScriptedFetcher {
                name: name.to_string(),
                script,
            }))
        }

        fn supported_sources(&self) -> Vec<String> {
            self.scripts.iter().map(|(name, _)| name.clone()).collect()
        }
    }
}
