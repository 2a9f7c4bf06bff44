use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gia_core::{AggregationJob, IngestedImageRecord, JobFilter, JobPage, PageRequest, SourceOutcome};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::debug;
use uuid::Uuid;

use crate::store::{ImageStore, JobStore, StoreError};

// 17 bind parameters per row keeps each statement well under the 65535 limit.
const INSERT_CHUNK: usize = 500;

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn dimension(value: Option<u32>) -> Option<i32> {
    value.and_then(|v| i32::try_from(v).ok())
}

#[async_trait]
impl ImageStore for PgStore {
    async fn insert_batch(&self, records: &[IngestedImageRecord]) -> Result<u64, StoreError> {
        // One transaction across chunks, so a failed chunk leaves nothing behind
        // and the reported count of zero stays true.
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;
        for chunk in records.chunks(INSERT_CHUNK) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO ingested_images (id, job_id, source_name, source_trusted, original_id, \
                 image_url, width, height, created_at, author, prompt, negative_prompt, model, \
                 format, content_tags, technical_tags, publication_url) ",
            );
            builder.push_values(chunk, |mut row, record| {
                row.push_bind(Uuid::new_v4())
                    .push_bind(record.job_id)
                    .push_bind(&record.source.name)
                    .push_bind(record.source.is_trusted)
                    .push_bind(&record.original_id)
                    .push_bind(&record.image_url)
                    .push_bind(dimension(record.dimensions.map(|d| d.width)))
                    .push_bind(dimension(record.dimensions.map(|d| d.height)))
                    .push_bind(record.created_at)
                    .push_bind(&record.author)
                    .push_bind(&record.prompt)
                    .push_bind(&record.negative_prompt)
                    .push_bind(&record.model)
                    .push_bind(&record.format)
                    .push_bind(&record.content_tags)
                    .push_bind(&record.technical_tags)
                    .push_bind(&record.publication_url);
            });
            builder.push(" ON CONFLICT (source_name, original_id) DO NOTHING");

            let result = builder.build().execute(&mut *tx).await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;
        debug!(submitted = records.len(), inserted, "bulk image insert");
        Ok(inserted)
    }
}

fn job_from_row(row: &PgRow) -> Result<AggregationJob, StoreError> {
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    let sources: Json<Vec<SourceOutcome>> = row.try_get("sources")?;
    Ok(AggregationJob {
        id: row.try_get("id")?,
        kind: kind.parse().map_err(StoreError::Corrupt)?,
        status: status.parse().map_err(StoreError::Corrupt)?,
        started_at: row.try_get::<DateTime<Utc>, _>("started_at")?,
        finished_at: row.try_get::<Option<DateTime<Utc>>, _>("finished_at")?,
        sources: sources.0,
    })
}

#[async_trait]
impl JobStore for PgStore {
    async fn any_running(&self) -> Result<bool, StoreError> {
        let running: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM aggregation_jobs WHERE status = 'running')",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(running)
    }

    async fn insert_job(&self, job: &AggregationJob) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO aggregation_jobs (id, kind, status, started_at, finished_at, sources)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(job.id)
        .bind(job.kind.as_str())
        .bind(job.status.as_str())
        .bind(job.started_at)
        .bind(job.finished_at)
        .bind(Json(&job.sources))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_job(&self, job: &AggregationJob) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE aggregation_jobs
               SET status = $2,
                   finished_at = $3,
                   sources = $4
             WHERE id = $1
            "#,
        )
        .bind(job.id)
        .bind(job.status.as_str())
        .bind(job.finished_at)
        .bind(Json(&job.sources))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Corrupt(format!("job {} was never inserted", job.id)));
        }
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<AggregationJob>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, kind, status, started_at, finished_at, sources
              FROM aggregation_jobs
             WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn list_jobs(&self, filter: &JobFilter, page: PageRequest) -> Result<JobPage, StoreError> {
        let status = filter.status.map(|s| s.as_str());
        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM aggregation_jobs WHERE ($1::text IS NULL OR status = $1)",
        )
        .bind(status)
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query(
            r#"
            SELECT id, kind, status, started_at, finished_at, sources
              FROM aggregation_jobs
             WHERE ($1::text IS NULL OR status = $1)
             ORDER BY started_at DESC, id DESC
             LIMIT $2 OFFSET $3
            "#,
        )
        .bind(status)
        .bind(i64::from(page.limit))
        .bind(i64::try_from(page.offset()).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        let jobs = rows.iter().map(job_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok(JobPage {
            total: u64::try_from(total).unwrap_or_default(),
            page: page.page,
            jobs,
        })
    }
}
