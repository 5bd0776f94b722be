use chrono::{DateTime, Utc};
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

use mangashelf_core::error::AppError;
use mangashelf_core::job::{CreateResolutionJob, JobStatus, ResolutionJob};
use mangashelf_core::job_queue::JobQueue;

use crate::error::db_error;

/// PostgreSQL-backed job queue using `SELECT FOR UPDATE SKIP LOCKED`.
#[derive(Clone)]
pub struct ResolutionJobRepository {
    pool: Pool<Postgres>,
}

impl ResolutionJobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn active_job(&self, library_entry_id: Uuid) -> Result<Option<ResolutionJob>, AppError> {
        let row = sqlx::query_as::<_, ResolutionJobRow>(
            r#"
            SELECT * FROM resolution_jobs
            WHERE library_entry_id = $1 AND status IN ('pending', 'running')
            "#,
        )
        .bind(library_entry_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(row.map(Into::into))
    }
}

// -- Internal row type for sqlx deserialization --

#[derive(sqlx::FromRow)]
struct ResolutionJobRow {
    id: Uuid,
    library_entry_id: Uuid,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    retry_count: i32,
    max_retries: i32,
    next_retry_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    series_id: Option<Uuid>,
    worker_id: Option<String>,
}

impl From<ResolutionJobRow> for ResolutionJob {
    fn from(row: ResolutionJobRow) -> Self {
        ResolutionJob {
            id: row.id,
            library_entry_id: row.library_entry_id,
            status: row.status.parse().unwrap_or(JobStatus::Pending),
            created_at: row.created_at,
            updated_at: row.updated_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            retry_count: row.retry_count as u32,
            max_retries: row.max_retries as u32,
            next_retry_at: row.next_retry_at,
            error_message: row.error_message,
            series_id: row.series_id,
            worker_id: row.worker_id,
        }
    }
}

impl JobQueue for ResolutionJobRepository {
    async fn enqueue(&self, request: CreateResolutionJob) -> Result<ResolutionJob, AppError> {
        // The active job can finish between a conflicting insert and the
        // re-read; a second round then inserts normally.
        for _ in 0..2 {
            let inserted = sqlx::query_as::<_, ResolutionJobRow>(
                r#"
                INSERT INTO resolution_jobs (library_entry_id, max_retries)
                VALUES ($1, $2)
                ON CONFLICT (library_entry_id) WHERE status IN ('pending', 'running') DO NOTHING
                RETURNING *
                "#,
            )
            .bind(request.library_entry_id)
            .bind(request.max_retries.unwrap_or(3) as i32)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

            if let Some(row) = inserted {
                return Ok(row.into());
            }
            if let Some(active) = self.active_job(request.library_entry_id).await? {
                tracing::debug!(
                    job_id = %active.id,
                    entry_id = %request.library_entry_id,
                    "Entry already has an active resolution job"
                );
                return Ok(active);
            }
        }

        Err(AppError::Generic(format!(
            "Could not enqueue resolution for entry {}",
            request.library_entry_id
        )))
    }

    async fn claim_job(&self, worker_id: &str) -> Result<Option<ResolutionJob>, AppError> {
        let row = sqlx::query_as::<_, ResolutionJobRow>(
            r#"
            UPDATE resolution_jobs
            SET status = 'running', worker_id = $1, started_at = NOW(), updated_at = NOW()
            WHERE id = (
                SELECT id FROM resolution_jobs
                WHERE status = 'pending'
                  AND (next_retry_at IS NULL OR next_retry_at <= NOW())
                ORDER BY next_retry_at NULLS FIRST, created_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(row.map(Into::into))
    }

    async fn complete_job(&self, job_id: Uuid, series_id: Uuid) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE resolution_jobs
            SET status = 'completed', completed_at = NOW(), updated_at = NOW(),
                series_id = $2, error_message = NULL, worker_id = NULL
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(series_id)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(())
    }

    async fn fail_job(
        &self,
        job_id: Uuid,
        error: &str,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE resolution_jobs
            SET
                status = CASE WHEN $3::timestamptz IS NOT NULL THEN 'pending' ELSE 'failed' END,
                retry_count = CASE WHEN $3::timestamptz IS NOT NULL THEN retry_count + 1 ELSE retry_count END,
                next_retry_at = $3,
                error_message = $2,
                updated_at = NOW(),
                worker_id = NULL,
                started_at = CASE WHEN $3::timestamptz IS NOT NULL THEN NULL ELSE started_at END
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(error)
        .bind(next_retry_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<ResolutionJob>, AppError> {
        let row = sqlx::query_as::<_, ResolutionJobRow>(r#"SELECT * FROM resolution_jobs WHERE id = $1"#)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

        Ok(row.map(Into::into))
    }

    async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<ResolutionJob>, AppError> {
        let rows = sqlx::query_as::<_, ResolutionJobRow>(
            r#"
            SELECT * FROM resolution_jobs
            WHERE $1::varchar IS NULL OR status = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(status.map(|s| s.as_str()))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn release_worker_jobs(&self, worker_id: &str) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE resolution_jobs
            SET status = 'pending', worker_id = NULL, started_at = NULL, updated_at = NOW()
            WHERE worker_id = $1 AND status = 'running'
            "#,
        )
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected())
    }

    async fn count_by_status(&self, status: JobStatus) -> Result<i64, AppError> {
        let (count,): (i64,) =
            sqlx::query_as(r#"SELECT COUNT(*) FROM resolution_jobs WHERE status = $1"#)
                .bind(status.as_str())
                .fetch_one(&self.pool)
                .await
                .map_err(db_error)?;

        Ok(count)
    }
}
