use std::future::Future;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppError;
use crate::job::{CreateResolutionJob, JobStatus, ResolutionJob};

/// Persistent queue of resolution jobs.
///
/// Implementations must support atomic claiming via `SELECT FOR UPDATE SKIP LOCKED`
/// or equivalent to prevent multiple workers from claiming the same job.
pub trait JobQueue: Send + Sync + Clone {
    /// Enqueue a job. While a job for the same entry is pending or running,
    /// that job is returned instead of creating a second one.
    fn enqueue(
        &self,
        request: CreateResolutionJob,
    ) -> impl Future<Output = Result<ResolutionJob, AppError>> + Send;

    /// Atomically claim the next due pending job.
    ///
    /// Returns `None` if no jobs are available.
    fn claim_job(
        &self,
        worker_id: &str,
    ) -> impl Future<Output = Result<Option<ResolutionJob>, AppError>> + Send;

    fn complete_job(
        &self,
        job_id: Uuid,
        series_id: Uuid,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Mark a job as failed. If `next_retry_at` is provided, the job is
    /// reset to `pending` for retry; otherwise it is marked as permanently `failed`.
    fn fail_job(
        &self,
        job_id: Uuid,
        error: &str,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    fn get_job(
        &self,
        job_id: Uuid,
    ) -> impl Future<Output = Result<Option<ResolutionJob>, AppError>> + Send;

    fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<ResolutionJob>, AppError>> + Send;

    /// Release all jobs held by a specific worker (for graceful shutdown).
    fn release_worker_jobs(
        &self,
        worker_id: &str,
    ) -> impl Future<Output = Result<u64, AppError>> + Send;

    fn count_by_status(
        &self,
        status: JobStatus,
    ) -> impl Future<Output = Result<i64, AppError>> + Send;
}
