use mangashelf_core::job::{CreateResolutionJob, JobStatus};
use mangashelf_core::job_queue::JobQueue;
use mangashelf_core::models::NewSeries;
use mangashelf_core::traits::{ResolutionStore, SeriesInsert};
use mangashelf_db::{LibraryRepository, ResolutionJobRepository};
use uuid::Uuid;

use crate::common::{insert_entry, setup_test_db};

async fn entry(pool: &sqlx::PgPool, title: &str) -> Uuid {
    let repo = LibraryRepository::new(pool.clone());
    insert_entry(&repo, title, "other", "https://example.com/entry").await
}

#[tokio::test]
async fn enqueue_and_verify_fields() {
    let (pool, _container) = setup_test_db().await;
    let entry_id = entry(&pool, "Queued").await;
    let repo = ResolutionJobRepository::new(pool);

    let job = repo.enqueue(CreateResolutionJob::new(entry_id)).await.unwrap();

    assert_eq!(job.library_entry_id, entry_id);
    assert_eq!(job.payload().library_entry_id, entry_id);
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.retry_count, 0);
    assert_eq!(job.max_retries, 3);
    assert!(job.worker_id.is_none());
    assert!(job.started_at.is_none());
}

#[tokio::test]
async fn enqueue_is_idempotent_while_active() {
    let (pool, _container) = setup_test_db().await;
    let entry_id = entry(&pool, "Queued Twice").await;
    let repo = ResolutionJobRepository::new(pool);

    let first = repo.enqueue(CreateResolutionJob::new(entry_id)).await.unwrap();
    let second = repo
        .enqueue(CreateResolutionJob::new(entry_id).with_max_retries(10))
        .await
        .unwrap();
    repo.claim_job("worker-1").await.unwrap();
    let third = repo.enqueue(CreateResolutionJob::new(entry_id)).await.unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(first.id, third.id);
    assert_eq!(repo.count_by_status(JobStatus::Pending).await.unwrap(), 0);
    assert_eq!(repo.count_by_status(JobStatus::Running).await.unwrap(), 1);
}

#[tokio::test]
async fn enqueue_after_completion_creates_new_job() {
    let (pool, _container) = setup_test_db().await;
    let entry_id = entry(&pool, "Requeued").await;
    let library = LibraryRepository::new(pool.clone());
    let SeriesInsert::Created(series) = library.insert_series(&NewSeries::from_title("Requeued")).await.unwrap() else {
        panic!("series should be created");
    };
    let repo = ResolutionJobRepository::new(pool);

    let first = repo.enqueue(CreateResolutionJob::new(entry_id)).await.unwrap();
    repo.claim_job("worker-1").await.unwrap();
    repo.complete_job(first.id, series.id).await.unwrap();
    let second = repo.enqueue(CreateResolutionJob::new(entry_id)).await.unwrap();

    assert_ne!(first.id, second.id);
}

#[tokio::test]
async fn claim_job_sets_running_and_worker() {
    let (pool, _container) = setup_test_db().await;
    let entry_id = entry(&pool, "Claimed").await;
    let repo = ResolutionJobRepository::new(pool);
    repo.enqueue(CreateResolutionJob::new(entry_id)).await.unwrap();

    let claimed = repo
        .claim_job("worker-1")
        .await
        .unwrap()
        .expect("Should claim the job");

    assert_eq!(claimed.status, JobStatus::Running);
    assert_eq!(claimed.worker_id.as_deref(), Some("worker-1"));
    assert!(claimed.started_at.is_some());
    assert!(repo.claim_job("worker-2").await.unwrap().is_none());
}

#[tokio::test]
async fn claim_job_returns_none_when_empty() {
    let (pool, _container) = setup_test_db().await;
    let repo = ResolutionJobRepository::new(pool);

    assert!(repo.claim_job("worker-1").await.unwrap().is_none());
}

#[tokio::test]
async fn complete_job_records_series() {
    let (pool, _container) = setup_test_db().await;
    let entry_id = entry(&pool, "Completed").await;
    let library = LibraryRepository::new(pool.clone());
    let SeriesInsert::Created(series) = library.insert_series(&NewSeries::from_title("Completed")).await.unwrap() else {
        panic!("series should be created");
    };
    let repo = ResolutionJobRepository::new(pool);
    let job = repo.enqueue(CreateResolutionJob::new(entry_id)).await.unwrap();
    let claimed = repo.claim_job("worker-1").await.unwrap().unwrap();

    repo.complete_job(claimed.id, series.id).await.unwrap();

    let updated = repo.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(updated.status, JobStatus::Completed);
    assert_eq!(updated.series_id, Some(series.id));
    assert!(updated.completed_at.is_some());
    assert!(updated.worker_id.is_none());
}

#[tokio::test]
async fn fail_job_with_retry_resets_to_pending_and_waits() {
    let (pool, _container) = setup_test_db().await;
    let entry_id = entry(&pool, "Retried").await;
    let repo = ResolutionJobRepository::new(pool);
    let job = repo.enqueue(CreateResolutionJob::new(entry_id)).await.unwrap();
    repo.claim_job("worker-1").await.unwrap();

    let next_retry = chrono::Utc::now() + chrono::TimeDelta::minutes(5);
    repo.fail_job(job.id, "rate limited", Some(next_retry))
        .await
        .unwrap();

    let updated = repo.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(updated.status, JobStatus::Pending);
    assert_eq!(updated.retry_count, 1);
    assert!(updated.next_retry_at.is_some());
    assert_eq!(updated.error_message.as_deref(), Some("rate limited"));
    assert!(updated.worker_id.is_none());
    // Not due yet.
    assert!(repo.claim_job("worker-1").await.unwrap().is_none());
}

#[tokio::test]
async fn fail_job_without_retry_marks_failed() {
    let (pool, _container) = setup_test_db().await;
    let entry_id = entry(&pool, "Failed").await;
    let repo = ResolutionJobRepository::new(pool);
    let job = repo.enqueue(CreateResolutionJob::new(entry_id)).await.unwrap();
    repo.claim_job("worker-1").await.unwrap();

    repo.fail_job(job.id, "permanent error", None).await.unwrap();

    let updated = repo.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(updated.status, JobStatus::Failed);
    assert_eq!(updated.retry_count, 0);
    assert_eq!(updated.error_message.as_deref(), Some("permanent error"));
}

#[tokio::test]
async fn release_worker_jobs_on_shutdown() {
    let (pool, _container) = setup_test_db().await;
    let a = entry(&pool, "Release A").await;
    let b = entry(&pool, "Release B").await;
    let repo = ResolutionJobRepository::new(pool);
    repo.enqueue(CreateResolutionJob::new(a)).await.unwrap();
    repo.enqueue(CreateResolutionJob::new(b)).await.unwrap();
    repo.claim_job("worker-1").await.unwrap();
    repo.claim_job("worker-1").await.unwrap();

    let released = repo.release_worker_jobs("worker-1").await.unwrap();

    assert_eq!(released, 2);
    assert_eq!(repo.count_by_status(JobStatus::Pending).await.unwrap(), 2);
}

#[tokio::test]
async fn list_jobs_with_status_filter() {
    let (pool, _container) = setup_test_db().await;
    let a = entry(&pool, "List A").await;
    let b = entry(&pool, "List B").await;
    let repo = ResolutionJobRepository::new(pool);
    repo.enqueue(CreateResolutionJob::new(a)).await.unwrap();
    repo.enqueue(CreateResolutionJob::new(b)).await.unwrap();
    repo.claim_job("worker-1").await.unwrap();

    assert_eq!(repo.list_jobs(Some(JobStatus::Pending), 10).await.unwrap().len(), 1);
    assert_eq!(repo.list_jobs(Some(JobStatus::Running), 10).await.unwrap().len(), 1);
    assert_eq!(repo.list_jobs(None, 10).await.unwrap().len(), 2);
    assert_eq!(repo.list_jobs(None, 1).await.unwrap().len(), 1);
}
