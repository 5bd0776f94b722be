use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::AppError;
use crate::job::{ResolutionJob, WorkerConfig};
use crate::job_queue::JobQueue;
use crate::resolver::{Resolution, ResolutionService};
use crate::traits::{MetadataLookup, ResolutionStore};

/// Events emitted by the worker for monitoring/logging.
#[derive(Debug, Clone)]
pub enum WorkerEvent<'a> {
    Started {
        worker_id: &'a str,
    },
    Polling,
    JobClaimed {
        job: &'a ResolutionJob,
    },
    JobStarted {
        job_id: Uuid,
        entry_id: Uuid,
    },
    JobCompleted {
        job_id: Uuid,
        resolution: &'a Resolution,
    },
    JobFailed {
        job_id: Uuid,
        error: &'a str,
        will_retry: bool,
    },
    ShuttingDown {
        worker_id: &'a str,
        jobs_released: u64,
    },
    Stopped {
        worker_id: &'a str,
    },
}

/// Trait for receiving worker events (decoupled logging).
pub trait WorkerReporter: Send + Sync {
    fn report(&self, event: WorkerEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingWorkerReporter;

impl WorkerReporter for TracingWorkerReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        match event {
            WorkerEvent::Started { worker_id } => {
                tracing::info!(%worker_id, "Worker started");
            }
            WorkerEvent::Polling => {
                tracing::debug!("Polling for jobs");
            }
            WorkerEvent::JobClaimed { job } => {
                tracing::info!(
                    job_id = %job.id,
                    entry_id = %job.library_entry_id,
                    retry_count = job.retry_count,
                    "Job claimed"
                );
            }
            WorkerEvent::JobStarted { job_id, entry_id } => {
                tracing::info!(%job_id, %entry_id, "Resolving library entry");
            }
            WorkerEvent::JobCompleted { job_id, resolution } => {
                tracing::info!(
                    %job_id,
                    series_id = %resolution.series_id,
                    action = %resolution.action,
                    "Job completed"
                );
            }
            WorkerEvent::JobFailed {
                job_id,
                error,
                will_retry,
            } => {
                tracing::warn!(%job_id, %error, %will_retry, "Job failed");
            }
            WorkerEvent::ShuttingDown {
                worker_id,
                jobs_released,
            } => {
                tracing::info!(%worker_id, %jobs_released, "Worker shutting down");
            }
            WorkerEvent::Stopped { worker_id } => {
                tracing::info!(%worker_id, "Worker stopped");
            }
        }
    }
}

/// Worker that polls the job queue and resolves library entries.
///
/// Any number of workers may run against the same queue and store; the
/// resolution service keeps concurrent runs converging on one series.
pub struct WorkerService<Q, S, L>
where
    Q: JobQueue,
    S: ResolutionStore,
    L: MetadataLookup,
{
    queue: Q,
    resolver: ResolutionService<S, L>,
    config: WorkerConfig,
}

impl<Q, S, L> WorkerService<Q, S, L>
where
    Q: JobQueue,
    S: ResolutionStore,
    L: MetadataLookup,
{
    pub fn new(queue: Q, resolver: ResolutionService<S, L>, config: WorkerConfig) -> Self {
        Self {
            queue,
            resolver,
            config,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Run the worker loop until cancellation.
    pub async fn run<WR: WorkerReporter>(
        &self,
        cancel_token: CancellationToken,
        reporter: &WR,
    ) -> Result<(), AppError> {
        reporter.report(WorkerEvent::Started {
            worker_id: &self.config.worker_id,
        });

        loop {
            if cancel_token.is_cancelled() {
                break;
            }

            reporter.report(WorkerEvent::Polling);

            match self.process_next(reporter).await {
                Ok(true) => {}
                Ok(false) => {
                    tokio::select! {
                        () = tokio::time::sleep(self.config.poll_interval) => {}
                        () = cancel_token.cancelled() => break,
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to claim job");
                    tokio::select! {
                        () = tokio::time::sleep(self.config.poll_interval * 2) => {}
                        () = cancel_token.cancelled() => break,
                    }
                }
            }
        }

        let released = match self.queue.release_worker_jobs(&self.config.worker_id).await {
            Ok(n) => n,
            Err(e) => {
                tracing::error!(error = %e, "Failed to release worker jobs");
                0
            }
        };

        reporter.report(WorkerEvent::ShuttingDown {
            worker_id: &self.config.worker_id,
            jobs_released: released,
        });
        reporter.report(WorkerEvent::Stopped {
            worker_id: &self.config.worker_id,
        });

        Ok(())
    }

    /// Claim and process a single job. Returns false when the queue had nothing due.
    pub async fn process_next<WR: WorkerReporter>(&self, reporter: &WR) -> Result<bool, AppError> {
        let Some(job) = self.queue.claim_job(&self.config.worker_id).await? else {
            return Ok(false);
        };
        reporter.report(WorkerEvent::JobClaimed { job: &job });
        self.process_job(&job, reporter).await;
        Ok(true)
    }

    async fn process_job<WR: WorkerReporter>(&self, job: &ResolutionJob, reporter: &WR) {
        let entry_id = job.payload().library_entry_id;
        reporter.report(WorkerEvent::JobStarted {
            job_id: job.id,
            entry_id,
        });

        let result = match tokio::time::timeout(self.config.job_timeout, self.resolver.resolve(entry_id)).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Timeout(self.config.job_timeout.as_secs())),
        };

        match result {
            Ok(resolution) => {
                reporter.report(WorkerEvent::JobCompleted {
                    job_id: job.id,
                    resolution: &resolution,
                });
                if let Err(e) = self.queue.complete_job(job.id, resolution.series_id).await {
                    tracing::error!(job_id = %job.id, error = %e, "Failed to mark job completed");
                }
            }
            Err(e) => {
                let error_msg = e.to_string();
                let will_retry = job.can_retry() && e.is_retryable();
                reporter.report(WorkerEvent::JobFailed {
                    job_id: job.id,
                    error: &error_msg,
                    will_retry,
                });

                // A missing entry has no row to mark.
                if !will_retry
                    && !matches!(e, AppError::EntryNotFound(_))
                    && let Err(mark_err) = self.resolver.mark_failed(entry_id, &error_msg).await
                {
                    tracing::error!(%entry_id, error = %mark_err, "Failed to mark entry failed");
                }

                let next_retry = will_retry
                    .then(|| job.calculate_next_retry(&self.config.retry_config, e.retry_hint()));

                if let Err(e) = self.queue.fail_job(job.id, &error_msg, next_retry).await {
                    tracing::error!(job_id = %job.id, error = %e, "Failed to mark job as failed");
                }
            }
        }
    }
}
