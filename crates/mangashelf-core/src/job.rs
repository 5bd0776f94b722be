use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a resolution job in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            _ => Err(format!("Unknown job status: {}", s)),
        }
    }
}

/// Queue-level retry configuration with escalating delays.
///
/// Delay schedule: 1min, 5min, 15min, 60min (capped).
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub max_delay: TimeDelta,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_delay: TimeDelta::minutes(60),
        }
    }
}

impl RetryConfig {
    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> TimeDelta {
        let delay = match attempt {
            0 | 1 => TimeDelta::minutes(1),
            2 => TimeDelta::minutes(5),
            3 => TimeDelta::minutes(15),
            _ => TimeDelta::minutes(60),
        };
        std::cmp::min(delay, self.max_delay)
    }
}

/// The only payload a resolution job carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionPayload {
    pub library_entry_id: Uuid,
}

/// A resolution job in the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionJob {
    pub id: Uuid,
    pub library_entry_id: Uuid,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub series_id: Option<Uuid>,
    pub worker_id: Option<String>,
}

impl ResolutionJob {
    pub fn payload(&self) -> ResolutionPayload {
        ResolutionPayload {
            library_entry_id: self.library_entry_id,
        }
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Next attempt time, never sooner than `hint` (e.g. a source's `Retry-After`).
    pub fn calculate_next_retry(
        &self,
        config: &RetryConfig,
        hint: Option<Duration>,
    ) -> DateTime<Utc> {
        let scheduled = config.delay_for_attempt(self.retry_count + 1);
        let delay = hint
            .and_then(|h| TimeDelta::from_std(h).ok())
            .map_or(scheduled, |h| std::cmp::max(scheduled, h));
        Utc::now() + delay
    }
}

/// Request to enqueue a resolution job.
#[derive(Debug, Clone)]
pub struct CreateResolutionJob {
    pub library_entry_id: Uuid,
    pub max_retries: Option<u32>,
}

impl CreateResolutionJob {
    pub fn new(library_entry_id: Uuid) -> Self {
        Self {
            library_entry_id,
            max_retries: None,
        }
    }

    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = Some(max);
        self
    }
}

/// Configuration for a worker process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub poll_interval: Duration,
    /// A job still running after this long is abandoned and rescheduled.
    pub job_timeout: Duration,
    pub retry_config: RetryConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", &Uuid::new_v4().to_string()[..8]),
            poll_interval: Duration::from_secs(5),
            job_timeout: Duration::from_secs(120),
            retry_config: RetryConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }
}
