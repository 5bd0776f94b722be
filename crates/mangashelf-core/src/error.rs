use std::fmt;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::transient::{Failure, FailureShape, is_transient_error};

/// The failure kinds a scraper surfaces to its callers.
///
/// Callers branch on the kind, never on the message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrapeErrorKind {
    NotFound,
    RateLimited,
    UpstreamUnavailable,
    /// The source refused the request itself (4xx, or an id it cannot accept).
    Rejected,
}

impl fmt::Display for ScrapeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScrapeErrorKind::NotFound => write!(f, "not-found"),
            ScrapeErrorKind::RateLimited => write!(f, "rate-limited"),
            ScrapeErrorKind::UpstreamUnavailable => write!(f, "upstream-unavailable"),
            ScrapeErrorKind::Rejected => write!(f, "rejected"),
        }
    }
}

/// Terminal failure of a scraper call, after retries were exhausted or skipped.
#[derive(Error, Debug, Clone)]
pub enum ScrapeError {
    /// The source answered 404 for the requested resource.
    #[error("{source_name}: series '{external_id}' not found (HTTP 404)")]
    NotFound {
        source_name: String,
        external_id: String,
    },

    /// The source kept throttling us.
    #[error("{source_name}: rate limited, retry after {}s", .retry_after.as_secs())]
    RateLimited {
        source_name: String,
        retry_after: Duration,
    },

    /// Server or network failure that outlived the retry budget.
    #[error("{source_name}: upstream unavailable{}: {message}", status_suffix(.status))]
    Upstream {
        source_name: String,
        status: Option<u16>,
        message: String,
    },

    /// The breaker for the source is open. No network attempt was made.
    #[error("circuit breaker for '{source_name}' is open, retry after {}s", .retry_after.as_secs())]
    CircuitOpen {
        source_name: String,
        retry_after: Duration,
    },

    /// The source refused the request. Says nothing about source health.
    #[error("{source_name}: request rejected{}: {message}", status_suffix(.status))]
    Rejected {
        source_name: String,
        status: Option<u16>,
        message: String,
    },

    /// The source answered 2xx but the payload could not be understood.
    #[error("{source_name}: malformed payload: {message}")]
    Malformed {
        source_name: String,
        message: String,
    },
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}

impl ScrapeError {
    pub fn kind(&self) -> ScrapeErrorKind {
        match self {
            ScrapeError::NotFound { .. } => ScrapeErrorKind::NotFound,
            ScrapeError::RateLimited { .. } => ScrapeErrorKind::RateLimited,
            ScrapeError::Upstream { .. }
            | ScrapeError::CircuitOpen { .. }
            | ScrapeError::Malformed { .. } => ScrapeErrorKind::UpstreamUnavailable,
            ScrapeError::Rejected { .. } => ScrapeErrorKind::Rejected,
        }
    }

    pub fn source_name(&self) -> &str {
        match self {
            ScrapeError::NotFound { source_name, .. }
            | ScrapeError::RateLimited { source_name, .. }
            | ScrapeError::Upstream { source_name, .. }
            | ScrapeError::CircuitOpen { source_name, .. }
            | ScrapeError::Rejected { source_name, .. }
            | ScrapeError::Malformed { source_name, .. } => source_name,
        }
    }

    /// HTTP status of the last attempt, when one was received.
    pub fn status(&self) -> Option<u16> {
        match self {
            ScrapeError::NotFound { .. } => Some(404),
            ScrapeError::RateLimited { .. } => Some(429),
            ScrapeError::Upstream { status, .. } | ScrapeError::Rejected { status, .. } => *status,
            ScrapeError::CircuitOpen { .. } | ScrapeError::Malformed { .. } => None,
        }
    }

    /// How long the caller should wait before asking again, if the source said so.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ScrapeError::RateLimited { retry_after, .. }
            | ScrapeError::CircuitOpen { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, ScrapeError::CircuitOpen { .. })
    }

    /// Whether a later job-level retry has a chance of succeeding.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ScrapeError::RateLimited { .. }
                | ScrapeError::Upstream { .. }
                | ScrapeError::CircuitOpen { .. }
        )
    }
}

/// A failure reported by the storage collaborator.
///
/// Keeps the structural signals (type name, message, code) the transient
/// classifier looks at, instead of flattening them into a string.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}{}", code_suffix(.code.as_deref()))]
pub struct StorageError {
    pub type_name: Option<String>,
    pub message: String,
    pub code: Option<String>,
}

fn code_suffix(code: Option<&str>) -> String {
    code.map(|c| format!(" (code {c})")).unwrap_or_default()
}

/// SQLSTATE for a unique constraint violation.
pub const UNIQUE_VIOLATION: &str = "23505";

impl StorageError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            type_name: None,
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_type_name(mut self, type_name: impl Into<String>) -> Self {
        self.type_name = Some(type_name.into());
        self
    }

    pub fn is_unique_violation(&self) -> bool {
        self.code.as_deref() == Some(UNIQUE_VIOLATION)
    }

    /// Structural view of this error for [`is_transient_error`].
    pub fn to_failure(&self) -> Failure {
        Failure::Shaped(FailureShape {
            type_name: self.type_name.clone(),
            message: Some(self.message.clone()),
            code: self.code.clone(),
        })
    }

    pub fn is_transient(&self) -> bool {
        is_transient_error(&self.to_failure())
    }
}

/// Application-wide error types for mangashelf.
#[derive(Error, Debug)]
pub enum AppError {
    /// Scraping an external source failed.
    #[error("Scrape error: {0}")]
    Scrape(#[from] ScrapeError),

    /// Storage collaborator failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// The library entry does not exist or was soft-deleted.
    #[error("Library entry {0} not found")]
    EntryNotFound(Uuid),

    /// The library entry cannot be resolved as-is.
    #[error("Library entry {entry_id} is invalid: {reason}")]
    InvalidEntry { entry_id: Uuid, reason: String },

    /// A series insert hit the uniqueness constraint but the winning row was not readable.
    #[error("Series '{normalized_title}' conflicted on insert but could not be re-read")]
    SeriesConflict { normalized_title: String },

    /// The series was deleted between being found and being linked.
    #[error("Series {series_id} was deleted before library entry {entry_id} could be linked")]
    SeriesDeleted { entry_id: Uuid, series_id: Uuid },

    /// The job ran out of time.
    #[error("Timed out after {0} seconds")]
    Timeout(u64),

    /// Configuration is missing or invalid.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Returns true if the job-level retry policy should try this again later.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::Scrape(e) => e.is_retryable(),
            AppError::Storage(e) => e.is_transient(),
            // The entry may not be visible yet to this replica.
            AppError::EntryNotFound(_) => true,
            AppError::SeriesConflict { .. }
            | AppError::SeriesDeleted { .. }
            | AppError::Timeout(_) => true,
            _ => false,
        }
    }

    /// Returns true if the resolution service may retry locally, within the same job.
    pub fn is_transient_storage(&self) -> bool {
        match self {
            AppError::Storage(e) => e.is_transient(),
            AppError::SeriesConflict { .. } | AppError::SeriesDeleted { .. } => true,
            _ => false,
        }
    }

    /// Lower bound for the next job-level retry, if the failure carries one.
    pub fn retry_hint(&self) -> Option<Duration> {
        match self {
            AppError::Scrape(e) => e.retry_after(),
            _ => None,
        }
    }
}
