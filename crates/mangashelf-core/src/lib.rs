pub mod circuit_breaker;
pub mod error;
pub mod job;
pub mod job_queue;
pub mod models;
pub mod resolver;
pub mod scraper;
pub mod source;
pub mod traits;
pub mod transient;
pub mod worker;


pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerStats, CircuitState,
};
pub use error::{AppError, ScrapeError, ScrapeErrorKind, StorageError};
pub use job::{CreateResolutionJob, JobStatus, ResolutionJob, RetryConfig, WorkerConfig};
pub use job_queue::JobQueue;
pub use models::{
    LibraryEntry, MetadataStatus, NewLibraryEntry, NewSeries, Series, SeriesMetadata, SeriesType,
    normalize_title,
};
pub use resolver::{Resolution, ResolutionAction, ResolutionService, ResolverConfig};
pub use scraper::{ScraperClient, ScraperConfig, ScraperOutcome, SourceTransport};
pub use traits::{MetadataLookup, NoLookup, ResolutionStore, SeriesInsert};
pub use transient::{Failure, FailureShape, is_transient_error};
pub use worker::{TracingWorkerReporter, WorkerEvent, WorkerReporter, WorkerService};
