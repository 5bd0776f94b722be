pub mod config;
pub mod database;
mod error;
pub mod job_repository;
pub mod library_repository;

pub use config::DatabaseConfig;
pub use database::Database;
pub use job_repository::ResolutionJobRepository;
pub use library_repository::LibraryRepository;
