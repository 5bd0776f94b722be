use mangashelf_core::{AppError, StorageError};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::config::DatabaseConfig;
use crate::job_repository::ResolutionJobRepository;
use crate::library_repository::LibraryRepository;

/// Central database facade: owns the connection pool, runs migrations,
/// and vends repository instances.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect to PostgreSQL with the given configuration.
    ///
    /// A failed connect surfaces as a storage error whose type name marks it
    /// as a pool initialization failure, which the classifier treats as transient.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, AppError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await
            .map_err(|e| {
                AppError::Storage(
                    StorageError::new(format!("Failed to connect: {e}"))
                        .with_type_name("PoolInitializationError"),
                )
            })?;

        Ok(Self { pool })
    }

    /// Create a `Database` from an existing pool (useful for testing).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<(), AppError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                AppError::Storage(
                    StorageError::new(format!("Migration failed: {e}")).with_type_name("MigrateError"),
                )
            })?;
        Ok(())
    }

    /// Get a [`LibraryRepository`] backed by this pool.
    pub fn library_repo(&self) -> LibraryRepository {
        LibraryRepository::new(self.pool.clone())
    }

    /// Get a [`ResolutionJobRepository`] backed by this pool.
    pub fn job_repo(&self) -> ResolutionJobRepository {
        ResolutionJobRepository::new(self.pool.clone())
    }

    /// Get a reference to the underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
