use mangashelf_core::error::{AppError, StorageError};
use mangashelf_core::transient::CODE_POOL_TIMEOUT;

/// Keeps the signals the transient classifier needs (SQLSTATE, driver
/// message, error kind) instead of flattening `sqlx::Error` to a string.
pub(crate) fn storage_error(err: sqlx::Error) -> StorageError {
    match err {
        sqlx::Error::Database(db) => {
            let error = StorageError::new(db.message()).with_type_name("DatabaseError");
            match db.code() {
                Some(code) => error.with_code(code),
                None => error,
            }
        }
        sqlx::Error::PoolTimedOut => {
            StorageError::new("pool timed out while waiting for an open connection")
                .with_type_name("PoolTimedOut")
                .with_code(CODE_POOL_TIMEOUT)
        }
        sqlx::Error::Io(e) => StorageError::new(e.to_string()).with_type_name("Io"),
        sqlx::Error::Tls(e) => StorageError::new(e.to_string()).with_type_name("Tls"),
        sqlx::Error::PoolClosed => StorageError::new("connection pool is closed").with_type_name("PoolClosed"),
        other => StorageError::new(other.to_string()).with_type_name("SqlxError"),
    }
}

pub(crate) fn db_error(err: sqlx::Error) -> AppError {
    AppError::Storage(storage_error(err))
}
