use chrono::{DateTime, Utc};
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

use mangashelf_core::error::{AppError, StorageError};
use mangashelf_core::models::{LibraryEntry, MetadataStatus, NewLibraryEntry, NewSeries, Series};
use mangashelf_core::traits::{ResolutionStore, SeriesInsert};

use crate::error::{db_error, storage_error};

/// PostgreSQL-backed library entries and series.
///
/// Reads exclude soft-deleted rows. Series identity is enforced by the
/// partial unique index on `normalized_title`.
#[derive(Clone)]
pub struct LibraryRepository {
    pool: Pool<Postgres>,
}

impl LibraryRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Import a new entry in `pending` state.
    pub async fn insert_entry(&self, entry: &NewLibraryEntry) -> Result<LibraryEntry, AppError> {
        let row = sqlx::query_as::<_, EntryRow>(
            r#"
            INSERT INTO library_entries (imported_title, source_name, source_url)
            VALUES ($1, $2, $3)
            RETURNING *
            "#,
        )
        .bind(&entry.imported_title)
        .bind(&entry.source_name)
        .bind(&entry.source_url)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(row.into())
    }

    /// Ids of live entries in the given status, oldest first.
    pub async fn list_entry_ids(
        &self,
        status: MetadataStatus,
        limit: usize,
    ) -> Result<Vec<Uuid>, AppError> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT id FROM library_entries
            WHERE metadata_status = $1 AND deleted_at IS NULL
            ORDER BY created_at ASC
            LIMIT $2
            "#,
        )
        .bind(status.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    pub async fn soft_delete_entry(&self, entry_id: Uuid) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE library_entries SET deleted_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(entry_id)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() == 1)
    }

    /// Soft-deletes a series, freeing its normalized title for a new row.
    pub async fn soft_delete_series(&self, series_id: Uuid) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE series SET deleted_at = NOW()
            WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(series_id)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() == 1)
    }
}

// -- Internal row types for sqlx deserialization --

#[derive(sqlx::FromRow)]
struct EntryRow {
    id: Uuid,
    imported_title: String,
    source_name: String,
    source_url: String,
    series_id: Option<Uuid>,
    metadata_status: String,
    metadata_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<EntryRow> for LibraryEntry {
    fn from(row: EntryRow) -> Self {
        LibraryEntry {
            id: row.id,
            imported_title: row.imported_title,
            source_name: row.source_name,
            source_url: row.source_url,
            series_id: row.series_id,
            metadata_status: row.metadata_status.parse().unwrap_or(MetadataStatus::Pending),
            metadata_error: row.metadata_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct SeriesRow {
    id: Uuid,
    title: String,
    normalized_title: String,
    series_type: Option<String>,
    status: Option<String>,
    description: Option<String>,
    cover_url: Option<String>,
    alt_titles: Vec<String>,
    external_source: Option<String>,
    external_id: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<SeriesRow> for Series {
    fn from(row: SeriesRow) -> Self {
        Series {
            id: row.id,
            title: row.title,
            normalized_title: row.normalized_title,
            series_type: row.series_type.and_then(|t| t.parse().ok()),
            status: row.status,
            description: row.description,
            cover_url: row.cover_url,
            alt_titles: row.alt_titles,
            external_source: row.external_source,
            external_id: row.external_id,
            created_at: row.created_at,
        }
    }
}

impl ResolutionStore for LibraryRepository {
    async fn get_entry(&self, entry_id: Uuid) -> Result<Option<LibraryEntry>, StorageError> {
        let row = sqlx::query_as::<_, EntryRow>(
            r#"SELECT * FROM library_entries WHERE id = $1 AND deleted_at IS NULL"#,
        )
        .bind(entry_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(row.map(Into::into))
    }

    async fn get_series(&self, series_id: Uuid) -> Result<Option<Series>, StorageError> {
        let row = sqlx::query_as::<_, SeriesRow>(
            r#"SELECT * FROM series WHERE id = $1 AND deleted_at IS NULL"#,
        )
        .bind(series_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(row.map(Into::into))
    }

    async fn find_series_by_normalized_title(
        &self,
        normalized_title: &str,
    ) -> Result<Option<Series>, StorageError> {
        let row = sqlx::query_as::<_, SeriesRow>(
            r#"SELECT * FROM series WHERE normalized_title = $1 AND deleted_at IS NULL"#,
        )
        .bind(normalized_title)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(row.map(Into::into))
    }

    async fn insert_series(&self, series: &NewSeries) -> Result<SeriesInsert, StorageError> {
        let result = sqlx::query_as::<_, SeriesRow>(
            r#"
            INSERT INTO series (
                title, normalized_title, series_type, status, description,
                cover_url, alt_titles, external_source, external_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (normalized_title) WHERE deleted_at IS NULL DO NOTHING
            RETURNING *
            "#,
        )
        .bind(&series.title)
        .bind(&series.normalized_title)
        .bind(series.series_type.map(|t| t.as_str()))
        .bind(&series.status)
        .bind(&series.description)
        .bind(&series.cover_url)
        .bind(&series.alt_titles)
        .bind(&series.external_source)
        .bind(&series.external_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error);

        match result {
            Ok(Some(row)) => Ok(SeriesInsert::Created(row.into())),
            Ok(None) => Ok(SeriesInsert::Conflict),
            Err(e) if e.is_unique_violation() => Ok(SeriesInsert::Conflict),
            Err(e) => Err(e),
        }
    }

    async fn link_entry(&self, entry_id: Uuid, series_id: Uuid) -> Result<bool, StorageError> {
        let mut tx = self.pool.begin().await.map_err(storage_error)?;

        // Holds the series row so it cannot be soft-deleted under the link.
        let series: Option<(Uuid,)> = sqlx::query_as(
            r#"SELECT id FROM series WHERE id = $1 AND deleted_at IS NULL FOR SHARE"#,
        )
        .bind(series_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage_error)?;

        if series.is_none() {
            tx.rollback().await.map_err(storage_error)?;
            return Ok(false);
        }

        let result = sqlx::query(
            r#"
            UPDATE library_entries
            SET series_id = $2, metadata_status = 'enriched', metadata_error = NULL, updated_at = NOW()
            WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(entry_id)
        .bind(series_id)
        .execute(&mut *tx)
        .await
        .map_err(storage_error)?;

        tx.commit().await.map_err(storage_error)?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_entry_failed(&self, entry_id: Uuid, reason: &str) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            UPDATE library_entries
            SET metadata_status = 'failed', metadata_error = $2, updated_at = NOW()
            WHERE id = $1 AND deleted_at IS NULL AND metadata_status <> 'enriched'
            "#,
        )
        .bind(entry_id)
        .bind(reason)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(())
    }
}
