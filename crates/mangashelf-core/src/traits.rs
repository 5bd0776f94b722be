use std::future::Future;

use uuid::Uuid;

use crate::error::{ScrapeError, StorageError};
use crate::models::{LibraryEntry, NewSeries, Series, SeriesMetadata};

/// Result of an insert against the normalized-title uniqueness constraint.
#[derive(Debug, Clone)]
pub enum SeriesInsert {
    Created(Series),
    /// Another writer already holds this normalized title.
    Conflict,
}

/// Storage collaborator consumed by the resolution service.
///
/// Default reads exclude soft-deleted records. Implementations must enforce
/// uniqueness of `normalized_title` among live series.
pub trait ResolutionStore: Send + Sync + Clone {
    fn get_entry(
        &self,
        entry_id: Uuid,
    ) -> impl Future<Output = Result<Option<LibraryEntry>, StorageError>> + Send;

    fn get_series(
        &self,
        series_id: Uuid,
    ) -> impl Future<Output = Result<Option<Series>, StorageError>> + Send;

    fn find_series_by_normalized_title(
        &self,
        normalized_title: &str,
    ) -> impl Future<Output = Result<Option<Series>, StorageError>> + Send;

    /// Inserts a series, reporting a uniqueness conflict as [`SeriesInsert::Conflict`]
    /// rather than as an error.
    fn insert_series(
        &self,
        series: &NewSeries,
    ) -> impl Future<Output = Result<SeriesInsert, StorageError>> + Send;

    /// Sets `series_id` and `metadata_status = enriched` together, in one
    /// transaction. Returns false if the entry or the series is gone.
    fn link_entry(
        &self,
        entry_id: Uuid,
        series_id: Uuid,
    ) -> impl Future<Output = Result<bool, StorageError>> + Send;

    /// Marks a pending or failed entry as `failed`. Never downgrades an enriched entry.
    fn mark_entry_failed(
        &self,
        entry_id: Uuid,
        reason: &str,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;
}

/// Looks up series metadata on an external source.
pub trait MetadataLookup: Send + Sync + Clone {
    /// Whether this lookup knows how to talk to `source_name`.
    fn handles(&self, source_name: &str) -> bool;

    fn lookup(
        &self,
        external_id: &str,
    ) -> impl Future<Output = Result<SeriesMetadata, ScrapeError>> + Send;
}

/// A lookup that handles no source, for resolving purely by imported title.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLookup;

impl MetadataLookup for NoLookup {
    fn handles(&self, _source_name: &str) -> bool {
        false
    }

    async fn lookup(&self, external_id: &str) -> Result<SeriesMetadata, ScrapeError> {
        Err(ScrapeError::NotFound {
            source_name: "none".to_string(),
            external_id: external_id.to_string(),
        })
    }
}
