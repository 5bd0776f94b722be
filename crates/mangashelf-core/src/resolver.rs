//! Resolves a library entry to its canonical series.
//!
//! The find-or-create is not a read-then-write: an insert that loses the race
//! on the normalized-title uniqueness constraint re-reads and links to the
//! winning row. Linking commits `series_id` and `enriched` together, so an
//! abandoned run leaves the entry `pending` or `failed`, never half-linked.

use std::time::Duration;

use uuid::Uuid;

use crate::error::{AppError, ScrapeErrorKind};
use crate::models::{LibraryEntry, NewSeries, Series, SeriesMetadata, normalize_title};
use crate::source::external_id_from_url;
use crate::traits::{MetadataLookup, ResolutionStore, SeriesInsert};

/// How an entry ended up linked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionAction {
    /// The entry was already enriched; nothing was written.
    AlreadyLinked,
    /// Linked to a series that already existed.
    LinkedExisting,
    /// Created a new series and linked to it.
    CreatedSeries,
    /// Lost the create race and linked to the concurrent winner.
    LinkedAfterConflict,
}

impl std::fmt::Display for ResolutionAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolutionAction::AlreadyLinked => write!(f, "already-linked"),
            ResolutionAction::LinkedExisting => write!(f, "linked-existing"),
            ResolutionAction::CreatedSeries => write!(f, "created-series"),
            ResolutionAction::LinkedAfterConflict => write!(f, "linked-after-conflict"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub entry_id: Uuid,
    pub series_id: Uuid,
    pub action: ResolutionAction,
}

/// Local retry policy for transient storage failures.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Total runs of the resolution steps per call, including the first.
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_millis(200),
        }
    }
}

impl ResolverConfig {
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }
}

/// Links library entries to series. Safe to run concurrently for any entries.
#[derive(Clone)]
pub struct ResolutionService<S, L>
where
    S: ResolutionStore,
    L: MetadataLookup,
{
    store: S,
    lookup: L,
    config: ResolverConfig,
}

impl<S, L> ResolutionService<S, L>
where
    S: ResolutionStore,
    L: MetadataLookup,
{
    pub fn new(store: S, lookup: L, config: ResolverConfig) -> Self {
        Self {
            store,
            lookup,
            config,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Resolve one entry, re-running the steps on transient storage failures.
    pub async fn resolve(&self, entry_id: Uuid) -> Result<Resolution, AppError> {
        let mut attempt = 1;
        loop {
            match self.resolve_once(entry_id).await {
                Err(e) if e.is_transient_storage() && attempt < self.config.max_attempts => {
                    let delay = self.config.backoff_base.saturating_mul(1 << (attempt - 1).min(10));
                    tracing::warn!(
                        %entry_id,
                        attempt,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Transient storage failure, retrying resolution"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Record a terminal failure on the entry. An enriched entry is left untouched.
    pub async fn mark_failed(&self, entry_id: Uuid, reason: &str) -> Result<(), AppError> {
        self.store.mark_entry_failed(entry_id, reason).await?;
        tracing::warn!(%entry_id, %reason, "Library entry marked failed");
        Ok(())
    }

    async fn resolve_once(&self, entry_id: Uuid) -> Result<Resolution, AppError> {
        let entry = self
            .store
            .get_entry(entry_id)
            .await?
            .ok_or(AppError::EntryNotFound(entry_id))?;

        if entry.is_linked()
            && let Some(series_id) = entry.series_id
        {
            if self.store.get_series(series_id).await?.is_some() {
                tracing::debug!(%entry_id, %series_id, "Entry already linked");
                return Ok(Resolution {
                    entry_id,
                    series_id,
                    action: ResolutionAction::AlreadyLinked,
                });
            }
            tracing::info!(%entry_id, %series_id, "Linked series was deleted, resolving again");
        }

        let normalized = normalize_title(&entry.imported_title);
        if normalized.is_empty() {
            return Err(AppError::InvalidEntry {
                entry_id,
                reason: format!("title '{}' normalizes to nothing", entry.imported_title),
            });
        }

        if let Some(series) = self.store.find_series_by_normalized_title(&normalized).await? {
            return self
                .link(&entry, &series, ResolutionAction::LinkedExisting)
                .await;
        }

        let mut new_series = NewSeries::from_title(&entry.imported_title);
        if let Some(metadata) = self.fetch_metadata(&entry).await? {
            new_series = new_series.with_metadata(&entry.source_name, metadata);
        }

        match self.store.insert_series(&new_series).await? {
            SeriesInsert::Created(series) => {
                tracing::info!(
                    series_id = %series.id,
                    title = %series.title,
                    "Created series"
                );
                self.link(&entry, &series, ResolutionAction::CreatedSeries)
                    .await
            }
            SeriesInsert::Conflict => {
                tracing::info!(
                    %entry_id,
                    normalized_title = %normalized,
                    "Series created concurrently, linking to existing row"
                );
                let winner = self
                    .store
                    .find_series_by_normalized_title(&normalized)
                    .await?
                    .ok_or_else(|| AppError::SeriesConflict {
                        normalized_title: normalized.clone(),
                    })?;
                self.link(&entry, &winner, ResolutionAction::LinkedAfterConflict)
                    .await
            }
        }
    }

    /// Scrapes the entry's source when a scraper handles it.
    ///
    /// Not-found is not fatal: the series is created from the imported title.
    async fn fetch_metadata(&self, entry: &LibraryEntry) -> Result<Option<SeriesMetadata>, AppError> {
        if !self.lookup.handles(&entry.source_name) {
            return Ok(None);
        }
        let Some(external_id) = external_id_from_url(&entry.source_name, &entry.source_url) else {
            tracing::debug!(entry_id = %entry.id, url = %entry.source_url, "No external id in source URL");
            return Ok(None);
        };

        match self.lookup.lookup(&external_id).await {
            Ok(metadata) => Ok(Some(metadata)),
            Err(e) if e.kind() == ScrapeErrorKind::NotFound => {
                tracing::info!(entry_id = %entry.id, %external_id, "Series not found on source");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn link(
        &self,
        entry: &LibraryEntry,
        series: &Series,
        action: ResolutionAction,
    ) -> Result<Resolution, AppError> {
        if !self.store.link_entry(entry.id, series.id).await? {
            if self.store.get_entry(entry.id).await?.is_none() {
                return Err(AppError::EntryNotFound(entry.id));
            }
            tracing::info!(entry_id = %entry.id, series_id = %series.id, "Series deleted before link");
            return Err(AppError::SeriesDeleted {
                entry_id: entry.id,
                series_id: series.id,
            });
        }
        tracing::info!(entry_id = %entry.id, series_id = %series.id, %action, "Entry enriched");
        Ok(Resolution {
            entry_id: entry.id,
            series_id: series.id,
            action,
        })
    }
}
