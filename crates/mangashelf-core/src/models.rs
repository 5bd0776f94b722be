use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Enrichment status of a library entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetadataStatus {
    Pending,
    Enriched,
    Failed,
}

impl MetadataStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetadataStatus::Pending => "pending",
            MetadataStatus::Enriched => "enriched",
            MetadataStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for MetadataStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for MetadataStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(MetadataStatus::Pending),
            "enriched" => Ok(MetadataStatus::Enriched),
            "failed" => Ok(MetadataStatus::Failed),
            _ => Err(format!("Unknown metadata status: {}", s)),
        }
    }
}

/// Publication format of a series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeriesType {
    Manga,
    Manhwa,
    Manhua,
    Novel,
}

impl SeriesType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SeriesType::Manga => "manga",
            SeriesType::Manhwa => "manhwa",
            SeriesType::Manhua => "manhua",
            SeriesType::Novel => "novel",
        }
    }
}

impl fmt::Display for SeriesType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SeriesType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "manga" => Ok(SeriesType::Manga),
            "manhwa" => Ok(SeriesType::Manhwa),
            "manhua" => Ok(SeriesType::Manhua),
            "novel" => Ok(SeriesType::Novel),
            _ => Err(format!("Unknown series type: {}", s)),
        }
    }
}

/// A user's imported reference to a series on an external source.
#[derive(Debug, Clone, Serialize)]
pub struct LibraryEntry {
    pub id: Uuid,
    pub imported_title: String,
    pub source_name: String,
    pub source_url: String,
    pub series_id: Option<Uuid>,
    pub metadata_status: MetadataStatus,
    /// Last resolution error, kept for inspection of `failed` entries.
    pub metadata_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LibraryEntry {
    /// True when the entry already carries a committed link.
    pub fn is_linked(&self) -> bool {
        self.metadata_status == MetadataStatus::Enriched && self.series_id.is_some()
    }
}

/// DTO for importing a library entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewLibraryEntry {
    pub imported_title: String,
    pub source_name: String,
    pub source_url: String,
}

/// Canonical series record.
#[derive(Debug, Clone, Serialize)]
pub struct Series {
    pub id: Uuid,
    pub title: String,
    /// Unique among non-deleted series, see [`normalize_title`].
    pub normalized_title: String,
    pub series_type: Option<SeriesType>,
    pub status: Option<String>,
    pub description: Option<String>,
    pub cover_url: Option<String>,
    pub alt_titles: Vec<String>,
    pub external_source: Option<String>,
    pub external_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// DTO for inserting a new series.
#[derive(Debug, Clone, Serialize)]
pub struct NewSeries {
    pub title: String,
    pub normalized_title: String,
    pub series_type: Option<SeriesType>,
    pub status: Option<String>,
    pub description: Option<String>,
    pub cover_url: Option<String>,
    pub alt_titles: Vec<String>,
    pub external_source: Option<String>,
    pub external_id: Option<String>,
}

impl NewSeries {
    /// A series known only by the title the user imported.
    pub fn from_title(title: &str) -> Self {
        Self {
            title: title.trim().to_string(),
            normalized_title: normalize_title(title),
            series_type: None,
            status: None,
            description: None,
            cover_url: None,
            alt_titles: Vec::new(),
            external_source: None,
            external_id: None,
        }
    }

    /// Fills the descriptive fields from scraped metadata, keeping the title key.
    pub fn with_metadata(mut self, source_name: &str, metadata: SeriesMetadata) -> Self {
        self.series_type = metadata.series_type;
        self.status = metadata.status;
        self.description = metadata.description;
        self.cover_url = metadata.cover_url;
        self.alt_titles = metadata.alt_titles;
        if metadata.title != self.title {
            self.alt_titles.push(metadata.title);
        }
        self.external_source = Some(source_name.to_string());
        self.external_id = Some(metadata.external_id);
        self
    }
}

/// Series metadata scraped from an external source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesMetadata {
    pub external_id: String,
    pub title: String,
    pub alt_titles: Vec<String>,
    pub series_type: Option<SeriesType>,
    pub status: Option<String>,
    pub description: Option<String>,
    pub cover_url: Option<String>,
}

/// Folds a title into the key used for series identity.
///
/// Lowercases, turns every non-alphanumeric character into a separator and
/// collapses runs of separators into a single space. "One-Punch Man!" and
/// "one punch  man" share the key `one punch man`.
pub fn normalize_title(title: &str) -> String {
    let folded: String = title
        .chars()
        .flat_map(char::to_lowercase)
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}
