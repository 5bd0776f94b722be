use std::collections::HashMap;
use std::time::Duration;

use mangashelf_core::error::AppError;
use mangashelf_core::models::{SeriesMetadata, SeriesType};
use mangashelf_core::scraper::{ScraperOutcome, SourceTransport};
use mangashelf_core::source::MANGADEX;
use reqwest::Client;
use reqwest::header::RETRY_AFTER;
use serde::Deserialize;
use url::Url;
use uuid::Uuid;

pub const DEFAULT_BASE_URL: &str = "https://api.mangadex.org";
const COVER_BASE_URL: &str = "https://uploads.mangadex.org/covers";

/// One-attempt transport for the MangaDex series API.
///
/// Retries, breaker gating and rate-limit waits live in
/// [`ScraperClient`](mangashelf_core::scraper::ScraperClient); this type only
/// turns a single HTTP exchange into a [`ScraperOutcome`].
#[derive(Clone)]
pub struct MangaDexTransport {
    client: Client,
    base_url: Url,
}

impl MangaDexTransport {
    pub fn new() -> Result<Self, AppError> {
        Self::with_config(DEFAULT_BASE_URL, Duration::from_secs(15))
    }

    pub fn with_config(base_url: &str, timeout: Duration) -> Result<Self, AppError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| AppError::ConfigError(format!("Invalid MangaDex URL '{base_url}': {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(AppError::ConfigError(format!(
                "MangaDex URL '{base_url}' cannot be used as a base"
            )));
        }

        let client = Client::builder()
            .user_agent(concat!("mangashelf/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::ConfigError(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self { client, base_url })
    }

    fn series_url(&self, external_id: &str) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push("manga").push(external_id);
        }
        url.query_pairs_mut().append_pair("includes[]", "cover_art");
        url
    }
}

impl SourceTransport for MangaDexTransport {
    fn source_name(&self) -> &str {
        MANGADEX
    }

    /// MangaDex ids are UUIDs; anything else is answered with a 400.
    fn validate_id(&self, external_id: &str) -> Result<(), String> {
        Uuid::parse_str(external_id)
            .map(|_| ())
            .map_err(|e| format!("'{external_id}' is not a MangaDex id: {e}"))
    }

    async fn fetch_series(&self, external_id: &str) -> ScraperOutcome {
        let url = self.series_url(external_id);
        let response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                return ScraperOutcome::NetworkFailure(format!("request timed out: {e}"));
            }
            Err(e) if e.is_connect() => {
                return ScraperOutcome::NetworkFailure(format!("connection failed: {e}"));
            }
            Err(e) => return ScraperOutcome::NetworkFailure(e.to_string()),
        };

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        if let Some(outcome) = outcome_for_status(status, retry_after) {
            return outcome;
        }

        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                return ScraperOutcome::NetworkFailure(format!("failed to read response body: {e}"));
            }
        };
        match serde_json::from_str(&body) {
            Ok(payload) => ScraperOutcome::Success(payload),
            Err(e) => {
                tracing::warn!(external_id, error = %e, "MangaDex returned a non-JSON body");
                ScraperOutcome::Success(serde_json::Value::Null)
            }
        }
    }

    fn parse_series(
        &self,
        external_id: &str,
        payload: &serde_json::Value,
    ) -> Result<SeriesMetadata, String> {
        parse_manga(external_id, payload)
    }
}

/// Classifies a non-2xx status. Returns `None` for success.
///
/// Only 5xx counts against the breaker; other statuses are about the request.
pub(crate) fn outcome_for_status(status: u16, retry_after: Option<u64>) -> Option<ScraperOutcome> {
    match status {
        200..=299 => None,
        404 => Some(ScraperOutcome::NotFound),
        429 => Some(ScraperOutcome::RateLimited(retry_after)),
        500..=599 => Some(ScraperOutcome::ServerFailure(status)),
        _ => Some(ScraperOutcome::ClientError(status)),
    }
}

/// Delta-seconds form of `Retry-After`. HTTP-date values fall back to the default wait.
pub(crate) fn parse_retry_after(value: &str) -> Option<u64> {
    value.trim().parse().ok()
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct MangaEnvelope {
    data: MangaData,
}

#[derive(Deserialize)]
struct MangaData {
    id: String,
    attributes: MangaAttributes,
    #[serde(default)]
    relationships: Vec<Relationship>,
}

#[derive(Deserialize)]
struct Relationship {
    #[serde(rename = "type")]
    rel_type: String,
    attributes: Option<serde_json::Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MangaAttributes {
    title: Localized,
    #[serde(default)]
    alt_titles: Vec<Localized>,
    #[serde(default)]
    description: Localized,
    original_language: Option<String>,
    status: Option<String>,
}

/// MangaDex serializes an empty localized map as `[]`.
#[derive(Deserialize)]
#[serde(untagged)]
enum Localized {
    Map(HashMap<String, String>),
    Empty(Vec<serde_json::Value>),
}

impl Default for Localized {
    fn default() -> Self {
        Localized::Empty(Vec::new())
    }
}

impl Localized {
    fn get(&self, lang: &str) -> Option<&str> {
        match self {
            Localized::Map(map) => map.get(lang).map(String::as_str).filter(|s| !s.is_empty()),
            Localized::Empty(_) => None,
        }
    }

    /// Values ordered by language code so the output is stable.
    fn values(&self) -> Vec<&str> {
        match self {
            Localized::Map(map) => {
                let mut entries: Vec<_> = map.iter().collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));
                entries
                    .into_iter()
                    .map(|(_, v)| v.as_str())
                    .filter(|v| !v.is_empty())
                    .collect()
            }
            Localized::Empty(_) => Vec::new(),
        }
    }
}

fn parse_manga(external_id: &str, payload: &serde_json::Value) -> Result<SeriesMetadata, String> {
    let envelope = MangaEnvelope::deserialize(payload)
        .map_err(|e| format!("unexpected MangaDex payload for {external_id}: {e}"))?;
    let manga = envelope.data;
    let attrs = &manga.attributes;
    let original = attrs.original_language.as_deref().unwrap_or_default();

    let title = ["en", "ja-ro", original]
        .into_iter()
        .find_map(|lang| attrs.title.get(lang))
        .or_else(|| attrs.title.values().into_iter().next())
        .ok_or_else(|| format!("MangaDex series {} has no title", manga.id))?
        .to_string();

    let mut alt_titles: Vec<String> = Vec::new();
    let candidates = attrs
        .title
        .values()
        .into_iter()
        .chain(attrs.alt_titles.iter().flat_map(Localized::values));
    for candidate in candidates {
        if candidate != title && !alt_titles.iter().any(|t| t == candidate) {
            alt_titles.push(candidate.to_string());
        }
    }

    let cover_url = manga
        .relationships
        .iter()
        .find(|r| r.rel_type == "cover_art")
        .and_then(|r| r.attributes.as_ref())
        .and_then(|a| a.get("fileName"))
        .and_then(|f| f.as_str())
        .map(|file| format!("{COVER_BASE_URL}/{}/{file}", manga.id));

    Ok(SeriesMetadata {
        external_id: manga.id.clone(),
        title,
        alt_titles,
        series_type: series_type_for_language(original),
        status: attrs.status.clone(),
        description: attrs.description.get("en").map(str::to_string),
        cover_url,
    })
}

fn series_type_for_language(lang: &str) -> Option<SeriesType> {
    match lang {
        "ja" => Some(SeriesType::Manga),
        "ko" => Some(SeriesType::Manhwa),
        "zh" | "zh-hk" => Some(SeriesType::Manhua),
        _ => None,
    }
}
