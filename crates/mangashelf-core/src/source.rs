use url::Url;

/// Source name of MangaDex entries.
pub const MANGADEX: &str = "mangadex";

/// Extracts the source's own identifier for a series from an entry URL.
///
/// MangaDex URLs look like `https://mangadex.org/title/<id>/<slug>`; for
/// other sources the last non-empty path segment is used.
pub fn external_id_from_url(source_name: &str, source_url: &str) -> Option<String> {
    let url = Url::parse(source_url).ok()?;
    let segments: Vec<&str> = url
        .path_segments()?
        .filter(|s| !s.is_empty())
        .collect();

    if source_name.eq_ignore_ascii_case(MANGADEX) {
        let pos = segments.iter().position(|s| *s == "title")?;
        return segments.get(pos + 1).map(|s| s.to_string());
    }

    segments.last().map(|s| s.to_string())
}
