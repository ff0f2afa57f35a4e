//! File record types shared by the store and the pipeline.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Descriptive metadata scraped alongside a remote file.
///
/// Opaque to the pipeline; only the caption formatter reads it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMetadata {
    /// Display title.
    #[serde(default)]
    pub title: Option<String>,
    /// Category labels, turned into hashtags by the default caption.
    #[serde(default)]
    pub categories: Vec<String>,
    /// Spoken language.
    #[serde(default)]
    pub language: Option<String>,
    /// Release year as scraped.
    #[serde(default)]
    pub year: Option<String>,
    /// Production country.
    #[serde(default)]
    pub country: Option<String>,
    /// Cast member names.
    #[serde(default)]
    pub cast: Vec<String>,
    /// Free-form description.
    #[serde(default)]
    pub description: Option<String>,
    /// Thumbnail image URL.
    #[serde(default)]
    pub thumbnail_url: Option<String>,
}

/// A newly discovered remote artifact, as produced by a scraper.
///
/// Deserialized from one JSON line by the `add` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewFileRecord {
    /// Listing page the file was discovered on (unique per collection).
    pub page: String,
    /// Direct media URL, absent when the page had no downloadable link.
    #[serde(default)]
    pub url: Option<String>,
    /// Advisory size in bytes.
    #[serde(default)]
    pub size_hint: Option<u64>,
    /// Pass-through metadata.
    #[serde(flatten)]
    pub metadata: RecordMetadata,
}

/// One tracked remote file and its download/publish state.
#[derive(Debug, Clone, FromRow)]
pub struct FileRecord {
    /// Stable identifier assigned at creation.
    pub id: i64,
    /// Grouping key, usually the source site name.
    pub source_collection: String,
    /// Listing page, unique within the collection.
    pub source_page: String,
    /// Direct media URL; `None` means not downloadable.
    pub remote_url: Option<String>,
    /// Advisory size in bytes.
    pub remote_size_hint: Option<i64>,
    /// Local copy, `None` when nothing is on disk.
    pub local_path: Option<String>,
    /// Size of the local copy, authoritative once set.
    pub local_size: i64,
    /// Whether the file has been published to the channel.
    pub published: bool,
    /// When `published` flipped to true.
    pub published_at: Option<String>,
    /// When the last successful download completed.
    pub downloaded_at: Option<String>,
    /// Display title.
    pub title: Option<String>,
    /// Categories as a JSON array.
    pub categories: Option<String>,
    /// Spoken language.
    pub language: Option<String>,
    /// Release year.
    pub year: Option<String>,
    /// Production country.
    pub country: Option<String>,
    /// Cast as a JSON array.
    pub cast_members: Option<String>,
    /// Free-form description.
    pub description: Option<String>,
    /// Thumbnail image URL.
    pub thumbnail_url: Option<String>,
    /// Failed download attempts across runs.
    pub failed_attempts: i64,
    /// Last failure note.
    pub last_error: Option<String>,
    /// When the record was discovered.
    pub created_at: String,
    /// When the record last changed.
    pub updated_at: String,
}

impl FileRecord {
    /// Title for display and file naming, falling back to the source page.
    #[must_use]
    pub fn display_title(&self) -> &str {
        self.title
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(&self.source_page)
    }

    /// Returns the remote URL if it is present and non-blank.
    #[must_use]
    pub fn remote_url(&self) -> Option<&str> {
        self.remote_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
    }

    /// Advisory remote size, ignoring non-positive values.
    #[must_use]
    pub fn size_hint(&self) -> Option<u64> {
        self.remote_size_hint
            .and_then(|n| u64::try_from(n).ok())
            .filter(|n| *n > 0)
    }

    /// Local path as a `PathBuf`, if set.
    #[must_use]
    pub fn local_path_buf(&self) -> Option<PathBuf> {
        self.local_path
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
    }

    /// Parsed pass-through metadata.
    #[must_use]
    pub fn metadata(&self) -> RecordMetadata {
        RecordMetadata {
            title: self.title.clone(),
            categories: parse_json_list(self.categories.as_deref()),
            language: self.language.clone(),
            year: self.year.clone(),
            country: self.country.clone(),
            cast: parse_json_list(self.cast_members.as_deref()),
            description: self.description.clone(),
            thumbnail_url: self.thumbnail_url.clone(),
        }
    }
}

impl fmt::Display for FileRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FileRecord {{ id: {}, collection: {}, page: {}, published: {} }}",
            self.id, self.source_collection, self.source_page, self.published
        )
    }
}

/// Per-collection status counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromRow)]
pub struct CollectionCounts {
    /// All records.
    pub total: i64,
    /// Downloadable records with no local copy.
    pub pending_download: i64,
    /// Local copy present, not yet published.
    pub awaiting_publish: i64,
    /// Published records.
    pub published: i64,
    /// Records excluded by the attempt ceiling.
    pub over_attempt_limit: i64,
}

/// Serializes a list to a JSON array, `None` when empty.
pub(crate) fn to_json_list(values: &[String]) -> Option<String> {
    if values.is_empty() {
        return None;
    }
    serde_json::to_string(values).ok()
}

fn parse_json_list(raw: Option<&str>) -> Vec<String> {
    raw.and_then(|json| serde_json::from_str(json).ok())
        .unwrap_or_default()
}
