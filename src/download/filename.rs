//! Destination path planning for downloaded media.
//!
//! Paths have the shape `<download_dir>/<collection>/<title>_<id><ext>`.
//! The record id makes every path unique, so concurrent producers never
//! write to the same file.

use std::path::{Path, PathBuf};

use url::Url;

/// Extension used when the URL path carries none.
pub const DEFAULT_EXTENSION: &str = ".mp4";

/// Titles are cut to this many characters before the id suffix.
const MAX_TITLE_CHARS: usize = 80;

/// Plans the local destination for a record.
///
/// ```
/// use std::path::Path;
/// use media_relay::download::plan_path;
///
/// let path = plan_path(
///     Path::new("/srv/media"),
///     "site",
///     "Night of the Comet",
///     7,
///     "https://cdn.example.com/v/abc.MKV?token=1",
/// );
/// assert_eq!(path, Path::new("/srv/media/site/Night_of_the_Comet_7.mkv"));
/// ```
#[must_use]
pub fn plan_path(
    download_dir: &Path,
    collection: &str,
    title: &str,
    id: i64,
    url: &str,
) -> PathBuf {
    let folder = Some(sanitize_filename_component(collection))
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| "default".to_string());

    let stem: String = sanitize_filename_component(title)
        .chars()
        .take(MAX_TITLE_CHARS)
        .collect();
    let stem = stem.trim_end_matches(['_', '.']);
    let stem = if stem.is_empty() { "file" } else { stem };

    let extension = extension_from_url(url).unwrap_or_else(|| DEFAULT_EXTENSION.to_string());

    download_dir
        .join(folder)
        .join(format!("{stem}_{id}{extension}"))
}

/// Lowercase extension (with dot) of the URL's last path segment.
pub(crate) fn extension_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let last_segment = parsed.path_segments()?.next_back()?;
    let decoded = urlencoding::decode(last_segment).ok()?;
    let dot_index = decoded.rfind('.')?;
    let ext = &decoded[dot_index + 1..];
    if ext.is_empty() || ext.len() > 5 || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(format!(".{}", ext.to_ascii_lowercase()))
}

/// Replaces path separators, reserved characters and whitespace with `_`,
/// collapsing runs and trimming leading/trailing separators.
#[must_use]
pub fn sanitize_filename_component(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut prev_sep = false;
    for ch in value.chars() {
        let mapped = match ch {
            c if c.is_alphanumeric() || matches!(c, '-' | '.') => c,
            _ => '_',
        };
        if mapped == '_' {
            if !prev_sep {
                out.push('_');
                prev_sep = true;
            }
        } else {
            out.push(mapped);
            prev_sep = false;
        }
    }
    out.trim_matches(['_', '.']).to_string()
}
