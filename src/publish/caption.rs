//! Caption formatting.

use std::sync::LazyLock;

use regex::Regex;

use crate::config::DEFAULT_CAPTION_LIMIT;
use crate::store::FileRecord;

/// Characters that cannot appear inside a hashtag.
#[allow(clippy::expect_used)]
static HASHTAG_STRIP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[^\p{L}\p{N}_]+").expect("hashtag regex is valid") // Static pattern, safe to panic
});

const ELLIPSIS: char = '…';

/// Builds the text shown under a published file.
pub trait CaptionFormatter: Send + Sync {
    /// Caption for `record`.
    fn caption(&self, record: &FileRecord) -> String;
}

/// Plain-text caption: title, a facts line, cast, description and hashtags.
#[derive(Debug, Clone, Copy)]
pub struct DefaultCaption {
    limit: usize,
}

impl Default for DefaultCaption {
    fn default() -> Self {
        Self::new(DEFAULT_CAPTION_LIMIT)
    }
}

impl DefaultCaption {
    /// Formatter truncating to `limit` characters.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self { limit: limit.max(1) }
    }
}

impl CaptionFormatter for DefaultCaption {
    fn caption(&self, record: &FileRecord) -> String {
        let meta = record.metadata();
        let mut blocks = vec![record.display_title().to_string()];

        let facts: Vec<&str> = [&meta.year, &meta.country, &meta.language]
            .into_iter()
            .filter_map(|v| v.as_deref().map(str::trim).filter(|s| !s.is_empty()))
            .collect();
        if !facts.is_empty() {
            blocks.push(facts.join(" | "));
        }

        if !meta.cast.is_empty() {
            blocks.push(format!("Cast: {}", meta.cast.join(", ")));
        }

        if let Some(description) = meta.description.as_deref().map(str::trim)
            && !description.is_empty()
        {
            blocks.push(description.to_string());
        }

        let tags: Vec<String> = meta.categories.iter().filter_map(|c| hashtag(c)).collect();
        if !tags.is_empty() {
            blocks.push(tags.join(" "));
        }

        truncate_chars(&blocks.join("\n\n"), self.limit)
    }
}

fn hashtag(category: &str) -> Option<String> {
    let body = HASHTAG_STRIP.replace_all(category.trim(), "_");
    let body = body.trim_matches('_');
    (!body.is_empty()).then(|| format!("#{body}"))
}

/// Cuts `text` to at most `limit` characters, ending with an ellipsis when cut.
fn truncate_chars(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let mut out: String = text.chars().take(limit.saturating_sub(1)).collect();
    out.truncate(out.trim_end().len());
    out.push(ELLIPSIS);
    out
}
