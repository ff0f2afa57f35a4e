//! Record store: `SQLite`-backed persistence for tracked files.
//!
//! Every operation is a single auto-committed statement, so concurrent
//! producer and consumer tasks never share a transaction across an `.await`.
//!
//! # Lifecycle
//!
//! ```text
//! insert ──► mark_downloaded ──► mark_published ──► clear_local_path
//!   (discovery)  (transfer engine)   (consumer)        (optional cleanup)
//! ```
//!
//! # Example
//!
//! ```no_run
//! use media_relay::{Database, RecordStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::new_in_memory().await?;
//! let store = RecordStore::new(db);
//! for record in store.list_pending("site", Some(10)).await? {
//!     println!("{record}");
//! }
//! # Ok(())
//! # }
//! ```

mod error;
mod record;

pub use error::{DbErrorKind, StoreError};
pub use record::{CollectionCounts, FileRecord, NewFileRecord, RecordMetadata};

use std::path::{Path, PathBuf};

use sqlx::Row;
use tracing::{debug, instrument};

use crate::db::Database;
use record::to_json_list;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Default ceiling on failed download attempts across runs.
pub const DEFAULT_MAX_RECORD_ATTEMPTS: u32 = 5;

/// UTC timestamp with millisecond precision, sortable as text.
const NOW: &str = "strftime('%Y-%m-%dT%H:%M:%fZ', 'now')";

/// Returns `Ok(())` if at least one row was affected; otherwise [`StoreError::RecordNotFound`].
fn check_affected(id: i64, rows_affected: u64) -> Result<()> {
    if rows_affected == 0 {
        Err(StoreError::RecordNotFound(id))
    } else {
        Ok(())
    }
}

fn sql_limit(limit: Option<u32>) -> i64 {
    limit.map_or(-1, i64::from)
}

/// Persistent table of tracked files.
#[derive(Debug, Clone)]
pub struct RecordStore {
    db: Database,
    max_attempts: u32,
}

impl RecordStore {
    /// Creates a store with the default attempt ceiling.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self {
            db,
            max_attempts: DEFAULT_MAX_RECORD_ATTEMPTS,
        }
    }

    /// Sets the cross-run failure ceiling; `0` disables it.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Returns the configured attempt ceiling.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Inserts a discovered record unless `(collection, page)` already exists.
    ///
    /// Returns the new id, or `None` for a duplicate.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if a query fails.
    #[instrument(skip(self, new), fields(page = %new.page))]
    pub async fn insert(&self, collection: &str, new: &NewFileRecord) -> Result<Option<i64>> {
        if self.exists(collection, &new.page).await? {
            debug!("record already tracked");
            return Ok(None);
        }

        let meta = &new.metadata;
        let size_hint = new.size_hint.and_then(|n| i64::try_from(n).ok());
        let result = sqlx::query(
            r"INSERT INTO files (
                source_collection,
                source_page,
                remote_url,
                remote_size_hint,
                title,
                categories,
                language,
                year,
                country,
                cast_members,
                description,
                thumbnail_url
              )
              VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
              RETURNING id",
        )
        .bind(collection)
        .bind(&new.page)
        .bind(new.url.as_deref())
        .bind(size_hint)
        .bind(meta.title.as_deref())
        .bind(to_json_list(&meta.categories))
        .bind(meta.language.as_deref())
        .bind(meta.year.as_deref())
        .bind(meta.country.as_deref())
        .bind(to_json_list(&meta.cast))
        .bind(meta.description.as_deref())
        .bind(meta.thumbnail_url.as_deref())
        .fetch_one(self.db.pool())
        .await;

        match result {
            Ok(row) => Ok(Some(row.get("id"))),
            // Lost a race with a concurrent insert of the same page.
            Err(e) => {
                let err = StoreError::from(e);
                if err.is_constraint_violation() {
                    Ok(None)
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Checks whether a page is already tracked in a collection.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn exists(&self, collection: &str, page: &str) -> Result<bool> {
        let row = sqlx::query(
            r"SELECT EXISTS(
                SELECT 1 FROM files WHERE source_collection = ? AND source_page = ?
              ) AS present",
        )
        .bind(collection)
        .bind(page)
        .fetch_one(self.db.pool())
        .await?;

        Ok(row.get::<i64, _>("present") != 0)
    }

    /// Gets a record by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn get(&self, id: i64) -> Result<Option<FileRecord>> {
        let record = sqlx::query_as::<_, FileRecord>(r"SELECT * FROM files WHERE id = ?")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;

        Ok(record)
    }

    /// Lists records that need a download: no local copy, a non-empty URL,
    /// and fewer failed attempts than the ceiling.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn list_pending(
        &self,
        collection: &str,
        limit: Option<u32>,
    ) -> Result<Vec<FileRecord>> {
        let records = sqlx::query_as::<_, FileRecord>(
            r"SELECT * FROM files
              WHERE source_collection = ?
                AND (local_path IS NULL OR local_path = '')
                AND remote_url IS NOT NULL AND TRIM(remote_url) != ''
                AND (? = 0 OR failed_attempts < ?)
              ORDER BY id ASC
              LIMIT ?",
        )
        .bind(collection)
        .bind(i64::from(self.max_attempts))
        .bind(i64::from(self.max_attempts))
        .bind(sql_limit(limit))
        .fetch_all(self.db.pool())
        .await?;

        Ok(records)
    }

    /// Lists records with a local copy that have not been published yet.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn list_downloaded_unpublished(
        &self,
        collection: &str,
        limit: Option<u32>,
    ) -> Result<Vec<FileRecord>> {
        let records = sqlx::query_as::<_, FileRecord>(
            r"SELECT * FROM files
              WHERE source_collection = ?
                AND published = 0
                AND local_path IS NOT NULL AND local_path != ''
              ORDER BY id ASC
              LIMIT ?",
        )
        .bind(collection)
        .bind(sql_limit(limit))
        .fetch_all(self.db.pool())
        .await?;

        Ok(records)
    }

    /// Lists every unpublished record the full pipeline should visit: pending
    /// downloads plus downloaded-but-unpublished files.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn list_unpublished(
        &self,
        collection: &str,
        limit: Option<u32>,
    ) -> Result<Vec<FileRecord>> {
        let records = sqlx::query_as::<_, FileRecord>(
            r"SELECT * FROM files
              WHERE source_collection = ?
                AND published = 0
                AND (
                    (local_path IS NOT NULL AND local_path != '')
                    OR (
                        remote_url IS NOT NULL AND TRIM(remote_url) != ''
                        AND (? = 0 OR failed_attempts < ?)
                    )
                )
              ORDER BY id ASC
              LIMIT ?",
        )
        .bind(collection)
        .bind(i64::from(self.max_attempts))
        .bind(i64::from(self.max_attempts))
        .bind(sql_limit(limit))
        .fetch_all(self.db.pool())
        .await?;

        Ok(records)
    }

    /// Local files of every unpublished record, across collections.
    ///
    /// These are downloads still owed to the channel; disk reclaim must not
    /// evict them.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    pub async fn unpublished_local_paths(&self) -> Result<Vec<PathBuf>> {
        let rows = sqlx::query(
            r"SELECT local_path FROM files
              WHERE published = 0 AND local_path IS NOT NULL AND local_path != ''",
        )
        .fetch_all(self.db.pool())
        .await?;

        Ok(rows
            .iter()
            .map(|row| PathBuf::from(row.get::<String, _>("local_path")))
            .collect())
    }

    /// Records a completed download and clears failure bookkeeping.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::RecordNotFound`] if no record has this id.
    #[instrument(skip(self, path), fields(path = %path.display()))]
    pub async fn mark_downloaded(&self, id: i64, path: &Path, size: u64) -> Result<()> {
        let size = i64::try_from(size).unwrap_or(i64::MAX);
        let result = sqlx::query(&format!(
            r"UPDATE files
              SET local_path = ?,
                  local_size = ?,
                  downloaded_at = {NOW},
                  failed_attempts = 0,
                  last_error = NULL,
                  updated_at = {NOW}
              WHERE id = ?"
        ))
        .bind(path.to_string_lossy().as_ref())
        .bind(size)
        .bind(id)
        .execute(self.db.pool())
        .await?;

        check_affected(id, result.rows_affected())
    }

    /// Marks a record published; `published_at` is only set on the first transition.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::RecordNotFound`] if no record has this id.
    #[instrument(skip(self))]
    pub async fn mark_published(&self, id: i64) -> Result<()> {
        let result = sqlx::query(&format!(
            r"UPDATE files
              SET published_at = CASE WHEN published = 0 THEN {NOW} ELSE published_at END,
                  published = 1,
                  updated_at = {NOW}
              WHERE id = ?"
        ))
        .bind(id)
        .execute(self.db.pool())
        .await?;

        check_affected(id, result.rows_affected())
    }

    /// Forgets the local copy (after deletion or when it vanished from disk).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::RecordNotFound`] if no record has this id.
    #[instrument(skip(self))]
    pub async fn clear_local_path(&self, id: i64) -> Result<()> {
        let result = sqlx::query(&format!(
            r"UPDATE files
              SET local_path = NULL, updated_at = {NOW}
              WHERE id = ?"
        ))
        .bind(id)
        .execute(self.db.pool())
        .await?;

        check_affected(id, result.rows_affected())
    }

    /// Stores a failure note and bumps the cross-run attempt counter.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::RecordNotFound`] if no record has this id.
    #[instrument(skip(self))]
    pub async fn record_failure(&self, id: i64, note: &str) -> Result<()> {
        let result = sqlx::query(&format!(
            r"UPDATE files
              SET failed_attempts = failed_attempts + 1,
                  last_error = ?,
                  updated_at = {NOW}
              WHERE id = ?"
        ))
        .bind(note)
        .bind(id)
        .execute(self.db.pool())
        .await?;

        check_affected(id, result.rows_affected())
    }

    /// Stores a failure note without touching the attempt counter.
    ///
    /// Used for publish failures, which are not download attempts.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::RecordNotFound`] if no record has this id.
    #[instrument(skip(self))]
    pub async fn note_error(&self, id: i64, note: &str) -> Result<()> {
        let result = sqlx::query(&format!(
            r"UPDATE files SET last_error = ?, updated_at = {NOW} WHERE id = ?"
        ))
        .bind(note)
        .bind(id)
        .execute(self.db.pool())
        .await?;

        check_affected(id, result.rows_affected())
    }

    /// Clears `published`/`published_at` for a collection (operator reset).
    ///
    /// # Returns
    ///
    /// The number of records reset.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn reset_published(&self, collection: &str) -> Result<u64> {
        let result = sqlx::query(&format!(
            r"UPDATE files
              SET published = 0, published_at = NULL, updated_at = {NOW}
              WHERE source_collection = ? AND published = 1"
        ))
        .bind(collection)
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected())
    }

    /// Zeroes failure counters for a collection so capped records are retried.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn reset_failures(&self, collection: &str) -> Result<u64> {
        let result = sqlx::query(&format!(
            r"UPDATE files
              SET failed_attempts = 0, last_error = NULL, updated_at = {NOW}
              WHERE source_collection = ? AND failed_attempts > 0"
        ))
        .bind(collection)
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected())
    }

    /// Status counts for one collection.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn counts(&self, collection: &str) -> Result<CollectionCounts> {
        let counts = sqlx::query_as::<_, CollectionCounts>(
            r"SELECT
                COUNT(*) AS total,
                COALESCE(SUM(CASE WHEN published = 0
                    AND (local_path IS NULL OR local_path = '')
                    AND remote_url IS NOT NULL AND TRIM(remote_url) != ''
                    AND (? = 0 OR failed_attempts < ?) THEN 1 ELSE 0 END), 0) AS pending_download,
                COALESCE(SUM(CASE WHEN published = 0
                    AND local_path IS NOT NULL AND local_path != '' THEN 1 ELSE 0 END), 0) AS awaiting_publish,
                COALESCE(SUM(CASE WHEN published = 1 THEN 1 ELSE 0 END), 0) AS published,
                COALESCE(SUM(CASE WHEN ? > 0 AND failed_attempts >= ? THEN 1 ELSE 0 END), 0) AS over_attempt_limit
              FROM files
              WHERE source_collection = ?",
        )
        .bind(i64::from(self.max_attempts))
        .bind(i64::from(self.max_attempts))
        .bind(i64::from(self.max_attempts))
        .bind(i64::from(self.max_attempts))
        .bind(collection)
        .fetch_one(self.db.pool())
        .await?;

        Ok(counts)
    }

    /// Distinct collection names, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn collections(&self) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r"SELECT DISTINCT source_collection FROM files ORDER BY source_collection ASC",
        )
        .fetch_all(self.db.pool())
        .await?;

        Ok(rows
            .iter()
            .map(|row| row.get::<String, _>("source_collection"))
            .collect())
    }
}
