//! Record store failures.

use std::fmt;

use thiserror::Error;

/// Coarse class of a database failure, recorded alongside its message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbErrorKind {
    /// Another connection holds the write lock past the busy timeout.
    Busy,
    /// A UNIQUE or CHECK constraint rejected the statement.
    Constraint,
    /// No pooled connection could be obtained.
    Unavailable,
    Other,
}

impl DbErrorKind {
    #[must_use]
    pub fn of(error: &sqlx::Error) -> Self {
        match error {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => Self::Unavailable,
            sqlx::Error::Database(db) => {
                let code = db.code().unwrap_or_default();
                if db.is_unique_violation()
                    || db.is_check_violation()
                    || code.starts_with("SQLITE_CONSTRAINT")
                {
                    Self::Constraint
                } else if matches!(&*code, "5" | "6" | "SQLITE_BUSY" | "SQLITE_LOCKED")
                    || db.message().contains("database is locked")
                {
                    Self::Busy
                } else {
                    Self::Other
                }
            }
            _ => Self::Other,
        }
    }
}

impl fmt::Display for DbErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Busy => "busy",
            Self::Constraint => "constraint",
            Self::Unavailable => "unavailable",
            Self::Other => "other",
        })
    }
}

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("database error ({kind}): {message}")]
    Database { kind: DbErrorKind, message: String },

    #[error("file record not found: id {0}")]
    RecordNotFound(i64),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database {
            kind: DbErrorKind::of(&err),
            message: err.to_string(),
        }
    }
}

impl StoreError {
    /// True when a constraint rejected the write, e.g. a duplicate page.
    #[must_use]
    pub fn is_constraint_violation(&self) -> bool {
        matches!(
            self,
            Self::Database {
                kind: DbErrorKind::Constraint,
                ..
            }
        )
    }
}
