//! Application-wide error types.

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
///
/// Business-rule rejections (a second trial activation, an invalid referral)
/// are not errors: those operations return `Ok(false)` and mutate nothing.
#[derive(Error, Debug)]
pub enum Error {
    /// Every active credential is at capacity.
    #[error("Credential pool exhausted: no active credential has a free slot")]
    PoolExhausted,

    #[error("Persistence unavailable: {0}")]
    Persistence(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Whether the backing store failed (unreachable, locked, corrupt...).
    ///
    /// Callers fail closed on these: nothing was granted or mutated.
    pub fn is_persistence_failure(&self) -> bool {
        matches!(self, Self::Persistence(_) | Self::Migration(_))
    }

    /// SQLITE_BUSY (5) or SQLITE_LOCKED (6): another writer holds the file.
    /// Matched on the result code, or on the message when sqlx reports the
    /// condition outside a database error.
    pub fn is_lock_contention(&self) -> bool {
        let Self::Persistence(err) = self else {
            return false;
        };
        if let sqlx::Error::Database(db_err) = err {
            if matches!(db_err.code().as_deref(), Some("5" | "6")) {
                return true;
            }
        }
        let msg = err.to_string().to_ascii_lowercase();
        msg.contains("database is locked") || msg.contains("database is busy")
    }

    /// Whether this is the user-visible "try again later" condition.
    pub fn is_pool_exhausted(&self) -> bool {
        matches!(self, Self::PoolExhausted)
    }
}
