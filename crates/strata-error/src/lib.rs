//! Primary error type for StrataKV operations.
//!
//! One structured enum covers the whole workspace: storage failures from the
//! embedded SQL engine, structural corruption found while loading extension
//! state, registration problems, and the programmer-error class surfaced by
//! mutation-during-iteration. Nothing here is auto-retried; a storage error
//! aborts the transaction that hit it and the caller decides what happens
//! next.

use thiserror::Error;

/// Error type shared by the base store and every extension crate.
#[derive(Error, Debug)]
pub enum StrataError {
    // === Storage ===
    /// Underlying SQL engine failure. Aborts the current transaction.
    #[error("storage error: {0}")]
    Sql(#[from] rusqlite::Error),

    /// A persisted blob failed to decode.
    #[error("corrupt record: {detail}")]
    Corrupt { detail: String },

    /// A view's page chain is unusable: a cycle, a missing link or a count
    /// mismatch was found while rebuilding the group index from disk.
    #[error("invalid page chain in group '{group}': {detail}")]
    InvalidPageChain { group: String, detail: String },

    // === Registration ===
    /// No extension with this name has been registered on the database.
    #[error("extension is not registered: '{name}'")]
    NotRegistered { name: String },

    /// An extension with this name is already live under a different version.
    #[error("version mismatch for '{name}': registered {registered}, requested {requested}")]
    VersionMismatch {
        name: String,
        registered: i64,
        requested: i64,
    },

    // === Programmer errors ===
    /// A group was mutated while an enumeration over it was in progress and
    /// the caller did not stop the enumeration.
    #[error("group '{group}' was mutated during iteration")]
    MutationDuringIteration { group: String },

    // === Internal ===
    /// Internal logic error (should never happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl StrataError {
    /// Create a corruption error.
    pub fn corrupt(detail: impl Into<String>) -> Self {
        Self::Corrupt {
            detail: detail.into(),
        }
    }

    /// Create an invalid-page-chain error.
    pub fn invalid_chain(group: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::InvalidPageChain {
            group: group.into(),
            detail: detail.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether this error indicates persistent on-disk damage, as opposed to
    /// a transient or caller-fixable condition.
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(self, Self::Corrupt { .. } | Self::InvalidPageChain { .. })
    }

    /// Whether the caller can fix this without touching stored data.
    #[must_use]
    pub const fn is_programmer_error(&self) -> bool {
        matches!(
            self,
            Self::MutationDuringIteration { .. }
                | Self::NotRegistered { .. }
                | Self::VersionMismatch { .. }
        )
    }
}

/// Result type alias using [`StrataError`].
pub type Result<T> = std::result::Result<T, StrataError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_corrupt() {
        let err = StrataError::corrupt("page body is not a row list");
        assert_eq!(err.to_string(), "corrupt record: page body is not a row list");
    }

    #[test]
    fn test_display_invalid_chain() {
        let err = StrataError::invalid_chain("fiction", "cycle at page p3");
        assert_eq!(
            err.to_string(),
            "invalid page chain in group 'fiction': cycle at page p3"
        );
    }

    #[test]
    fn test_display_version_mismatch() {
        let err = StrataError::VersionMismatch {
            name: "by-author".to_owned(),
            registered: 2,
            requested: 3,
        };
        assert_eq!(
            err.to_string(),
            "version mismatch for 'by-author': registered 2, requested 3"
        );
    }

    #[test]
    fn test_corruption_predicate() {
        assert!(StrataError::corrupt("x").is_corruption());
        assert!(StrataError::invalid_chain("g", "x").is_corruption());
        assert!(!StrataError::internal("x").is_corruption());
    }

    #[test]
    fn test_programmer_error_predicate() {
        let err = StrataError::MutationDuringIteration {
            group: "g".to_owned(),
        };
        assert!(err.is_programmer_error());
        assert!(StrataError::NotRegistered {
            name: "v".to_owned()
        }
        .is_programmer_error());
        assert!(!StrataError::corrupt("x").is_programmer_error());
    }

    #[test]
    fn test_sql_error_from() {
        let err: StrataError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(err, StrataError::Sql(_)));
        assert!(err.to_string().starts_with("storage error:"));
    }
}
