//! Row-change operations and the payload delivered to handlers.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TriggerError;

/// The kind of row change reported by change tracking.
///
/// Corresponds to the `SYS_CHANGE_OPERATION` column of a
/// `CHANGETABLE(CHANGES ...)` result: `I`, `U`, or `D`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SqlChangeOperation {
    /// A new row was inserted.
    Insert,
    /// An existing row was updated.
    Update,
    /// A row was deleted.
    Delete,
}

impl SqlChangeOperation {
    /// Parse the single-character catalog representation.
    pub fn from_code(code: &str) -> Result<Self, TriggerError> {
        match code.trim() {
            "I" => Ok(Self::Insert),
            "U" => Ok(Self::Update),
            "D" => Ok(Self::Delete),
            other => Err(TriggerError::UnknownOperation(other.to_string())),
        }
    }

    /// The single-character catalog representation.
    pub const fn as_code(&self) -> &'static str {
        match self {
            Self::Insert => "I",
            Self::Update => "U",
            Self::Delete => "D",
        }
    }

    /// Whether this change removed the row. Deletes carry a primary-key-only
    /// payload because the user-table row no longer exists.
    pub const fn is_delete(&self) -> bool {
        matches!(self, Self::Delete)
    }
}

impl fmt::Display for SqlChangeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Insert => write!(f, "INSERT"),
            Self::Update => write!(f, "UPDATE"),
            Self::Delete => write!(f, "DELETE"),
        }
    }
}

/// One change delivered to a handler: the operation plus the decoded row.
///
/// For `Delete` the item is decoded from primary-key columns only; for
/// `Insert` and `Update` it carries the full user-table row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlChange<T> {
    pub operation: SqlChangeOperation,
    pub item: T,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_code_round_trip() {
        for code in ["I", "U", "D"] {
            let op = SqlChangeOperation::from_code(code).unwrap();
            assert_eq!(op.as_code(), code);
        }
    }

    #[test]
    fn test_from_code_trims_padding() {
        // CHANGETABLE reports the operation as nchar(1); trailing padding
        // must not break decoding.
        assert_eq!(
            SqlChangeOperation::from_code("I ").unwrap(),
            SqlChangeOperation::Insert
        );
    }

    #[test]
    fn test_from_code_rejects_unknown() {
        let err = SqlChangeOperation::from_code("Q").unwrap_err();
        assert!(matches!(err, TriggerError::UnknownOperation(code) if code == "Q"));
    }

    #[test]
    fn test_only_delete_is_delete() {
        assert!(SqlChangeOperation::Delete.is_delete());
        assert!(!SqlChangeOperation::Insert.is_delete());
        assert!(!SqlChangeOperation::Update.is_delete());
    }

    #[test]
    fn test_display() {
        assert_eq!(SqlChangeOperation::Insert.to_string(), "INSERT");
        assert_eq!(SqlChangeOperation::Delete.to_string(), "DELETE");
    }
}
