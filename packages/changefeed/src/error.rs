//! Structured error types for trigger initialization and the monitor loops.
//!
//! `TriggerError` is the crate's external error surface. Initialization
//! refuses to construct a monitor on any configuration or schema variant;
//! inside the loops, `Database` errors are transient (logged, batch cleared,
//! lease expiry hands the rows to another worker).
//!
//! Handler errors are deliberately not part of this enum: handlers return
//! `anyhow::Result`, and the engine only cares whether execution succeeded.

use thiserror::Error;

/// Crate-local result alias.
pub type Result<T> = std::result::Result<T, TriggerError>;

/// Errors produced by trigger initialization and the monitor.
#[derive(Debug, Error)]
pub enum TriggerError {
    /// Construction-time refusal: empty connection string, table name, or
    /// function id, or an unparseable tunable override.
    #[error("invalid trigger configuration: {0}")]
    Configuration(String),

    /// `OBJECT_ID` returned NULL for the user table name.
    #[error("table '{table}' not found")]
    TableNotFound { table: String },

    /// The user table has no primary key; change tracking requires one.
    #[error("table '{table}' has no primary key")]
    NoPrimaryKey { table: String },

    /// `CHANGE_TRACKING_MIN_VALID_VERSION` returned NULL for the table.
    #[error("change tracking is not enabled on table '{table}'")]
    ChangeTrackingNotEnabled { table: String },

    /// Driver-level failure. Transient inside the loops, fatal during
    /// initialization.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// `SYS_CHANGE_OPERATION` outside the I/U/D set.
    #[error("unknown change operation '{0}'")]
    UnknownOperation(String),

    /// A batch row could not be decoded into the handler's payload type.
    #[error("failed to decode change row: {0}")]
    Decode(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_table_name() {
        let err = TriggerError::TableNotFound {
            table: "dbo.Orders".to_string(),
        };
        assert_eq!(err.to_string(), "table 'dbo.Orders' not found");

        let err = TriggerError::ChangeTrackingNotEnabled {
            table: "dbo.Orders".to_string(),
        };
        assert!(err.to_string().contains("change tracking is not enabled"));
    }

    #[test]
    fn test_unknown_operation_display() {
        let err = TriggerError::UnknownOperation("X".to_string());
        assert_eq!(err.to_string(), "unknown change operation 'X'");
    }
}
