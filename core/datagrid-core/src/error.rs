//! Error types for the DataGrid engine.
//!
//! All public APIs return `DgResult<T>` — no panics in library code.

use std::path::PathBuf;
use thiserror::Error;

/// Unified error type for all DataGrid operations.
#[derive(Debug, Error)]
pub enum DgError {
    /// Column name or type definition rejected (duplicate, reserved, too long,
    /// unknown type, too many columns)
    #[error("schema error: {0}")]
    Schema(String),

    /// Value incompatible with the column's unified type
    #[error("type mismatch in column '{column}': value {value} is not compatible with {expected}")]
    TypeMismatch {
        column: String,
        value: String,
        expected: String,
    },

    /// Operation used on the wrong kind of grid
    #[error("mode error: '{operation}' requires an {required} grid")]
    Mode {
        operation: String,
        required: &'static str,
    },

    /// Expression could not be compiled to SQL
    #[error("query compile error: {message}\nFragment: {fragment}")]
    QueryCompile { message: String, fragment: String },

    /// The relational store rejected compiled SQL
    #[error("query execution error: {message}\nSQL: {sql}")]
    QueryExecution { message: String, sql: String },

    /// Requested asset does not exist
    #[error("asset '{0}' not found")]
    AssetNotFound(String),

    /// Requested grid file does not exist
    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    /// SQLite error outside of query execution (DDL, catalog, assets)
    #[error("sqlite error: {source}")]
    Sqlite {
        #[from]
        source: rusqlite::Error,
    },

    /// Standard I/O error
    #[error("io error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid arguments
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
}

/// Result type alias for all DataGrid operations.
pub type DgResult<T> = Result<T, DgError>;

impl From<serde_json::Error> for DgError {
    fn from(err: serde_json::Error) -> Self {
        DgError::Serialization(err.to_string())
    }
}

impl DgError {
    pub(crate) fn compile(message: impl Into<String>, fragment: impl Into<String>) -> Self {
        DgError::QueryCompile {
            message: message.into(),
            fragment: fragment.into(),
        }
    }

    pub(crate) fn execution(err: rusqlite::Error, sql: &str) -> Self {
        DgError::QueryExecution {
            message: err.to_string(),
            sql: sql.to_string(),
        }
    }

    pub(crate) fn on_disk_only(operation: &str) -> Self {
        DgError::Mode {
            operation: operation.to_string(),
            required: "on-disk",
        }
    }

    /// True for errors the HTTP layer reports as 404.
    pub fn is_not_found(&self) -> bool {
        matches!(self, DgError::AssetNotFound(_) | DgError::FileNotFound(_))
    }

    /// Message printed by command-line front ends before exiting non-zero.
    pub fn cli_message(&self) -> String {
        format!("ERROR: {}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_schema() {
        let err = DgError::Schema("column 'a' already exists".to_string());
        assert_eq!(err.to_string(), "schema error: column 'a' already exists");
    }

    #[test]
    fn error_display_type_mismatch() {
        let err = DgError::TypeMismatch {
            column: "score".to_string(),
            value: "\"abc\"".to_string(),
            expected: "FLOAT".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("score"));
        assert!(msg.contains("\"abc\""));
        assert!(msg.contains("FLOAT"));
    }

    #[test]
    fn error_display_mode() {
        let err = DgError::on_disk_only("append_column(expression)");
        assert_eq!(
            err.to_string(),
            "mode error: 'append_column(expression)' requires an on-disk grid"
        );
    }

    #[test]
    fn error_display_query_compile() {
        let err = DgError::compile("unknown namespace 'os'", "os.system('ls')");
        assert!(err.to_string().contains("query compile error"));
        assert!(err.to_string().contains("os.system"));
    }

    #[test]
    fn not_found_mapping() {
        assert!(DgError::AssetNotFound("abc".into()).is_not_found());
        assert!(DgError::FileNotFound(PathBuf::from("x.datagrid")).is_not_found());
        assert!(!DgError::Schema("x".into()).is_not_found());
    }

    #[test]
    fn cli_message_prefix() {
        let err = DgError::InvalidArguments("limit must be positive".into());
        assert_eq!(
            err.cli_message(),
            "ERROR: invalid arguments: limit must be positive"
        );
    }
}
