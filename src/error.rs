//! Error types for the schema engine

use thiserror::Error;

use crate::validator::ValidationIssue;

/// Result type for schema operations
pub type Result<T> = std::result::Result<T, SchemaError>;

/// Schema engine errors
///
/// Every variant is `Clone` so a failed rehydration can be handed to each
/// caller waiting on the same load.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchemaError {
    #[error("Schema not found: {table}.{column}")]
    SchemaNotFound { table: String, column: String },

    #[error("Validation failed for {table}.{column}: {} issue(s)", issues.len())]
    ValidationFailed {
        table: String,
        column: String,
        issues: Vec<ValidationIssue>,
    },

    #[error("Unsafe regex pattern")]
    UnsafeRegexPattern { pattern: String },

    #[error("Invalid regex pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Field already exists: {field} on {table}.{column}")]
    FieldAlreadyExists {
        table: String,
        column: String,
        field: String,
    },

    #[error("Unrecognized field type: {0}")]
    UnrecognizedFieldType(String),

    #[error("No extensible schema registered for {table}.{column}")]
    NotRegistered { table: String, column: String },

    #[error("Invalid field name '{0}': must match ^[a-z][a-z0-9_]*$")]
    InvalidFieldName(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid schema format: {0}")]
    InvalidFormat(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("JSON error: {0}")]
    Json(String),
}

impl SchemaError {
    /// HTTP status class collaborators should map this error to
    pub fn status_code(&self) -> u16 {
        match self {
            SchemaError::SchemaNotFound { .. } | SchemaError::NotRegistered { .. } => 404,
            SchemaError::ValidationFailed { .. }
            | SchemaError::UnsafeRegexPattern { .. }
            | SchemaError::InvalidPattern { .. }
            | SchemaError::InvalidFieldName(_)
            | SchemaError::InvalidArgument(_)
            | SchemaError::UnrecognizedFieldType(_) => 400,
            SchemaError::FieldAlreadyExists { .. } => 409,
            SchemaError::InvalidFormat(_)
            | SchemaError::Storage(_)
            | SchemaError::Io(_)
            | SchemaError::Json(_) => 500,
        }
    }

    /// True for errors caused by the caller's input rather than the engine
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code())
    }
}

impl From<std::io::Error> for SchemaError {
    fn from(err: std::io::Error) -> Self {
        SchemaError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for SchemaError {
    fn from(err: serde_json::Error) -> Self {
        SchemaError::Json(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsafe_pattern_message_is_exact() {
        let err = SchemaError::UnsafeRegexPattern {
            pattern: "(a+)+$".to_string(),
        };
        assert_eq!(err.to_string(), "Unsafe regex pattern");
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn test_status_mapping() {
        let conflict = SchemaError::FieldAlreadyExists {
            table: "mentors".into(),
            column: "metadata".into(),
            field: "tier".into(),
        };
        assert_eq!(conflict.status_code(), 409);
        assert!(conflict.is_client_error());
        assert_eq!(SchemaError::Storage("down".into()).status_code(), 500);
        assert!(!SchemaError::Storage("down".into()).is_client_error());
    }
}
