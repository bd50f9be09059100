//! Error types for the Stash engine.
//!
//! Messages are part of the public contract: callers match on them, so the
//! `Display` output of each variant must stay stable.

use crate::sync::errors::ErrorType;
use crate::sync::transport::GraphQLError;
use thiserror::Error;

/// All possible errors from the Stash engine.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    // Validation errors
    #[error("Field {0} is required")]
    MissingRequiredField(String),

    #[error("Field {field} should be of type {expected}, {actual} received. {value}")]
    TypeMismatch {
        field: String,
        expected: String,
        actual: String,
        value: String,
    },

    #[error("Field {field} should be of type {format}, validation failed. {value}")]
    FormatMismatch {
        field: String,
        format: String,
        value: String,
    },

    #[error("Field {field} should be of type [{expected}], {actual} received. {value}")]
    NotAnArray {
        field: String,
        expected: String,
        actual: String,
        value: String,
    },

    #[error("All elements in the {field} array should be of type {expected}, [{types}] received. {values}")]
    ArrayElementMismatch {
        field: String,
        expected: String,
        types: String,
        values: String,
    },

    #[error("All elements in the {field} array should be of type {format}, validation failed for one or more elements. {values}")]
    ArrayFormatMismatch {
        field: String,
        format: String,
        values: String,
    },

    #[error("{0} is read-only.")]
    ReadOnlyField(String),

    #[error("Cannot assign to read only property '{0}' of object")]
    FrozenProperty(String),

    #[error("The source object is not a valid model")]
    InvalidCopySource,

    #[error("Field {0} is not a relation")]
    NotARelation(String),

    #[error("Unknown type: {0}")]
    UnknownType(String),

    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    // Usage errors
    #[error("Model or Model Constructor required")]
    ModelRequired,

    #[error("Id to delete or criteria required. Do you want to delete all? Pass Predicates.ALL")]
    DeleteCriteriaRequired,

    #[error("Criteria required. Do you want to delete all? Pass Predicates.ALL")]
    EmptyCriteria,

    #[error("Object is not an instance of a valid model")]
    NotAModel,

    #[error("Invalid criteria")]
    InvalidCriteria,

    #[error("Constructor is not for a valid model")]
    InvalidModelConstructor,

    #[error("Cannot provide criteria without a modelConstructor")]
    CriteriaWithoutModel,

    #[error("Limit is required when requesting a page")]
    LimitRequired,

    #[error("Page should be a number")]
    PageNotANumber,

    #[error("Page can't be negative")]
    NegativePage,

    #[error("Limit should be a number")]
    LimitNotANumber,

    #[error("Limit can't be negative")]
    NegativeLimit,

    // Lifecycle errors
    #[error("Schema is not initialized")]
    SchemaNotInitialized,

    // Storage errors
    #[error("Conditional update failed")]
    ConditionFailed,

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("storage error: {0}")]
    Storage(String),

    // Sync errors
    #[error("{message}")]
    NonRetryable { message: String },

    #[error("{}", summarize(errors))]
    Sync {
        errors: Vec<GraphQLError>,
        error_type: ErrorType,
    },
}

fn summarize(errors: &[GraphQLError]) -> String {
    if errors.is_empty() {
        return "sync request failed".to_string();
    }
    errors
        .iter()
        .map(|e| e.message.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Whether the sync retry loop must give up immediately.
    pub fn is_non_retryable(&self) -> bool {
        matches!(self, Error::NonRetryable { .. })
    }

    /// Whether the failure is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Sync {
                error_type: ErrorType::Transient,
                ..
            }
        )
    }

    /// True for construction/copy-time validation failures.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::MissingRequiredField(_)
                | Error::TypeMismatch { .. }
                | Error::FormatMismatch { .. }
                | Error::NotAnArray { .. }
                | Error::ArrayElementMismatch { .. }
                | Error::ArrayFormatMismatch { .. }
                | Error::ReadOnlyField(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
