//! Classification of sync failures and the pluggable error handler.

use super::transport::{GraphQLError, TransportError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Messages raised by the transport when local auth state is missing.
const CLIENT_AUTH_ERRORS: [&str; 4] = [
    "No api-key configured",
    "No current user",
    "No credentials",
    "No federated jwt",
];

/// Kind of a sync failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorType {
    ConfigError,
    BadModel,
    BadRecord,
    Unauthorized,
    Transient,
    ConflictUnhandled,
    Unknown,
}

/// Which sync phase hit the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncProcess {
    Sync,
    Mutate,
}

/// Context handed to the error handler for every sync error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncErrorContext {
    pub operation: String,
    pub process: SyncProcess,
    pub error_type: ErrorType,
    pub message: String,
    pub model: String,
    /// Offending record, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<serde_json::Value>,
}

/// Receives every classified sync error.
pub type ErrorHandler = Arc<dyn Fn(&SyncErrorContext) + Send + Sync>;

/// Handler that only logs.
pub fn log_errors() -> ErrorHandler {
    Arc::new(|ctx: &SyncErrorContext| {
        tracing::warn!(
            operation = %ctx.operation,
            model = %ctx.model,
            error_type = ?ctx.error_type,
            message = %ctx.message,
            "sync error"
        );
    })
}

/// Whether the failure must abort retrying immediately.
pub fn is_non_retryable(err: &TransportError) -> bool {
    err.status == Some(403)
        || err.status == Some(401)
        || err
            .messages()
            .any(|m| m.contains("status code 403") || CLIENT_AUTH_ERRORS.iter().any(|c| m.contains(c)))
}

/// Classify a single message, with its HTTP status and reported type if any.
pub fn classify(message: &str, status: Option<u16>, reported: Option<&str>) -> ErrorType {
    let lower = message.to_ascii_lowercase();

    if matches!(status, Some(401 | 403))
        || matches!(reported, Some("Unauthorized"))
        || lower.contains("not authorized")
        || lower.contains("unauthorized")
        || lower.contains("status code 401")
        || lower.contains("status code 403")
    {
        return ErrorType::Unauthorized;
    }

    if matches!(reported, Some(t) if t.contains("ConditionalCheckFailed") || t == "ConflictUnhandled") {
        return ErrorType::ConflictUnhandled;
    }

    if is_bad_record(message) {
        return ErrorType::BadRecord;
    }

    if lower.contains("validation error of type") || lower.contains("fieldundefined") {
        return ErrorType::BadModel;
    }

    if CLIENT_AUTH_ERRORS.iter().any(|c| message.contains(c))
        || lower.contains("has coerced null value")
    {
        return ErrorType::ConfigError;
    }

    if status.is_some_and(|s| s >= 500 || s == 429)
        || lower.contains("connection failed")
        || lower.contains("connection timeout")
        || lower.contains("network error")
        || lower.contains("timed out")
        || server_error_status(&lower)
    {
        return ErrorType::Transient;
    }

    ErrorType::Unknown
}

/// Classify one per-item error of a response.
pub fn classify_graphql(error: &GraphQLError, status: Option<u16>) -> ErrorType {
    classify(&error.message, status, error.error_type.as_deref())
}

/// "Cannot return <type> for <type> type" and similar shape errors.
fn is_bad_record(message: &str) -> bool {
    let Some(rest) = message.strip_prefix("Cannot return ") else {
        return message.contains("Can't resolve value")
            || message.contains("cannot be converted to a")
            || message.contains("Cannot return null for non-nullable type");
    };
    let mut words = rest.split_whitespace();
    matches!(
        (words.next(), words.next(), words.next(), words.next()),
        (Some(_), Some("for"), Some(_), Some("type"))
    )
}

/// "status code 5xx" anywhere in the message.
fn server_error_status(lower: &str) -> bool {
    lower.match_indices("status code ").any(|(i, m)| {
        let code = &lower[i + m.len()..];
        let code: String = code.chars().take_while(char::is_ascii_digit).collect();
        code.len() == 3 && code.starts_with('5')
    })
}
