use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use report_common::report::ValidationError;
use report_common::store::StoreError;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

/// Counts describing the work completed by an invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistSummary {
    pub table_name: String,
    pub total: usize,
    pub processed: usize,
    pub skipped: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingest_duration_ms: Option<u64>,
}

impl PersistSummary {
    pub fn new(table_name: &str, total: usize, correlation_id: Option<String>) -> Self {
        Self {
            table_name: table_name.to_owned(),
            total,
            processed: 0,
            skipped: 0,
            correlation_id,
            ingest_duration_ms: None,
        }
    }
}

/// A report that could not be persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureDetail {
    pub report_id: String,
    pub message: String,
}

/// Enumeration of errors that end an invocation.
#[derive(Error, Debug)]
pub enum PersistError {
    #[error("invalid event: {0}")]
    Validation(#[from] ValidationError),
    #[error("{message}")]
    Storage {
        message: String,
        failures: Vec<FailureDetail>,
        summary: PersistSummary,
    },
}

impl IntoResponse for PersistError {
    fn into_response(self) -> Response {
        match self {
            PersistError::Validation(error) => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": error.to_string() })),
            )
                .into_response(),
            PersistError::Storage {
                message,
                failures,
                summary,
            } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "error": message,
                    "failures": failures,
                    "summary": summary,
                })),
            )
                .into_response(),
        }
    }
}

/// Outcome of a single transactional write, as seen by the conflict resolver.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WriteError {
    #[error("report already exists: {0}")]
    DuplicateConflict(StoreError),
    #[error(transparent)]
    Storage(StoreError),
}

impl From<StoreError> for WriteError {
    fn from(error: StoreError) -> Self {
        if error.has_conditional_check_failure() {
            WriteError::DuplicateConflict(error)
        } else {
            WriteError::Storage(error)
        }
    }
}
