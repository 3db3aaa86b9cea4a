use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    InvalidDocId(String),
    InvalidRevision(String),
    InvalidJson(String),
    RevisionConflict,
    ConflictedDoc,
    DocumentDoesNotExist,
    DocumentAlreadyDeleted,
    DatabaseDoesNotExist(String),
    IndexNameTaken(String),
    IndexDoesNotExist(String),
    IndexDefinitionParse(String),
    InvalidValueForIndex(String),
    InvalidGlobbing,
    InvalidGeneration,
    InvalidTransactionId,
    BrokenSyncStream(String),
    Unavailable,
    Unauthorized(String),
    BadRequest(String),
    Http { status: u16, body: String },
    Internal(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::InvalidDocId(id) => write!(f, "Invalid document id: {}", id),
            StoreError::InvalidRevision(rev) => write!(f, "Invalid revision: {}", rev),
            StoreError::InvalidJson(msg) => write!(f, "Invalid JSON: {}", msg),
            StoreError::RevisionConflict => write!(f, "Revision conflict"),
            StoreError::ConflictedDoc => {
                write!(f, "Document has conflicts; resolve them first")
            }
            StoreError::DocumentDoesNotExist => write!(f, "Document does not exist"),
            StoreError::DocumentAlreadyDeleted => write!(f, "Document already deleted"),
            StoreError::DatabaseDoesNotExist(name) => {
                write!(f, "Database does not exist: {}", name)
            }
            StoreError::IndexNameTaken(name) => {
                write!(f, "Index name already in use: {}", name)
            }
            StoreError::IndexDoesNotExist(name) => write!(f, "No such index: {}", name),
            StoreError::IndexDefinitionParse(msg) => {
                write!(f, "Bad index expression: {}", msg)
            }
            StoreError::InvalidValueForIndex(msg) => {
                write!(f, "Invalid value for index: {}", msg)
            }
            StoreError::InvalidGlobbing => write!(f, "Invalid globbing in index query"),
            StoreError::InvalidGeneration => write!(f, "Invalid generation"),
            StoreError::InvalidTransactionId => write!(f, "Invalid transaction id"),
            StoreError::BrokenSyncStream(msg) => write!(f, "Broken sync stream: {}", msg),
            StoreError::Unavailable => write!(f, "Unavailable"),
            StoreError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            StoreError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            StoreError::Http { status, body } => {
                write!(f, "HTTP error {}: {}", status, body)
            }
            StoreError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

impl StoreError {
    /// Stable identifier used in HTTP error bodies, so the client side can
    /// map a response back to the same error kind.
    pub fn wire_description(&self) -> &'static str {
        match self {
            StoreError::InvalidDocId(_) => "invalid document id",
            StoreError::InvalidRevision(_) => "invalid revision",
            StoreError::InvalidJson(_) => "invalid json",
            StoreError::RevisionConflict => "revision conflict",
            StoreError::ConflictedDoc => "conflicted document",
            StoreError::DocumentDoesNotExist => "document does not exist",
            StoreError::DocumentAlreadyDeleted => "document already deleted",
            StoreError::DatabaseDoesNotExist(_) => "database does not exist",
            StoreError::IndexNameTaken(_) => "index name taken",
            StoreError::IndexDoesNotExist(_) => "index does not exist",
            StoreError::IndexDefinitionParse(_) => "invalid index definition",
            StoreError::InvalidValueForIndex(_) => "invalid value for index",
            StoreError::InvalidGlobbing => "invalid globbing",
            StoreError::InvalidGeneration => "invalid generation",
            StoreError::InvalidTransactionId => "invalid transaction id",
            StoreError::BrokenSyncStream(_) => "broken sync stream",
            StoreError::Unavailable => "unavailable",
            StoreError::Unauthorized(_) => "unauthorized",
            StoreError::BadRequest(_) => "bad request",
            StoreError::Http { .. } => "http error",
            StoreError::Internal(_) => "internal error",
        }
    }

    /// Reconstruct an error from an HTTP status and JSON error body.
    pub fn from_wire(status: u16, error: &str, message: Option<&str>) -> StoreError {
        match error {
            "revision conflict" => StoreError::RevisionConflict,
            "document does not exist" => StoreError::DocumentDoesNotExist,
            "document already deleted" => StoreError::DocumentAlreadyDeleted,
            "database does not exist" => {
                StoreError::DatabaseDoesNotExist(message.unwrap_or("").to_string())
            }
            "invalid document id" => {
                StoreError::InvalidDocId(message.unwrap_or("").to_string())
            }
            "invalid generation" => StoreError::InvalidGeneration,
            "invalid transaction id" => StoreError::InvalidTransactionId,
            "unavailable" => StoreError::Unavailable,
            "unauthorized" => StoreError::Unauthorized(message.unwrap_or("").to_string()),
            "bad request" => StoreError::BadRequest(message.unwrap_or("").to_string()),
            _ => StoreError::Http {
                status,
                body: message.unwrap_or(error).to_string(),
            },
        }
    }
}

impl IntoResponse for StoreError {
    fn into_response(self) -> Response {
        let status = match &self {
            StoreError::InvalidDocId(_)
            | StoreError::InvalidRevision(_)
            | StoreError::InvalidJson(_)
            | StoreError::IndexNameTaken(_)
            | StoreError::IndexDefinitionParse(_)
            | StoreError::InvalidValueForIndex(_)
            | StoreError::InvalidGlobbing
            | StoreError::InvalidGeneration
            | StoreError::InvalidTransactionId
            | StoreError::BadRequest(_) => StatusCode::BAD_REQUEST,
            StoreError::RevisionConflict | StoreError::ConflictedDoc => StatusCode::CONFLICT,
            StoreError::DocumentDoesNotExist
            | StoreError::DocumentAlreadyDeleted
            | StoreError::DatabaseDoesNotExist(_)
            | StoreError::IndexDoesNotExist(_) => StatusCode::NOT_FOUND,
            StoreError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            StoreError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            StoreError::BrokenSyncStream(_)
            | StoreError::Http { .. }
            | StoreError::Internal(_) => {
                tracing::error!("Internal error: {}", self);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = Json(json!({
            "error": self.wire_description(),
            "message": self.to_string(),
        }));

        (status, body).into_response()
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::InvalidJson(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
