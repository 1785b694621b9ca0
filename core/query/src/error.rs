use axum::http::StatusCode;
use thiserror::Error;

/// Errors that can occur while answering a query.
///
/// Advisory stages (graph enrichment, verification, subquestion planning,
/// individual classifier calls) recover from these locally; load-bearing
/// stages propagate them to the HTTP edge, where `status_code` decides the
/// response.
#[derive(Error, Debug)]
pub enum QueryError {
    #[error("bad input: {0}")]
    BadInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("could not parse model output: {0}")]
    LlmParse(String),

    #[error("deadline exceeded: {0}")]
    Timeout(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl QueryError {
    /// HTTP status for this error kind.
    pub fn status_code(&self) -> StatusCode {
        match self {
            QueryError::BadInput(_) => StatusCode::BAD_REQUEST,
            QueryError::NotFound(_) => StatusCode::NOT_FOUND,
            QueryError::Conflict(_) => StatusCode::CONFLICT,
            QueryError::Upstream(_) | QueryError::LlmParse(_) => StatusCode::BAD_GATEWAY,
            QueryError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            QueryError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
            QueryError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<rusqlite::Error> for QueryError {
    fn from(e: rusqlite::Error) -> Self {
        QueryError::Store(e.to_string())
    }
}

impl From<reqwest::Error> for QueryError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            QueryError::Timeout(e.to_string())
        } else {
            QueryError::Upstream(e.to_string())
        }
    }
}

impl From<serde_json::Error> for QueryError {
    fn from(e: serde_json::Error) -> Self {
        QueryError::Internal(e.to_string())
    }
}
