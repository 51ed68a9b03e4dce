use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum AppError {
    #[error("Store not ready: {0}")]
    NotReady(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    #[error("Transaction conflict: {0}")]
    TransactionConflict(String),

    #[error("Write concern timeout: {0}")]
    WriteConcernTimeout(String),

    #[error("Commit result unknown: {0}")]
    CommitUnknown(String),

    #[error("Transaction aborted: {0}")]
    TransactionAborted(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal server error: {0}")]
    InternalServerError(String),
}

impl AppError {
    /// Errors worth repeating the whole operation for. A write-concern
    /// timeout only qualifies before commit; see `CommitUnknown`.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::ConnectionError(_)
                | AppError::TransactionConflict(_)
                | AppError::WriteConcernTimeout(_)
        )
    }

    /// Errors that no amount of waiting will fix.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AppError::ConfigurationError(_))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalServerError(format!("IO error: {}", err))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::InternalServerError(format!("JSON error: {}", err))
    }
}

impl From<mongodb::bson::ser::Error> for AppError {
    fn from(err: mongodb::bson::ser::Error) -> Self {
        AppError::ValidationError(format!("BSON serialization error: {}", err))
    }
}

impl From<mongodb::bson::de::Error> for AppError {
    fn from(err: mongodb::bson::de::Error) -> Self {
        AppError::DatabaseError(format!("BSON deserialization error: {}", err))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::NotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::ConnectionError(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::ConfigurationError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::DuplicateKey(_) => StatusCode::CONFLICT,
            AppError::TransactionConflict(_) => StatusCode::CONFLICT,
            AppError::WriteConcernTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::CommitUnknown(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::TransactionAborted(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::DatabaseError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::InternalServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "error": self.to_string(),
            "status": status.as_u16(),
            "timestamp": chrono::Utc::now().to_rfc3339()
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(AppError::TransactionConflict("write conflict".into()).is_retryable());
        assert!(AppError::WriteConcernTimeout("wtimeout".into()).is_retryable());
        assert!(AppError::ConnectionError("reset".into()).is_retryable());
        assert!(!AppError::ValidationError("bad".into()).is_retryable());
        assert!(!AppError::DuplicateKey("dup".into()).is_retryable());
        assert!(!AppError::Timeout("deadline".into()).is_retryable());
        assert!(!AppError::CommitUnknown("wtimeout at commit".into()).is_retryable());
    }

    #[test]
    fn test_commit_unknown_maps_to_gateway_timeout() {
        let response = AppError::CommitUnknown("wtimeout".into()).into_response();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn test_not_ready_maps_to_service_unavailable() {
        let response = AppError::NotReady("reconnecting".into()).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
