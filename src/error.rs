use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Unified error type for the Magpie application
#[derive(Error, Debug)]
pub enum MagpieError {
    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database connection failed: {0}")]
    DatabaseConnection(String),

    // Queue errors
    #[error("Queue error: {0}")]
    Queue(#[from] redis::RedisError),

    #[error("Queue is empty")]
    QueueEmpty,

    // Rotation errors
    #[error("No alive proxies are available for the selected protocol")]
    NoAliveProxies,

    #[error("Rotating proxy not found")]
    RotatorNotFound,

    #[error("Rotating proxy name already exists")]
    RotatorNameConflict,

    #[error("No available ports for rotating proxies")]
    PortExhausted,

    #[error("User not found: {0}")]
    UserNotFound(i64),

    // Upstream bridge errors
    #[error("Upstream dial failed: {0}")]
    UpstreamDial(String),

    #[error("Upstream handshake failed: {0}")]
    UpstreamHandshake(String),

    #[error("Upstream authentication failed: {0}")]
    UpstreamAuth(String),

    #[error("Upstream rejected the request: {0}")]
    UpstreamReject(String),

    #[error("Unsupported upstream protocol: {0}")]
    UnsupportedProtocol(String),

    // Checker errors
    #[error("Probe failed: {0}")]
    ProbeFailed(String),

    // Validation errors
    #[error("{0}")]
    Validation(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Security errors
    #[error("Encryption error: {0}")]
    Crypto(String),

    // Request errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Operation timed out")]
    Timeout,

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for Magpie operations
pub type Result<T> = std::result::Result<T, MagpieError>;

impl MagpieError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            MagpieError::Validation(_)
            | MagpieError::InvalidRequest(_)
            | MagpieError::UnsupportedProtocol(_)
            | MagpieError::InvalidConfig(_) => StatusCode::BAD_REQUEST,

            // 404 Not Found
            MagpieError::RotatorNotFound | MagpieError::UserNotFound(_) => StatusCode::NOT_FOUND,

            // 409 Conflict
            MagpieError::RotatorNameConflict => StatusCode::CONFLICT,

            // 502 Bad Gateway
            MagpieError::UpstreamDial(_)
            | MagpieError::UpstreamHandshake(_)
            | MagpieError::UpstreamAuth(_)
            | MagpieError::UpstreamReject(_)
            | MagpieError::NoAliveProxies
            | MagpieError::ProbeFailed(_) => StatusCode::BAD_GATEWAY,

            // 503 Service Unavailable
            MagpieError::PortExhausted
            | MagpieError::DatabaseConnection(_)
            | MagpieError::QueueEmpty => StatusCode::SERVICE_UNAVAILABLE,

            // 504 Gateway Timeout
            MagpieError::Timeout => StatusCode::GATEWAY_TIMEOUT,

            // 500 Internal Server Error
            MagpieError::Database(_)
            | MagpieError::Queue(_)
            | MagpieError::Crypto(_)
            | MagpieError::Io(_)
            | MagpieError::Http(_)
            | MagpieError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if this is a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    /// Check if this is a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }
}

// Implement IntoResponse for API error responses
impl IntoResponse for MagpieError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({
            "error": self.to_string(),
        });

        (status, Json(body)).into_response()
    }
}

// Convert from hyper errors
impl From<hyper::Error> for MagpieError {
    fn from(err: hyper::Error) -> Self {
        MagpieError::Http(err.to_string())
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for MagpieError {
    fn from(err: url::ParseError) -> Self {
        MagpieError::InvalidRequest(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_code_mapping() {
        assert_eq!(
            MagpieError::Validation("name is required".to_string()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            MagpieError::RotatorNotFound.status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            MagpieError::RotatorNameConflict.status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            MagpieError::PortExhausted.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            MagpieError::NoAliveProxies.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            MagpieError::UpstreamDial("refused".to_string()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            MagpieError::Timeout.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn test_error_client_server_helpers() {
        assert!(MagpieError::Validation("bad".to_string()).is_client_error());
        assert!(!MagpieError::Validation("bad".to_string()).is_server_error());

        assert!(MagpieError::NoAliveProxies.is_server_error());
        assert!(!MagpieError::NoAliveProxies.is_client_error());
    }
}
