//! Error types for authentication and storage operations

/// Errors from the wire and persistence layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("authentication expired: {0}")]
    AuthExpired(String),

    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("not found: {0}")]
    NotFound(String),
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
