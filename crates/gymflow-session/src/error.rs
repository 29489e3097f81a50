//! Session-level error taxonomy
//!
//! Recoverable conditions (a stale cache, a transient verification
//! failure) are absorbed inside the controller and logged; the variants
//! here are the ones UI consumers must branch on. The expired variants
//! always coincide with a full local teardown, so a caller seeing them
//! can redirect to a login surface without cleaning anything up first.

use gymflow_auth::Error as AuthError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Client-side field validation; raised before any network call.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Login rejected by the backend.
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    /// The refresh token was rejected; the session has been logged out.
    #[error("authentication expired: {0}")]
    AuthExpired(String),

    /// A 401 persisted through one refresh-and-retry cycle; the session
    /// has been logged out.
    #[error("session expired: {0}")]
    SessionExpired(String),

    /// No session is held at all.
    #[error("authentication required: {0}")]
    AuthRequired(String),

    /// Transport-level failure; retryable by the caller.
    #[error("network error: {0}")]
    Network(String),

    /// Backend failure other than an auth rejection.
    #[error("server error: {0}")]
    Server(String),

    /// Local persistence failure.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result alias for session operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<AuthError> for Error {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::Validation(m) => Error::Validation(m),
            AuthError::InvalidCredentials(m) => Error::InvalidCredentials(m),
            AuthError::AuthExpired(m) => Error::AuthExpired(m),
            AuthError::Http(m) => Error::Network(m),
            AuthError::Server { status, message } => Error::Server(format!("{status}: {message}")),
            AuthError::Parse(m) => Error::Server(format!("malformed response: {m}")),
            AuthError::Io(m) | AuthError::NotFound(m) => Error::Internal(m),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_errors_lower_into_session_taxonomy() {
        let e: Error = AuthError::Validation("password too short".into()).into();
        assert!(matches!(e, Error::Validation(_)));

        let e: Error = AuthError::InvalidCredentials("bad password".into()).into();
        assert!(matches!(e, Error::InvalidCredentials(_)));

        let e: Error = AuthError::AuthExpired("refresh rejected".into()).into();
        assert!(matches!(e, Error::AuthExpired(_)));

        let e: Error = AuthError::Http("connection refused".into()).into();
        assert!(matches!(e, Error::Network(_)));

        let e: Error = AuthError::Server {
            status: 503,
            message: "maintenance".into(),
        }
        .into();
        assert!(matches!(e, Error::Server(_)));
    }

    #[test]
    fn display_names_the_condition() {
        let e = Error::SessionExpired("rejected after refresh".into());
        assert_eq!(e.to_string(), "session expired: rejected after refresh");
    }
}
