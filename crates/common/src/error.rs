//! Common error types

use thiserror::Error;

/// Errors shared across the workspace crates (configuration and local I/O).
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Result alias using common Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display_includes_message() {
        let err = Error::Config("api_base_url missing".into());
        assert_eq!(err.to_string(), "Configuration error: api_base_url missing");
    }

    #[test]
    fn io_error_converts_and_prefixes() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied").into();
        assert!(err.to_string().starts_with("I/O error:"), "got: {err}");
    }

    #[test]
    fn toml_error_converts() {
        let parse_err = toml::from_str::<toml::Value>("not {{ toml").unwrap_err();
        let err: Error = parse_err.into();
        assert!(
            err.to_string().starts_with("TOML parse error:"),
            "got: {err}"
        );
    }
}
