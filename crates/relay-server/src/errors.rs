//! Server-side error types.

use thiserror::Error;

/// Errors that can occur when loading or parsing settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// Failed to read the settings file from disk.
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    /// Failed to parse JSON in the settings file.
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for settings operations.
pub type Result<T> = std::result::Result<T, SettingsError>;

/// Why a WebSocket upgrade request was refused before the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    /// A required identity header (or query parameter) is absent or empty.
    #[error("missing {0}")]
    MissingIdentity(&'static str),
    /// The requested dialect name is not recognised.
    #[error("unknown dialect {0:?}")]
    UnknownDialect(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_from_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: SettingsError = io_err.into();
        assert!(matches!(err, SettingsError::Io(_)));
        assert!(err.to_string().contains("denied"));
    }

    #[test]
    fn json_error_display() {
        let json_err = serde_json::from_str::<serde_json::Value>("{bad}").unwrap_err();
        let err = SettingsError::Json(json_err);
        assert!(err.to_string().contains("parse settings JSON"));
    }

    #[test]
    fn handshake_error_display() {
        assert_eq!(
            HandshakeError::MissingIdentity("X-Self-ID").to_string(),
            "missing X-Self-ID"
        );
        assert_eq!(
            HandshakeError::UnknownDialect("v13".into()).to_string(),
            "unknown dialect \"v13\""
        );
    }
}
