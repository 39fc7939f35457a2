//! Board Error Types

use shuttle_protocol::{BridgeError, ErrorCode};
use thiserror::Error;

/// Errors raised while bringing the board up or serving the host
#[derive(Debug, Error)]
pub enum BoardError {
    /// A bridge operation failed
    #[error(transparent)]
    Bridge(#[from] BridgeError),

    /// Configuration sources could not be read or merged
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// A loaded setting is out of range
    #[error("Invalid setting {field}: {reason}")]
    InvalidSetting { field: &'static str, reason: String },

    /// The global tracing subscriber could not be installed
    #[error("Logging init failed: {0}")]
    Logging(String),

    /// A frame could not be encoded for the host
    #[error("Frame encoding failed: {0}")]
    Frame(#[from] postcard::Error),
}

impl BoardError {
    /// Flat status code reported to the host
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Bridge(e) => e.code(),
            Self::Config(_) | Self::InvalidSetting { .. } | Self::Logging(_) => ErrorCode::InitFailed,
            Self::Frame(_) => ErrorCode::CommIoError,
        }
    }
}

/// Result alias for board operations
pub type BoardResult<T> = Result<T, BoardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bridge_errors_keep_their_code() {
        let err = BoardError::from(BridgeError::StreamingActive);
        assert_eq!(err.code(), ErrorCode::Failure);
        assert_eq!(err.to_string(), BridgeError::StreamingActive.to_string());
    }

    #[test]
    fn test_setup_errors_report_init_failed() {
        let err = BoardError::InvalidSetting {
            field: "log_level",
            reason: "unknown level".to_string(),
        };
        assert_eq!(err.code(), ErrorCode::InitFailed);
    }
}
