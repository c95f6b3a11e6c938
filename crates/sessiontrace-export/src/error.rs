//! Error types for span export

use thiserror::Error;

/// Errors from a single export request
#[derive(Debug, Error)]
pub enum ExportError {
    /// Network/HTTP error
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The request did not complete within the export timeout
    #[error("Request timed out")]
    Timeout,

    /// The collector answered with a non-success status
    #[error("Collector returned {status}: {body}")]
    Status { status: u16, body: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ExportError {
    /// Whether a local retry may succeed
    ///
    /// Network errors, timeouts, 408, 429 and 5xx are transient. Any other
    /// status means the request itself is wrong.
    pub fn is_retryable(&self) -> bool {
        match self {
            ExportError::Network(e) => !e.is_builder(),
            ExportError::Timeout => true,
            ExportError::Status { status, .. } => {
                matches!(status, 408 | 429) || (500..600).contains(status)
            }
            ExportError::Config(_) => false,
        }
    }
}

/// Result type for export operations
pub type ExportResult<T> = Result<T, ExportError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn status(code: u16) -> ExportError {
        ExportError::Status {
            status: code,
            body: String::new(),
        }
    }

    #[test]
    fn test_retryable_classification() {
        assert!(ExportError::Timeout.is_retryable());
        for code in [408, 429, 500, 502, 503, 504] {
            assert!(status(code).is_retryable(), "{}", code);
        }
        for code in [400, 401, 403, 404, 413] {
            assert!(!status(code).is_retryable(), "{}", code);
        }
        assert!(!ExportError::Config("bad header".into()).is_retryable());
    }
}
