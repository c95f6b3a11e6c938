//! Correlation store errors

use thiserror::Error;

/// Errors from the correlation store client
#[derive(Error, Debug)]
pub enum CorrelationError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Store rejected write with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Invalid store configuration: {0}")]
    Config(String),
}

pub type CorrelationResult<T> = Result<T, CorrelationError>;
