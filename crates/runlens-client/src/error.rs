//! Error types for the Runlens client.

use runlens_core::RunlensError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Request failed with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Invalid header value: {0}")]
    InvalidHeader(String),

    #[error("Timed out after {0} ms")]
    Timeout(u64),

    #[error("Connection closed: {0}")]
    Closed(String),

    #[error(transparent)]
    Core(#[from] RunlensError),
}

impl ClientError {
    /// Whether retrying the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Http(_)
            | ClientError::WebSocket(_)
            | ClientError::Timeout(_)
            | ClientError::Closed(_) => true,
            ClientError::Status { status, .. } => *status >= 500 || *status == 429,
            ClientError::Url(_) | ClientError::InvalidHeader(_) | ClientError::Core(_) => false,
        }
    }
}
