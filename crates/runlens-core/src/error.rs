//! Error types for Runlens.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RunlensError {
    #[error("Payload for {kind} could not be decoded: {source}")]
    PayloadError {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}
