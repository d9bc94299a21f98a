// error.rs - Error type shared by every pipeline component
//
// Model calls, checkpoint persistence, the message archive and configuration
// all report through DigestError so stages can use `?` end to end.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DigestError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API request failed: HTTP {status}: {body}")]
    Api { status: u16, body: String },

    #[error("malformed model response: {0}")]
    MalformedResponse(String),

    #[error("{label} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        label: String,
        attempts: usize,
        #[source]
        last: Box<DigestError>,
    },

    #[error("checkpoint file {path} could not be written: {source}")]
    Checkpoint {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("stage '{stage}' payload could not be decoded: {source}")]
    Payload {
        stage: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("embedding for theme {index} has {actual} dimensions, expected {expected}")]
    EmbeddingDimension {
        index: usize,
        expected: usize,
        actual: usize,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image processing failed: {0}")]
    Image(#[from] image::ImageError),
}

impl DigestError {
    /// Losing the checkpoint silently would defeat resumability, so these
    /// errors stop the whole run instead of just the current group.
    pub fn is_fatal_for_run(&self) -> bool {
        matches!(self, DigestError::Checkpoint { .. })
    }
}

pub type DigestResult<T> = Result<T, DigestError>;
