//! Core error type.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A worker event line that is JSON but not a usable event.
    #[error("Malformed worker event: {0}")]
    NdjsonParse(String),

    /// Invalid or unreadable settings.
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
