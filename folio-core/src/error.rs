use thiserror::Error;

use crate::PageNumber;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Superseded or torn down. Never surfaced to the reader.
    #[error("operation cancelled")]
    Cancelled,
    #[error("rendering engine unavailable: {0}")]
    Unavailable(String),
    #[error("failed to load document: {0}")]
    Load(String),
    #[error("page {0} is out of range")]
    PageOutOfRange(PageNumber),
    #[error("failed to render page {page}: {message}")]
    Render { page: PageNumber, message: String },
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl EngineError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode entry: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("storage quota exceeded ({used} of {limit} bytes)")]
    QuotaExceeded { used: usize, limit: usize },
}
