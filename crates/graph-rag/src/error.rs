//! Error types for ingestion, scheduling and retrieval

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for graph-rag operations
pub type Result<T> = std::result::Result<T, Error>;

/// Stage of a format parser at which decoding failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStage {
    /// Reading the file from disk or the object store
    Open,
    /// Decoding the container format (zip, xml, pdf objects, utf-8)
    Decode,
    /// Walking the decoded structure to produce nodes
    Extract,
}

impl std::fmt::Display for ParseStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseStage::Open => write!(f, "open"),
            ParseStage::Decode => write!(f, "decode"),
            ParseStage::Extract => write!(f, "extract"),
        }
    }
}

/// Structured "parse failed" error raised by format parsers
#[derive(Debug, Error)]
#[error("parse failed at {stage} stage for '{}': {message}", path.display())]
pub struct ParseError {
    pub stage: ParseStage,
    pub path: PathBuf,
    pub message: String,
}

impl ParseError {
    pub fn new(stage: ParseStage, path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self {
            stage,
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn open(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::new(ParseStage::Open, path, message)
    }

    pub fn decode(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::new(ParseStage::Decode, path, message)
    }

    pub fn extract(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::new(ParseStage::Extract, path, message)
    }
}

/// graph-rag errors
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// File parsing error
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// Unsupported file type
    #[error("Unsupported file type: {0}")]
    UnsupportedFileType(String),

    /// Embedding error
    #[error("Embedding generation failed: {0}")]
    Embedding(String),

    /// LLM error
    #[error("LLM error: {0}")]
    Llm(String),

    /// OCR error
    #[error("OCR error: {0}")]
    Ocr(String),

    /// Metadata, vector or object store error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Durable queue error
    #[error("Queue error: {0}")]
    Queue(String),

    /// Entity not found
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Worker process error
    #[error("Worker error: {0}")]
    Worker(String),

    /// Operation exceeded its deadline
    #[error("Timeout after {0:?}")]
    Timeout(std::time::Duration),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP request error
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a not-found error
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Create an embedding error
    pub fn embedding(message: impl Into<String>) -> Self {
        Self::Embedding(message.into())
    }

    /// Create an LLM error
    pub fn llm(message: impl Into<String>) -> Self {
        Self::Llm(message.into())
    }

    /// Create a storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Whether a task failing with this error is worth retrying.
    ///
    /// Unsupported inputs and missing entities fail the same way every time.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Error::UnsupportedFileType(_) | Error::NotFound { .. } | Error::Config(_)
        )
    }
}
