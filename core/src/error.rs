//! Error taxonomy shared by every store and the service facade.

use crate::index::{DocId, WordId};
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, IndexError>;

#[derive(Debug, Error)]
pub enum IndexError {
    /// Expected absence of a word or document.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// Connectivity or timeout failure; safe to retry for idempotent operations.
    #[error("transient failure in {op}: {reason}")]
    Transient { op: &'static str, reason: String },

    /// Stored data violates an index invariant.
    #[error("inconsistent index: {0}")]
    Inconsistent(String),

    #[error("schema is not created")]
    SchemaMissing,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("manifest error: {0}")]
    Manifest(String),

    #[error("worker failed: {0}")]
    Worker(String),
}

impl IndexError {
    pub fn word_not_found(word: &str) -> Self {
        IndexError::NotFound(format!("word {word:?}"))
    }

    pub fn duplicate_word(word: &str) -> Self {
        IndexError::DuplicateKey(format!("word {word:?}"))
    }

    pub fn duplicate_word_id(id: WordId) -> Self {
        IndexError::DuplicateKey(format!("word id {id}"))
    }

    pub fn duplicate_document(id: DocId) -> Self {
        IndexError::DuplicateKey(format!("document {id}"))
    }

    pub fn timeout(op: &'static str, after: Duration) -> Self {
        IndexError::Transient { op, reason: format!("timed out after {after:?}") }
    }

    /// Whether the failed operation may be retried with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            IndexError::Transient { .. } => true,
            IndexError::Storage(sled::Error::Io(_)) => true,
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, IndexError::NotFound(_))
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, IndexError::DuplicateKey(_))
    }
}

impl From<std::io::Error> for IndexError {
    fn from(e: std::io::Error) -> Self {
        IndexError::Manifest(e.to_string())
    }
}

impl From<serde_json::Error> for IndexError {
    fn from(e: serde_json::Error) -> Self {
        IndexError::Manifest(e.to_string())
    }
}
