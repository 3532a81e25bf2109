//! Partitioned inverted index: a sharded word dictionary, a document
//! registry and a posting store, combined by [`IndexService`] into ranked
//! retrieval by count of distinct query words.

pub mod backend;
pub mod client;
pub mod config;
pub mod documents;
pub mod error;
pub mod index;
pub mod occurrences;
pub mod persist;
pub mod router;
pub mod service;
pub mod tokenizer;
pub mod words;
pub mod worker;

pub use backend::IndexBackend;
pub use client::SearchClient;
pub use config::{IndexConfig, RetryPolicy};
pub use error::{IndexError, Result};
pub use index::*;
pub use router::{ShardId, ShardRouter};
pub use service::IndexService;
