//! Operations the index exposes to external collaborators such as a
//! transport layer or the [`SearchClient`](crate::client::SearchClient).
//!
//! Every call distinguishes success, an empty-but-valid answer (an empty
//! collection) and a typed [`IndexError`](crate::error::IndexError).

use crate::error::Result;
use crate::index::{DocId, Dictionary, Ranking, WordId};
use async_trait::async_trait;
use std::collections::BTreeSet;

#[async_trait]
pub trait IndexBackend: Send + Sync {
    /// `NotFound` for an unknown word.
    async fn get_word_id(&self, word: &str) -> Result<WordId>;

    /// The whole dictionary merged across partitions.
    async fn get_all_words(&self) -> Result<Dictionary>;

    async fn get_ranked_documents(&self, word_ids: &[WordId]) -> Result<Ranking>;

    /// Urls in request order; unknown ids are omitted.
    async fn get_document_urls(&self, doc_ids: &[DocId]) -> Result<Vec<String>>;

    async fn insert_document(&self, id: DocId, url: &str) -> Result<()>;

    /// Returns the number of words newly written.
    async fn insert_words(&self, words: &Dictionary) -> Result<usize>;

    /// Returns the number of edges newly written.
    async fn insert_occurrences(&self, doc_id: DocId, word_ids: &BTreeSet<WordId>) -> Result<usize>;

    async fn recreate_schema(&self) -> Result<()>;

    async fn delete_schema(&self) -> Result<()>;
}
