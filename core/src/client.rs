//! Query-side client holding a local snapshot of the dictionary.

use crate::backend::IndexBackend;
use crate::error::{IndexError, Result};
use crate::index::{Dictionary, WordId};
use crate::tokenizer::tokenize;
use std::sync::Arc;
use tracing::debug;

/// A client can only be obtained through [`connect`](SearchClient::connect),
/// which takes the dictionary snapshot, so lookups never see an unpopulated cache.
pub struct SearchClient<B: IndexBackend> {
    backend: Arc<B>,
    words: Dictionary,
}

impl<B: IndexBackend> SearchClient<B> {
    pub async fn connect(backend: Arc<B>) -> Result<Self> {
        let words = backend.get_all_words().await?;
        debug!(words = words.len(), "dictionary snapshot taken");
        Ok(Self { backend, words })
    }

    /// Replaces the snapshot with the backend's current dictionary.
    pub async fn refresh(&mut self) -> Result<()> {
        self.words = self.backend.get_all_words().await?;
        debug!(words = self.words.len(), "dictionary snapshot refreshed");
        Ok(())
    }

    pub fn dictionary(&self) -> &Dictionary {
        &self.words
    }

    pub fn id_of(&self, word: &str) -> Result<WordId> {
        self.words.get(word).copied().ok_or_else(|| IndexError::word_not_found(word))
    }

    /// Urls of the documents matching `words`, best match first. Words absent
    /// from the snapshot are ignored; nothing known or nothing matching is an
    /// empty result.
    pub async fn search<S: AsRef<str>>(&self, words: &[S]) -> Result<Vec<String>> {
        let ids: Vec<WordId> = words.iter().filter_map(|w| self.id_of(w.as_ref()).ok()).collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let ranking = self.backend.get_ranked_documents(&ids).await?;
        if ranking.is_empty() {
            return Ok(Vec::new());
        }
        let doc_ids: Vec<_> = ranking.iter().map(|d| d.doc_id).collect();
        self.backend.get_document_urls(&doc_ids).await
    }

    /// Tokenizes free text and searches for the resulting words.
    pub async fn search_text(&self, query: &str) -> Result<Vec<String>> {
        self.search(tokenize(query).as_slice()).await
    }
}
