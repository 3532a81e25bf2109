//! Posting store of `(word id, doc id)` edges.
//!
//! Edges live in one tree keyed by `word_id ++ doc_id` with an empty value.
//! The postings of a word are therefore a contiguous key range, and writing
//! the same edge twice leaves a single edge behind.

use crate::error::{IndexError, Result};
use crate::index::{encode_id, DocId, Occurrence, RankedDoc, Ranking, WordId};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use tracing::debug;

#[derive(Clone)]
pub struct OccurrenceIndex {
    db: sled::Db,
    postings: sled::Tree,
}

impl OccurrenceIndex {
    pub fn open(path: &Path) -> Result<Self> {
        let db = sled::open(path)?;
        let postings = db.open_tree("postings")?;
        Ok(Self { db, postings })
    }

    /// Writes one edge per word id as a single atomic batch. Returns the
    /// number of edges that did not exist before.
    pub fn insert_many(&self, doc_id: DocId, word_ids: &BTreeSet<WordId>) -> Result<usize> {
        let mut batch = sled::Batch::default();
        let mut added = 0;
        for &word_id in word_ids {
            let key = Occurrence { word_id, doc_id }.key();
            if !self.postings.contains_key(key)? {
                added += 1;
            }
            batch.insert(&key[..], Vec::<u8>::new());
        }
        self.postings.apply_batch(batch)?;
        debug!(doc_id, words = word_ids.len(), added, "postings inserted");
        Ok(added)
    }

    pub fn remove_many(&self, doc_id: DocId, word_ids: &BTreeSet<WordId>) -> Result<()> {
        let mut batch = sled::Batch::default();
        for &word_id in word_ids {
            batch.remove(&Occurrence { word_id, doc_id }.key()[..]);
        }
        self.postings.apply_batch(batch)?;
        Ok(())
    }

    /// Removes every edge pointing at `doc_id`. Full scan; used by repair only.
    pub fn remove_document(&self, doc_id: DocId) -> Result<usize> {
        let mut batch = sled::Batch::default();
        let mut removed = 0;
        for occ in self.scan()? {
            if occ.doc_id == doc_id {
                batch.remove(&occ.key()[..]);
                removed += 1;
            }
        }
        self.postings.apply_batch(batch)?;
        Ok(removed)
    }

    pub fn postings_for(&self, word_id: WordId) -> Result<Vec<DocId>> {
        let mut docs = Vec::new();
        for item in self.postings.scan_prefix(encode_id(word_id)) {
            let (k, _) = item?;
            docs.push(decode_key(&k)?.doc_id);
        }
        Ok(docs)
    }

    /// Counts, per document, how many of the distinct `word_ids` it contains.
    /// Only the postings of the queried words are read.
    pub fn ranked_docs_for(&self, word_ids: &[WordId]) -> Result<Ranking> {
        let distinct: BTreeSet<WordId> = word_ids.iter().copied().collect();
        let mut acc: HashMap<DocId, u32> = HashMap::new();
        for word_id in distinct {
            for doc_id in self.postings_for(word_id)? {
                *acc.entry(doc_id).or_insert(0) += 1;
            }
        }
        Ok(rank(acc))
    }

    pub fn scan(&self) -> Result<Vec<Occurrence>> {
        let mut out = Vec::new();
        for item in self.postings.iter() {
            let (k, _) = item?;
            out.push(decode_key(&k)?);
        }
        Ok(out)
    }

    pub fn len(&self) -> usize {
        self.postings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.postings.is_empty()
    }

    pub fn clear(&self) -> Result<()> {
        self.postings.clear()?;
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

fn decode_key(key: &[u8]) -> Result<Occurrence> {
    Occurrence::from_key(key).ok_or_else(|| IndexError::Inconsistent(format!("malformed posting key of {} bytes", key.len())))
}

/// Orders by match count descending, then doc id ascending.
pub fn rank(acc: HashMap<DocId, u32>) -> Ranking {
    let mut ranking: Ranking = acc
        .into_iter()
        .map(|(doc_id, matches)| RankedDoc { doc_id, matches })
        .collect();
    ranking.sort_by(|a, b| b.matches.cmp(&a.matches).then(a.doc_id.cmp(&b.doc_id)));
    ranking
}
