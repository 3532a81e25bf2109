use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub type WordId = u32;
pub type DocId = u32;

/// A dictionary word mapping to its globally unique id.
pub type Dictionary = HashMap<String, WordId>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Word {
    pub id: WordId,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocId,
    pub url: String,
}

/// An edge recording that a word is present in a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Occurrence {
    pub word_id: WordId,
    pub doc_id: DocId,
}

impl Occurrence {
    /// Storage key: `word_id ++ doc_id`, both big-endian so postings of one word are contiguous.
    pub fn key(&self) -> [u8; 8] {
        let mut key = [0u8; 8];
        key[..4].copy_from_slice(&self.word_id.to_be_bytes());
        key[4..].copy_from_slice(&self.doc_id.to_be_bytes());
        key
    }

    pub fn from_key(key: &[u8]) -> Option<Self> {
        if key.len() != 8 {
            return None;
        }
        let word_id = decode_id(&key[..4])?;
        let doc_id = decode_id(&key[4..])?;
        Some(Self { word_id, doc_id })
    }
}

/// One entry of a ranking: a document and the number of distinct query words it contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankedDoc {
    pub doc_id: DocId,
    pub matches: u32,
}

/// Documents ordered by `matches` descending, ties by ascending `doc_id`.
pub type Ranking = Vec<RankedDoc>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentState {
    /// Row written, postings not yet confirmed. Invisible to reads.
    Pending,
    Indexed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub url: String,
    pub state: DocumentState,
}

/// Outcome of adding a document through the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Indexed { postings: usize },
    /// Same id and url were already indexed; nothing was written.
    AlreadyIndexed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    pub documents_removed: usize,
    pub postings_removed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub partitions: usize,
    pub words: usize,
    pub documents: usize,
    pub pending_documents: usize,
    pub occurrences: usize,
}

pub(crate) fn encode_id(id: u32) -> [u8; 4] {
    id.to_be_bytes()
}

pub(crate) fn decode_id(bytes: &[u8]) -> Option<u32> {
    let arr: [u8; 4] = bytes.try_into().ok()?;
    Some(u32::from_be_bytes(arr))
}
