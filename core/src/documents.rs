//! Document registry: id → url, unpartitioned.
//!
//! Rows carry a [`DocumentState`]. A `Pending` row was written ahead of its
//! postings and stays invisible to reads until it is marked `Indexed`.

use crate::error::{IndexError, Result};
use crate::index::{decode_id, encode_id, DocId, DocumentRecord, DocumentState};
use std::path::Path;
use tracing::debug;

#[derive(Clone)]
pub struct DocumentStore {
    db: sled::Db,
    rows: sled::Tree,
}

impl DocumentStore {
    pub fn open(path: &Path) -> Result<Self> {
        let db = sled::open(path)?;
        let rows = db.open_tree("documents")?;
        Ok(Self { db, rows })
    }

    /// Inserts an indexed row. Fails with `DuplicateKey` on an existing id.
    pub fn insert(&self, id: DocId, url: &str) -> Result<()> {
        self.insert_with_state(id, url, DocumentState::Indexed)
    }

    pub fn insert_with_state(&self, id: DocId, url: &str, state: DocumentState) -> Result<()> {
        let record = DocumentRecord { url: url.to_string(), state };
        let bytes = bincode::serialize(&record)?;
        match self.rows.compare_and_swap(encode_id(id), None as Option<&[u8]>, Some(bytes))? {
            Ok(()) => {
                debug!(doc_id = id, url, ?state, "document inserted");
                Ok(())
            }
            Err(_) => Err(IndexError::duplicate_document(id)),
        }
    }

    pub fn get(&self, id: DocId) -> Result<Option<DocumentRecord>> {
        match self.rows.get(encode_id(id))? {
            Some(raw) => Ok(Some(bincode::deserialize(&raw)?)),
            None => Ok(None),
        }
    }

    /// Flips the exact `expected` row to `Indexed`. A row that is already
    /// the indexed form of `expected` is accepted; any other row is `Inconsistent`.
    pub fn mark_indexed_if(&self, id: DocId, expected: &DocumentRecord) -> Result<()> {
        let indexed = DocumentRecord { url: expected.url.clone(), state: DocumentState::Indexed };
        let old = bincode::serialize(expected)?;
        let new = bincode::serialize(&indexed)?;
        match self.rows.compare_and_swap(encode_id(id), Some(old), Some(new))? {
            Ok(()) => Ok(()),
            Err(_) if self.get(id)?.as_ref() == Some(&indexed) => Ok(()),
            Err(_) => Err(IndexError::Inconsistent(format!("document {id} changed while being indexed"))),
        }
    }

    /// Removes the row only if it still equals `expected`.
    pub fn remove_if(&self, id: DocId, expected: &DocumentRecord) -> Result<bool> {
        let old = bincode::serialize(expected)?;
        Ok(self.rows.compare_and_swap(encode_id(id), Some(old), None as Option<Vec<u8>>)?.is_ok())
    }

    /// Urls for the given ids, in request order. Unknown and pending ids are skipped.
    pub fn get_by_ids(&self, ids: &[DocId]) -> Result<Vec<String>> {
        let mut urls = Vec::with_capacity(ids.len());
        for &id in ids {
            if let Some(record) = self.get(id)? {
                if record.state == DocumentState::Indexed {
                    urls.push(record.url);
                }
            }
        }
        Ok(urls)
    }

    pub fn contains_indexed(&self, id: DocId) -> Result<bool> {
        Ok(matches!(self.get(id)?, Some(r) if r.state == DocumentState::Indexed))
    }

    pub fn pending_rows(&self) -> Result<Vec<(DocId, DocumentRecord)>> {
        let mut out = Vec::new();
        for item in self.rows.iter() {
            let (k, v) = item?;
            let record: DocumentRecord = bincode::deserialize(&v)?;
            if record.state == DocumentState::Pending {
                let id = decode_id(&k).ok_or_else(|| IndexError::Inconsistent("malformed document key".into()))?;
                out.push((id, record));
            }
        }
        Ok(out)
    }

    pub fn pending_ids(&self) -> Result<Vec<DocId>> {
        Ok(self.pending_rows()?.into_iter().map(|(id, _)| id).collect())
    }

    /// One past the highest stored id, or 0 when empty.
    pub fn next_id(&self) -> Result<DocId> {
        match self.rows.last()? {
            Some((k, _)) => {
                let last = decode_id(&k).ok_or_else(|| IndexError::Inconsistent("malformed document key".into()))?;
                last.checked_add(1)
                    .ok_or_else(|| IndexError::Inconsistent("document id space exhausted".into()))
            }
            None => Ok(0),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn clear(&self) -> Result<()> {
        self.rows.clear()?;
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}
