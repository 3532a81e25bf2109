//! Partitioned word dictionary.
//!
//! Each partition is its own sled database holding two trees, `words`
//! (text → id) and `word_ids` (id → text), kept in step by a transaction.

use crate::error::{IndexError, Result};
use crate::index::{decode_id, encode_id, Dictionary, WordId};
use crate::persist::IndexPaths;
use crate::router::{ShardId, ShardRouter};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::Transactional;
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

#[derive(Clone)]
pub struct WordPartition {
    shard: ShardId,
    db: sled::Db,
    by_word: sled::Tree,
    by_id: sled::Tree,
}

impl WordPartition {
    pub fn open(path: &Path, shard: ShardId) -> Result<Self> {
        let db = sled::open(path)?;
        let by_word = db.open_tree("words")?;
        let by_id = db.open_tree("word_ids")?;
        Ok(Self { shard, db, by_word, by_id })
    }

    pub fn shard(&self) -> ShardId {
        self.shard
    }

    /// Strict insert: fails with `DuplicateKey` if the word or the id already exists here.
    pub fn insert(&self, word: &str, id: WordId) -> Result<()> {
        let res = (&self.by_word, &self.by_id).transaction(|(by_word, by_id)| {
            if by_word.get(word.as_bytes())?.is_some() {
                return Err(ConflictableTransactionError::Abort(IndexError::duplicate_word(word)));
            }
            if by_id.get(encode_id(id))?.is_some() {
                return Err(ConflictableTransactionError::Abort(IndexError::duplicate_word_id(id)));
            }
            by_word.insert(word.as_bytes(), &encode_id(id)[..])?;
            by_id.insert(&encode_id(id)[..], word.as_bytes())?;
            Ok(())
        });
        match res {
            Ok(()) => {
                debug!(shard = %self.shard, word, id, "word inserted");
                Ok(())
            }
            Err(TransactionError::Abort(e)) => Err(e),
            Err(TransactionError::Storage(e)) => Err(e.into()),
        }
    }

    /// Like [`insert`](Self::insert) but an identical existing pair is
    /// accepted. Returns whether anything was written.
    pub fn register(&self, word: &str, id: WordId) -> Result<bool> {
        match self.insert(word, id) {
            Ok(()) => Ok(true),
            Err(e) if e.is_duplicate() => match self.lookup(word) {
                Ok(existing) if existing == id => Ok(false),
                _ => Err(e),
            },
            Err(e) => Err(e),
        }
    }

    pub fn lookup(&self, word: &str) -> Result<WordId> {
        match self.by_word.get(word.as_bytes())? {
            Some(raw) => decode_id(&raw).ok_or_else(|| {
                IndexError::Inconsistent(format!("malformed id stored for word {word:?} on {}", self.shard))
            }),
            None => Err(IndexError::word_not_found(word)),
        }
    }

    /// The word holding `id` on this partition, if any.
    pub fn id_owner(&self, id: WordId) -> Result<Option<String>> {
        match self.by_id.get(encode_id(id))? {
            Some(raw) => String::from_utf8(raw.to_vec())
                .map(Some)
                .map_err(|_| IndexError::Inconsistent(format!("non-utf8 word for id {id} on {}", self.shard))),
            None => Ok(None),
        }
    }

    pub fn contains_id(&self, id: WordId) -> Result<bool> {
        Ok(self.by_id.contains_key(encode_id(id))?)
    }

    pub fn entries(&self) -> Result<Vec<(String, WordId)>> {
        let mut out = Vec::with_capacity(self.by_word.len());
        for item in self.by_word.iter() {
            let (k, v) = item?;
            let word = String::from_utf8(k.to_vec())
                .map_err(|_| IndexError::Inconsistent(format!("non-utf8 word on {}", self.shard)))?;
            let id = decode_id(&v)
                .ok_or_else(|| IndexError::Inconsistent(format!("malformed id for {word:?} on {}", self.shard)))?;
            out.push((word, id));
        }
        Ok(out)
    }

    pub fn len(&self) -> usize {
        self.by_word.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_word.is_empty()
    }

    pub fn clear(&self) -> Result<()> {
        self.by_word.clear()?;
        self.by_id.clear()?;
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

/// Merges per-partition listings into one dictionary. An id seen under two
/// different words, or a word seen on two partitions, is `Inconsistent`.
pub fn merge_partitions<I>(listings: I) -> Result<Dictionary>
where
    I: IntoIterator<Item = (ShardId, Vec<(String, WordId)>)>,
{
    let mut dict = Dictionary::new();
    let mut owners: HashMap<WordId, (ShardId, String)> = HashMap::new();
    for (shard, entries) in listings {
        for (word, id) in entries {
            if let Some((other_shard, other_word)) = owners.get(&id) {
                return Err(IndexError::Inconsistent(format!(
                    "word id {id} assigned to {other_word:?} on {other_shard} and {word:?} on {shard}"
                )));
            }
            if dict.contains_key(&word) {
                return Err(IndexError::Inconsistent(format!("word {word:?} stored on more than one partition")));
            }
            owners.insert(id, (shard, word.clone()));
            dict.insert(word, id);
        }
    }
    Ok(dict)
}

/// Synchronous view over every partition, routing by [`ShardRouter`].
#[derive(Clone)]
pub struct WordStore {
    router: ShardRouter,
    partitions: Vec<WordPartition>,
}

impl WordStore {
    pub fn open(paths: &IndexPaths, router: ShardRouter) -> Result<Self> {
        let partitions = router
            .all_shards()
            .map(|shard| WordPartition::open(&paths.word_partition(shard.0), shard))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { router, partitions })
    }

    pub fn router(&self) -> &ShardRouter {
        &self.router
    }

    pub fn partition_for(&self, word: &str) -> &WordPartition {
        &self.partitions[self.router.shard_for(word).0]
    }

    pub fn partitions(&self) -> &[WordPartition] {
        &self.partitions
    }

    pub fn insert(&self, word: &str, id: WordId) -> Result<()> {
        self.partition_for(word).insert(word, id)
    }

    pub fn lookup(&self, word: &str) -> Result<WordId> {
        self.partition_for(word).lookup(word)
    }

    pub fn enumerate_all(&self) -> Result<Dictionary> {
        let listings = self
            .partitions
            .iter()
            .map(|p| p.entries().map(|e| (p.shard(), e)))
            .collect::<Result<Vec<_>>>()?;
        merge_partitions(listings)
    }

    pub fn len(&self) -> usize {
        self.partitions.iter().map(WordPartition::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.iter().all(WordPartition::is_empty)
    }
}
