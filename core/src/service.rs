//! Index facade: schema lifecycle, ingestion and query resolution over the
//! partitioned word store, the document store and the occurrence index.
//!
//! Every store call runs on the blocking pool under the configured timeout.
//! Reads that overrun it are abandoned; writes that overrun it are awaited
//! before the `Transient` error is returned, so nothing lands after the
//! caller has moved on. Calls that are safe to repeat are retried on
//! transient failure; the document insert is not, its id acting as the
//! de-duplication key.

use crate::backend::IndexBackend;
use crate::config::IndexConfig;
use crate::documents::DocumentStore;
use crate::error::{IndexError, Result};
use crate::index::{
    AddOutcome, DocId, Dictionary, DocumentRecord, DocumentState, Ranking, RepairReport, Stats, WordId,
};
use crate::occurrences::OccurrenceIndex;
use crate::persist::{load_or_init_meta, save_meta, IndexPaths, MetaFile};
use crate::router::ShardRouter;
use crate::words::{merge_partitions, WordPartition, WordStore};
use crate::worker::{run_blocking, run_blocking_settled, with_retry};
use async_trait::async_trait;
use futures::future::try_join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct IndexService {
    config: IndexConfig,
    paths: IndexPaths,
    meta: RwLock<MetaFile>,
    words: WordStore,
    documents: DocumentStore,
    occurrences: OccurrenceIndex,
    /// Held shared by writers, exclusively by schema create/drop.
    schema_gate: tokio::sync::RwLock<()>,
    /// Serializes the check-then-write of word registration.
    registration: tokio::sync::Mutex<()>,
    /// Documents currently being written or repaired.
    in_flight: Mutex<HashSet<DocId>>,
    #[cfg(test)]
    edge_delay: Mutex<Option<Duration>>,
}

#[derive(Debug, Clone, Copy)]
enum Dispatch {
    Read,
    Write,
}

/// Document ids reserved by one operation; released on drop.
struct Claim<'a> {
    in_flight: &'a Mutex<HashSet<DocId>>,
    ids: Vec<DocId>,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        let mut set = self.in_flight.lock();
        for id in &self.ids {
            set.remove(id);
        }
    }
}

impl IndexService {
    /// Opens (or creates) the index rooted at `config.root`.
    pub async fn open(config: IndexConfig) -> Result<Self> {
        config.validate()?;
        let router = ShardRouter::new(config.partitions)?;
        let paths = IndexPaths::new(&config.root);
        let p = paths.clone();
        let partitions = config.partitions;
        let (meta, words, documents, occurrences) = run_blocking_settled("open", config.op_timeout(), move || {
            let meta = load_or_init_meta(&p, partitions)?;
            let words = WordStore::open(&p, router)?;
            let documents = DocumentStore::open(&p.documents())?;
            let occurrences = OccurrenceIndex::open(&p.occurrences())?;
            Ok((meta, words, documents, occurrences))
        })
        .await?;
        info!(root = %paths.root.display(), partitions, schema_ready = meta.schema_ready, "index opened");
        Ok(Self {
            config,
            paths,
            meta: RwLock::new(meta),
            words,
            documents,
            occurrences,
            schema_gate: tokio::sync::RwLock::new(()),
            registration: tokio::sync::Mutex::new(()),
            in_flight: Mutex::new(HashSet::new()),
            #[cfg(test)]
            edge_delay: Mutex::new(None),
        })
    }

    /// Flushes every store and releases the index.
    pub async fn close(self) -> Result<()> {
        self.fan_out("close", Dispatch::Write, |p| p.flush()).await?;
        let documents = self.documents.clone();
        let occurrences = self.occurrences.clone();
        self.write_once("close", move || {
            documents.flush()?;
            occurrences.flush()
        })
        .await?;
        info!(root = %self.paths.root.display(), "index closed");
        Ok(())
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    pub fn router(&self) -> &ShardRouter {
        self.words.router()
    }

    pub fn schema_ready(&self) -> bool {
        self.meta.read().schema_ready
    }

    fn ensure_schema(&self) -> Result<()> {
        if self.schema_ready() { Ok(()) } else { Err(IndexError::SchemaMissing) }
    }

    async fn set_schema_ready(&self, ready: bool) -> Result<()> {
        let mut meta = self.meta.read().clone();
        if meta.schema_ready == ready {
            return Ok(());
        }
        meta.schema_ready = ready;
        let paths = self.paths.clone();
        let saved = meta.clone();
        self.idempotent_write("manifest", move || save_meta(&paths, &saved)).await?;
        *self.meta.write() = meta;
        Ok(())
    }

    fn claim(&self, op: &'static str, id: DocId) -> Result<Claim<'_>> {
        if !self.in_flight.lock().insert(id) {
            return Err(IndexError::Transient { op, reason: format!("document {id} is already being written") });
        }
        Ok(Claim { in_flight: &self.in_flight, ids: vec![id] })
    }

    /// Claims the ids nobody else holds; the rest are left out of the claim.
    fn claim_free(&self, ids: impl IntoIterator<Item = DocId>) -> Claim<'_> {
        let mut set = self.in_flight.lock();
        let ids = ids.into_iter().filter(|id| set.insert(*id)).collect();
        drop(set);
        Claim { in_flight: &self.in_flight, ids }
    }

    // --- schema lifecycle ---

    /// Marks every store ready for use. Existing data is kept.
    pub async fn create_schema(&self) -> Result<()> {
        let _gate = self.schema_gate.write().await;
        self.set_schema_ready(true).await?;
        info!(partitions = self.config.partitions, "schema created");
        Ok(())
    }

    /// Waits for in-flight writers, marks the schema absent, then empties
    /// every partition and store.
    pub async fn drop_schema(&self) -> Result<()> {
        let _gate = self.schema_gate.write().await;
        self.set_schema_ready(false).await?;
        let documents = self.documents.clone();
        let occurrences = self.occurrences.clone();
        let stores = self.idempotent_write("drop_schema", move || {
            occurrences.clear()?;
            documents.clear()
        });
        let partitions = self.fan_out("drop_schema", Dispatch::Write, |p| p.clear());
        futures::try_join!(stores, partitions)?;
        info!("schema dropped");
        Ok(())
    }

    pub async fn recreate_schema(&self) -> Result<()> {
        self.drop_schema().await?;
        self.create_schema().await
    }

    // --- ingestion ---

    /// Writes a pre-assigned dictionary into the partitions.
    ///
    /// Pairs already present with the same id are skipped. The whole call is
    /// refused with `DuplicateKey`, before anything is written, if two words
    /// of `words` share an id, or if a word or an id is already stored with a
    /// different partner on any partition.
    pub async fn register_words(&self, words: &Dictionary) -> Result<usize> {
        let _gate = self.schema_gate.read().await;
        self.ensure_schema()?;
        let mut owners: HashMap<WordId, &str> = HashMap::with_capacity(words.len());
        for (word, &id) in words {
            if let Some(other) = owners.insert(id, word.as_str()) {
                return Err(IndexError::DuplicateKey(format!("word id {id} given to both {other:?} and {word:?}")));
            }
        }

        let _registration = self.registration.lock().await;
        let router = *self.words.router();
        let pairs: Vec<(String, WordId)> = words.iter().map(|(w, &id)| (w.clone(), id)).collect();
        let conflicts = self
            .fan_out_batches("check_words", Dispatch::Read, vec![pairs; router.partitions()], move |p, pairs| {
                let mut conflicts = Vec::new();
                for (word, id) in pairs {
                    if let Some(owner) = p.id_owner(id)? {
                        if owner != word {
                            conflicts.push(format!("word id {id} already assigned to {owner:?}, requested for {word:?}"));
                        }
                    }
                    if router.shard_for(&word) == p.shard() {
                        match p.lookup(&word) {
                            Ok(existing) if existing != id => {
                                conflicts.push(format!("word {word:?} already has id {existing}, requested {id}"));
                            }
                            Ok(_) => {}
                            Err(e) if e.is_not_found() => {}
                            Err(e) => return Err(e),
                        }
                    }
                }
                Ok(conflicts)
            })
            .await?;
        if let Some(conflict) = conflicts.into_iter().flatten().next() {
            return Err(IndexError::DuplicateKey(conflict));
        }

        let mut batches: Vec<Vec<(String, WordId)>> = vec![Vec::new(); router.partitions()];
        for (word, &id) in words {
            batches[router.shard_for(word).0].push((word.clone(), id));
        }
        let written = self
            .fan_out_batches("register_words", Dispatch::Write, batches, |p, batch| {
                let mut written = 0;
                for (word, id) in batch {
                    if p.register(&word, id)? {
                        written += 1;
                    }
                }
                Ok(written)
            })
            .await?;
        let written = written.into_iter().sum();
        debug!(requested = words.len(), written, "words registered");
        Ok(written)
    }

    /// Fails with `Inconsistent` unless every id is stored on some partition.
    async fn ensure_word_ids(&self, word_ids: &BTreeSet<WordId>) -> Result<()> {
        if word_ids.is_empty() {
            return Ok(());
        }
        let wanted: Vec<WordId> = word_ids.iter().copied().collect();
        let found = self
            .fan_out_batches("check_word_ids", Dispatch::Read, vec![wanted; self.words.partitions().len()], |p, ids| {
                let mut found = Vec::new();
                for id in ids {
                    if p.contains_id(id)? {
                        found.push(id);
                    }
                }
                Ok(found)
            })
            .await?;
        let found: HashSet<WordId> = found.into_iter().flatten().collect();
        let missing: Vec<WordId> = word_ids.iter().copied().filter(|id| !found.contains(id)).collect();
        if missing.is_empty() {
            return Ok(());
        }
        Err(IndexError::Inconsistent(format!(
            "postings reference {} unknown word ids, first {:?}",
            missing.len(),
            &missing[..missing.len().min(8)]
        )))
    }

    /// Adds a document and its postings as one logical unit.
    ///
    /// The row is written `Pending` first, then the edges, then the row is
    /// flipped to `Indexed`. If the edges fail the attempted edges and the row
    /// are removed again; if that also fails the row stays `Pending`, hidden
    /// from reads, until [`repair`](Self::repair). Repeating a call that
    /// already succeeded returns [`AddOutcome::AlreadyIndexed`]; repeating one
    /// that left a `Pending` row resumes it. A call for an id that another
    /// call is still writing fails with `Transient`.
    pub async fn add_document(&self, id: DocId, url: &str, word_ids: &BTreeSet<WordId>) -> Result<AddOutcome> {
        let _gate = self.schema_gate.read().await;
        self.ensure_schema()?;
        let _claim = self.claim("add_document", id)?;
        self.ensure_word_ids(word_ids).await?;

        let pending = DocumentRecord { url: url.to_string(), state: DocumentState::Pending };
        let documents = self.documents.clone();
        let row_url = url.to_string();
        let inserted = self
            .write_once("insert_document", move || documents.insert_with_state(id, &row_url, DocumentState::Pending))
            .await;
        match inserted {
            Ok(()) => {}
            Err(e) if e.is_duplicate() => {
                let documents = self.documents.clone();
                let existing = self.idempotent("get_document", move || documents.get(id)).await?;
                match existing {
                    Some(row) if row.url == url && row.state == DocumentState::Indexed => {
                        debug!(doc_id = id, "document already indexed");
                        return Ok(AddOutcome::AlreadyIndexed);
                    }
                    Some(row) if row == pending => {
                        info!(doc_id = id, "resuming pending document");
                    }
                    _ => return Err(e),
                }
            }
            Err(e) => return Err(e),
        }

        let postings = match self.write_edges(id, word_ids).await {
            Ok(added) => added,
            Err(e) => {
                self.compensate(id, &pending, word_ids).await;
                return Err(e);
            }
        };

        let documents = self.documents.clone();
        let expected = pending.clone();
        match self.idempotent_write("mark_indexed", move || documents.mark_indexed_if(id, &expected)).await {
            Ok(()) => {}
            Err(e @ IndexError::Inconsistent(_)) => {
                self.compensate(id, &pending, word_ids).await;
                return Err(e);
            }
            Err(e) => {
                warn!(doc_id = id, error = %e, "document left pending");
                return Err(e);
            }
        }
        debug!(doc_id = id, url, postings, "document indexed");
        Ok(AddOutcome::Indexed { postings })
    }

    async fn write_edges(&self, id: DocId, word_ids: &BTreeSet<WordId>) -> Result<usize> {
        let occurrences = self.occurrences.clone();
        let word_ids = word_ids.clone();
        let delay = self.edge_delay();
        self.idempotent_write("insert_occurrences", move || {
            if let Some(delay) = delay {
                std::thread::sleep(delay);
            }
            occurrences.insert_many(id, &word_ids)
        })
        .await
    }

    #[cfg(test)]
    fn edge_delay(&self) -> Option<Duration> {
        *self.edge_delay.lock()
    }

    #[cfg(not(test))]
    fn edge_delay(&self) -> Option<Duration> {
        None
    }

    #[cfg(test)]
    fn set_edge_delay(&self, delay: Option<Duration>) {
        *self.edge_delay.lock() = delay;
    }

    /// Removes the edges written for `id`, then the row if it is still `pending`.
    async fn compensate(&self, id: DocId, pending: &DocumentRecord, word_ids: &BTreeSet<WordId>) {
        let occurrences = self.occurrences.clone();
        let documents = self.documents.clone();
        let word_ids = word_ids.clone();
        let pending = pending.clone();
        let undo = self
            .idempotent_write("compensate", move || {
                occurrences.remove_many(id, &word_ids)?;
                documents.remove_if(id, &pending)
            })
            .await;
        match undo {
            Ok(true) => warn!(doc_id = id, "postings failed, document rolled back"),
            Ok(false) => warn!(doc_id = id, "postings rolled back, document row had already changed"),
            Err(e) => warn!(doc_id = id, error = %e, "rollback failed, document left pending for repair"),
        }
    }

    /// Removes `Pending` documents and every edge pointing at them. Documents
    /// another call is still writing are skipped.
    pub async fn repair(&self) -> Result<RepairReport> {
        let _gate = self.schema_gate.read().await;
        self.ensure_schema()?;
        let documents = self.documents.clone();
        let pending = self.idempotent("pending_documents", move || documents.pending_rows()).await?;
        let claim = self.claim_free(pending.iter().map(|(id, _)| *id));
        let rows: Vec<(DocId, DocumentRecord)> =
            pending.into_iter().filter(|(id, _)| claim.ids.contains(id)).collect();

        let documents = self.documents.clone();
        let occurrences = self.occurrences.clone();
        let report = self
            .idempotent_write("repair", move || {
                let mut report = RepairReport::default();
                for (id, row) in &rows {
                    report.postings_removed += occurrences.remove_document(*id)?;
                    if documents.remove_if(*id, row)? {
                        report.documents_removed += 1;
                    }
                }
                Ok(report)
            })
            .await?;
        drop(claim);
        if report.documents_removed > 0 {
            warn!(documents = report.documents_removed, postings = report.postings_removed, "repaired pending documents");
        }
        Ok(report)
    }

    // --- queries ---

    pub async fn lookup(&self, word: &str) -> Result<WordId> {
        self.ensure_schema()?;
        let partition = self.words.partition_for(word).clone();
        let word = word.to_string();
        self.idempotent("lookup", move || partition.lookup(&word)).await
    }

    /// Ids of the known words, in input order. Unknown words are skipped.
    pub async fn word_ids_of(&self, words: &[String]) -> Result<Vec<WordId>> {
        self.ensure_schema()?;
        let router = *self.words.router();
        let mut batches: Vec<Vec<(usize, String)>> = vec![Vec::new(); router.partitions()];
        for (pos, word) in words.iter().enumerate() {
            batches[router.shard_for(word).0].push((pos, word.clone()));
        }
        let found = self
            .fan_out_batches("word_ids_of", Dispatch::Read, batches, |p, batch| {
                let mut found = Vec::with_capacity(batch.len());
                for (pos, word) in batch {
                    match p.lookup(&word) {
                        Ok(id) => found.push((pos, id)),
                        Err(e) if e.is_not_found() => {}
                        Err(e) => return Err(e),
                    }
                }
                Ok(found)
            })
            .await?;
        let mut found: Vec<(usize, WordId)> = found.into_iter().flatten().collect();
        found.sort_unstable_by_key(|&(pos, _)| pos);
        Ok(found.into_iter().map(|(_, id)| id).collect())
    }

    pub async fn enumerate_all(&self) -> Result<Dictionary> {
        self.ensure_schema()?;
        let listings = self
            .fan_out("enumerate_all", Dispatch::Read, |p| Ok((p.shard(), p.entries()?)))
            .await?;
        merge_partitions(listings)
    }

    pub async fn ranked_docs_for(&self, word_ids: &[WordId]) -> Result<Ranking> {
        self.ensure_schema()?;
        if word_ids.is_empty() {
            return Ok(Ranking::new());
        }
        let occurrences = self.occurrences.clone();
        let word_ids = word_ids.to_vec();
        self.idempotent("ranked_docs_for", move || occurrences.ranked_docs_for(&word_ids)).await
    }

    pub async fn document_urls(&self, doc_ids: &[DocId]) -> Result<Vec<String>> {
        self.ensure_schema()?;
        if doc_ids.is_empty() {
            return Ok(Vec::new());
        }
        let documents = self.documents.clone();
        let doc_ids = doc_ids.to_vec();
        self.idempotent("document_urls", move || documents.get_by_ids(&doc_ids)).await
    }

    /// Word lookup, ranking and url hydration in one call. Urls keep rank order.
    pub async fn search(&self, words: &[String]) -> Result<Vec<String>> {
        let ids = self.word_ids_of(words).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let ranking = self.ranked_docs_for(&ids).await?;
        let doc_ids: Vec<DocId> = ranking.iter().map(|d| d.doc_id).collect();
        self.document_urls(&doc_ids).await
    }

    // --- id space and maintenance ---

    pub async fn next_document_id(&self) -> Result<DocId> {
        self.ensure_schema()?;
        let documents = self.documents.clone();
        self.idempotent("next_document_id", move || documents.next_id()).await
    }

    /// One past the highest word id in the dictionary, or 0 when empty.
    pub async fn next_word_id(&self) -> Result<WordId> {
        let dict = self.enumerate_all().await?;
        match dict.values().max() {
            Some(&max) => max
                .checked_add(1)
                .ok_or_else(|| IndexError::Inconsistent("word id space exhausted".into())),
            None => Ok(0),
        }
    }

    /// Checks that every edge references a known word and an indexed document.
    pub async fn verify(&self) -> Result<()> {
        let known: HashSet<WordId> = self.enumerate_all().await?.into_values().collect();
        let documents = self.documents.clone();
        let occurrences = self.occurrences.clone();
        self.idempotent("verify", move || {
            let mut checked_docs: HashSet<DocId> = HashSet::new();
            for occ in occurrences.scan()? {
                if !known.contains(&occ.word_id) {
                    return Err(IndexError::Inconsistent(format!(
                        "posting ({}, {}) references unknown word id",
                        occ.word_id, occ.doc_id
                    )));
                }
                if checked_docs.insert(occ.doc_id) && !documents.contains_indexed(occ.doc_id)? {
                    return Err(IndexError::Inconsistent(format!(
                        "posting ({}, {}) references missing or pending document",
                        occ.word_id, occ.doc_id
                    )));
                }
            }
            Ok(())
        })
        .await
    }

    pub async fn stats(&self) -> Result<Stats> {
        let words: usize = self
            .fan_out("stats", Dispatch::Read, |p| Ok(p.len()))
            .await?
            .into_iter()
            .sum();
        let documents = self.documents.clone();
        let occurrences = self.occurrences.clone();
        let (docs, pending, edges) = self
            .idempotent("stats", move || {
                Ok((documents.len(), documents.pending_ids()?.len(), occurrences.len()))
            })
            .await?;
        Ok(Stats {
            partitions: self.config.partitions,
            words,
            documents: docs.saturating_sub(pending),
            pending_documents: pending,
            occurrences: edges,
        })
    }

    // --- dispatch helpers ---

    /// A write that is not retried.
    async fn write_once<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        run_blocking_settled(op, self.config.op_timeout(), f).await
    }

    /// A read, retried on transient failure.
    async fn idempotent<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: Fn() -> Result<T> + Clone + Send + Sync + 'static,
    {
        let timeout = self.config.op_timeout();
        with_retry(op, &self.config.retry, || run_blocking(op, timeout, f.clone())).await
    }

    /// A repeatable write, retried on transient failure once the previous attempt has settled.
    async fn idempotent_write<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: Fn() -> Result<T> + Clone + Send + Sync + 'static,
    {
        let timeout = self.config.op_timeout();
        with_retry(op, &self.config.retry, || run_blocking_settled(op, timeout, f.clone())).await
    }

    async fn fan_out<T, F>(&self, op: &'static str, dispatch: Dispatch, f: F) -> Result<Vec<T>>
    where
        T: Send + 'static,
        F: Fn(&WordPartition) -> Result<T> + Clone + Send + Sync + 'static,
    {
        let units = vec![(); self.words.partitions().len()];
        self.fan_out_batches(op, dispatch, units, move |p, ()| f(p)).await
    }

    /// Runs `f` on every partition concurrently, each with its own batch.
    async fn fan_out_batches<B, T, F>(&self, op: &'static str, dispatch: Dispatch, batches: Vec<B>, f: F) -> Result<Vec<T>>
    where
        B: Clone + Send + Sync + 'static,
        T: Send + 'static,
        F: Fn(&WordPartition, B) -> Result<T> + Clone + Send + Sync + 'static,
    {
        let timeout = self.config.op_timeout();
        let retry = &self.config.retry;
        let tasks = self.words.partitions().iter().cloned().zip(batches).map(|(partition, batch)| {
            let f = f.clone();
            with_retry(op, retry, move || {
                let (f, partition, batch) = (f.clone(), partition.clone(), batch.clone());
                let call = move || f(&partition, batch);
                async move {
                    match dispatch {
                        Dispatch::Read => run_blocking(op, timeout, call).await,
                        Dispatch::Write => run_blocking_settled(op, timeout, call).await,
                    }
                }
            })
        });
        try_join_all(tasks).await
    }
}

#[async_trait]
impl IndexBackend for IndexService {
    async fn get_word_id(&self, word: &str) -> Result<WordId> {
        self.lookup(word).await
    }

    async fn get_all_words(&self) -> Result<Dictionary> {
        self.enumerate_all().await
    }

    async fn get_ranked_documents(&self, word_ids: &[WordId]) -> Result<Ranking> {
        self.ranked_docs_for(word_ids).await
    }

    async fn get_document_urls(&self, doc_ids: &[DocId]) -> Result<Vec<String>> {
        self.document_urls(doc_ids).await
    }

    async fn insert_document(&self, id: DocId, url: &str) -> Result<()> {
        let _gate = self.schema_gate.read().await;
        self.ensure_schema()?;
        let _claim = self.claim("insert_document", id)?;
        let documents = self.documents.clone();
        let url = url.to_string();
        self.write_once("insert_document", move || documents.insert(id, &url)).await
    }

    async fn insert_words(&self, words: &Dictionary) -> Result<usize> {
        self.register_words(words).await
    }

    /// Edges for a document that is not stored, or for word ids that are not
    /// in the dictionary, are refused as `Inconsistent`.
    async fn insert_occurrences(&self, doc_id: DocId, word_ids: &BTreeSet<WordId>) -> Result<usize> {
        let _gate = self.schema_gate.read().await;
        self.ensure_schema()?;
        let _claim = self.claim("insert_occurrences", doc_id)?;
        let documents = self.documents.clone();
        if self.idempotent("get_document", move || documents.get(doc_id)).await?.is_none() {
            return Err(IndexError::Inconsistent(format!("postings for unknown document {doc_id}")));
        }
        self.ensure_word_ids(word_ids).await?;
        self.write_edges(doc_id, word_ids).await
    }

    async fn recreate_schema(&self) -> Result<()> {
        IndexService::recreate_schema(self).await
    }

    async fn delete_schema(&self) -> Result<()> {
        self.drop_schema().await
    }
}
