use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tempfile::{tempdir, TempDir};
use wordindex_core::documents::DocumentStore;
use wordindex_core::persist::IndexPaths;
use wordindex_core::{
    AddOutcome, DocId, DocumentState, IndexBackend, IndexConfig, IndexError, IndexService, RankedDoc,
    RetryPolicy, SearchClient, WordId,
};

fn config(dir: &TempDir, partitions: usize) -> IndexConfig {
    IndexConfig::new(dir.path())
        .with_partitions(partitions)
        .with_timeout(Duration::from_secs(10))
        .with_retry(RetryPolicy { attempts: 2, base_delay_ms: 5 })
}

async fn open(dir: &TempDir, partitions: usize) -> IndexService {
    let service = IndexService::open(config(dir, partitions)).await.unwrap();
    service.create_schema().await.unwrap();
    service
}

fn ids(ids: &[WordId]) -> BTreeSet<WordId> {
    ids.iter().copied().collect()
}

fn words(pairs: &[(&str, WordId)]) -> HashMap<String, WordId> {
    pairs.iter().map(|(w, id)| (w.to_string(), *id)).collect()
}

fn strings(ws: &[&str]) -> Vec<String> {
    ws.iter().map(|w| w.to_string()).collect()
}

/// w1=1, w2=2, w3=3; D1(10,{1,2}), D2(11,{2,3}), D3(12,{1,2,3}).
async fn seed(service: &IndexService) {
    service.register_words(&words(&[("w1", 1), ("w2", 2), ("w3", 3)])).await.unwrap();
    service.add_document(10, "https://d1.example", &ids(&[1, 2])).await.unwrap();
    service.add_document(11, "https://d2.example", &ids(&[2, 3])).await.unwrap();
    service.add_document(12, "https://d3.example", &ids(&[1, 2, 3])).await.unwrap();
}

#[tokio::test]
async fn ranks_by_distinct_matches_with_ascending_doc_tiebreak() {
    let dir = tempdir().unwrap();
    let service = open(&dir, 3).await;
    seed(&service).await;

    let ranking = service.ranked_docs_for(&[1, 2, 3]).await.unwrap();
    assert_eq!(
        ranking,
        vec![
            RankedDoc { doc_id: 12, matches: 3 },
            RankedDoc { doc_id: 10, matches: 2 },
            RankedDoc { doc_id: 11, matches: 2 },
        ]
    );
    assert!(service.ranked_docs_for(&[]).await.unwrap().is_empty());

    let urls = service.search(&strings(&["w1", "w2", "w3", "unknown"])).await.unwrap();
    assert_eq!(urls, vec!["https://d3.example", "https://d1.example", "https://d2.example"]);
}

#[tokio::test]
async fn empty_and_unknown_queries_are_empty_results() {
    let dir = tempdir().unwrap();
    let service = open(&dir, 2).await;
    seed(&service).await;
    assert!(service.search(&[]).await.unwrap().is_empty());
    assert!(service.search(&strings(&["nothing", "here"])).await.unwrap().is_empty());
    assert!(service.lookup("nothing").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn word_ids_skip_unknown_and_keep_order() {
    let dir = tempdir().unwrap();
    let service = open(&dir, 4).await;
    service.register_words(&words(&[("a", 5), ("b", 6), ("c", 7)])).await.unwrap();
    let found = service.word_ids_of(&strings(&["c", "zzz", "a", "b"])).await.unwrap();
    assert_eq!(found, vec![7, 5, 6]);
}

#[tokio::test]
async fn enumerate_all_returns_exact_dictionary_for_any_partition_count() {
    let dict: HashMap<String, WordId> = (0..64).map(|i| (format!("term{i}"), 1000 + i)).collect();
    for n in [1, 3, 7] {
        let dir = tempdir().unwrap();
        let service = open(&dir, n).await;
        assert_eq!(service.register_words(&dict).await.unwrap(), dict.len());
        assert_eq!(service.enumerate_all().await.unwrap(), dict);
        assert_eq!(service.next_word_id().await.unwrap(), 1064);
    }
}

#[tokio::test]
async fn register_words_is_idempotent_but_rejects_conflicts() {
    let dir = tempdir().unwrap();
    let service = open(&dir, 2).await;
    let dict = words(&[("x", 1), ("y", 2)]);
    assert_eq!(service.register_words(&dict).await.unwrap(), 2);
    assert_eq!(service.register_words(&dict).await.unwrap(), 0);
    let err = service.register_words(&words(&[("x", 9)])).await.unwrap_err();
    assert!(err.is_duplicate());
    assert_eq!(service.lookup("x").await.unwrap(), 1);
}

#[tokio::test]
async fn word_id_reused_on_another_partition_is_refused() {
    let dir = tempdir().unwrap();
    let service = open(&dir, 8).await;
    // Find two words routed to different partitions, then ask for the same id.
    let router = *service.router();
    let first = "alpha".to_string();
    let second = (0..)
        .map(|i| format!("beta{i}"))
        .find(|w| router.shard_for(w) != router.shard_for(&first))
        .unwrap();
    service.register_words(&words(&[(first.as_str(), 1)])).await.unwrap();
    let err = service.register_words(&words(&[(second.as_str(), 1)])).await.unwrap_err();
    assert!(err.is_duplicate());
    assert_eq!(service.enumerate_all().await.unwrap(), words(&[(first.as_str(), 1)]));

    let err = service.register_words(&words(&[(second.as_str(), 2), ("gamma", 2)])).await.unwrap_err();
    assert!(err.is_duplicate());
    assert_eq!(service.stats().await.unwrap().words, 1);
}

#[tokio::test]
async fn registration_with_one_bad_pair_writes_nothing() {
    let dir = tempdir().unwrap();
    let service = open(&dir, 4).await;
    service.register_words(&words(&[("x", 1)])).await.unwrap();
    let batch = words(&[("a", 2), ("b", 3), ("c", 4), ("x", 5)]);
    assert!(service.register_words(&batch).await.unwrap_err().is_duplicate());
    assert_eq!(service.enumerate_all().await.unwrap(), words(&[("x", 1)]));
}

#[tokio::test]
async fn postings_for_unknown_words_are_refused() {
    let dir = tempdir().unwrap();
    let service = open(&dir, 3).await;
    service.register_words(&words(&[("known", 1)])).await.unwrap();

    let err = service.add_document(5, "https://five.example", &ids(&[1, 999])).await.unwrap_err();
    assert!(matches!(err, IndexError::Inconsistent(_)));
    let stats = service.stats().await.unwrap();
    assert_eq!((stats.documents, stats.pending_documents, stats.occurrences), (0, 0, 0));

    service.insert_document(6, "https://six.example").await.unwrap();
    let err = service.insert_occurrences(6, &ids(&[42])).await.unwrap_err();
    assert!(matches!(err, IndexError::Inconsistent(_)));
    assert_eq!(service.stats().await.unwrap().occurrences, 0);

    assert_eq!(
        service.add_document(5, "https://five.example", &ids(&[1])).await.unwrap(),
        AddOutcome::Indexed { postings: 1 }
    );
    service.verify().await.unwrap();
}

#[tokio::test]
async fn retrying_add_document_does_not_duplicate_postings() {
    let dir = tempdir().unwrap();
    let service = open(&dir, 2).await;
    seed(&service).await;
    let before = service.stats().await.unwrap();

    let again = service.add_document(12, "https://d3.example", &ids(&[1, 2, 3])).await.unwrap();
    assert_eq!(again, AddOutcome::AlreadyIndexed);
    assert_eq!(service.stats().await.unwrap(), before);
    assert_eq!(before.occurrences, 7);

    let err = service.add_document(12, "https://other.example", &ids(&[1])).await.unwrap_err();
    assert!(err.is_duplicate());
    service.verify().await.unwrap();
}

#[tokio::test]
async fn document_urls_omit_unknown_ids() {
    let dir = tempdir().unwrap();
    let service = open(&dir, 1).await;
    seed(&service).await;
    let urls = service.get_document_urls(&[11, 404, 10]).await.unwrap();
    assert_eq!(urls, vec!["https://d2.example", "https://d1.example"]);
    assert!(service.get_document_urls(&[]).await.unwrap().is_empty());
}

#[tokio::test]
async fn occurrences_for_unknown_document_are_refused() {
    let dir = tempdir().unwrap();
    let service = open(&dir, 1).await;
    service.register_words(&words(&[("p", 1), ("q", 2)])).await.unwrap();
    let err = service.insert_occurrences(77, &ids(&[1, 2])).await.unwrap_err();
    assert!(matches!(err, IndexError::Inconsistent(_)));
    assert_eq!(service.stats().await.unwrap().occurrences, 0);

    service.insert_document(77, "https://77.example").await.unwrap();
    assert!(service.insert_document(77, "https://77.example").await.unwrap_err().is_duplicate());
    assert_eq!(service.insert_occurrences(77, &ids(&[1, 2])).await.unwrap(), 2);
    assert_eq!(service.insert_occurrences(77, &ids(&[1, 2])).await.unwrap(), 0);
}

#[tokio::test]
async fn delete_then_recreate_leaves_empty_usable_stores() {
    let dir = tempdir().unwrap();
    let service = open(&dir, 3).await;
    seed(&service).await;

    service.delete_schema().await.unwrap();
    assert!(matches!(service.search(&strings(&["w1"])).await, Err(IndexError::SchemaMissing)));
    service.delete_schema().await.unwrap();

    IndexBackend::recreate_schema(&service).await.unwrap();
    let stats = service.stats().await.unwrap();
    assert_eq!((stats.words, stats.documents, stats.occurrences), (0, 0, 0));
    assert!(service.enumerate_all().await.unwrap().is_empty());

    seed(&service).await;
    assert_eq!(service.search(&strings(&["w3"])).await.unwrap().len(), 2);
}

#[tokio::test]
async fn data_survives_restart() {
    let dir = tempdir().unwrap();
    let service = open(&dir, 4).await;
    seed(&service).await;
    service.close().await.unwrap();

    let reopened = IndexService::open(config(&dir, 4)).await.unwrap();
    assert!(reopened.schema_ready());
    assert_eq!(reopened.lookup("w2").await.unwrap(), 2);
    assert_eq!(reopened.next_document_id().await.unwrap(), 13);
    let urls = reopened.search(&strings(&["w1", "w2", "w3"])).await.unwrap();
    assert_eq!(urls.first().map(String::as_str), Some("https://d3.example"));
    reopened.close().await.unwrap();

    let err = IndexService::open(config(&dir, 5)).await.err().unwrap();
    assert!(matches!(err, IndexError::Config(_)));
}

#[tokio::test]
async fn pending_documents_are_hidden_and_repaired() {
    let dir = tempdir().unwrap();
    {
        let service = open(&dir, 2).await;
        seed(&service).await;
        service.close().await.unwrap();
    }
    // Simulate an ingestion that wrote its row but died before finishing.
    {
        let docs = DocumentStore::open(&IndexPaths::new(dir.path()).documents()).unwrap();
        docs.insert_with_state(20, "https://half.example", DocumentState::Pending).unwrap();
        docs.flush().unwrap();
    }
    let service = IndexService::open(config(&dir, 2)).await.unwrap();
    service.insert_occurrences(20, &ids(&[1, 2, 3])).await.unwrap();

    let urls = service.search(&strings(&["w1", "w2", "w3"])).await.unwrap();
    assert!(!urls.contains(&"https://half.example".to_string()));
    assert!(matches!(service.verify().await, Err(IndexError::Inconsistent(_))));
    assert_eq!(service.stats().await.unwrap().pending_documents, 1);

    let report = service.repair().await.unwrap();
    assert_eq!((report.documents_removed, report.postings_removed), (1, 3));
    service.verify().await.unwrap();
    assert_eq!(service.stats().await.unwrap().pending_documents, 0);
}

#[tokio::test]
async fn resuming_a_pending_document_completes_it() {
    let dir = tempdir().unwrap();
    {
        let docs = DocumentStore::open(&IndexPaths::new(dir.path()).documents()).unwrap();
        docs.insert_with_state(3, "https://resume.example", DocumentState::Pending).unwrap();
        docs.flush().unwrap();
    }
    let service = open(&dir, 2).await;
    service.register_words(&words(&[("resume", 1)])).await.unwrap();
    let outcome = service.add_document(3, "https://resume.example", &ids(&[1])).await.unwrap();
    assert_eq!(outcome, AddOutcome::Indexed { postings: 1 });
    assert_eq!(service.search(&strings(&["resume"])).await.unwrap(), vec!["https://resume.example"]);
}

#[tokio::test]
async fn concurrent_writers_land_on_their_partitions() {
    let dir = tempdir().unwrap();
    let service = Arc::new(open(&dir, 4).await);
    let mut handles = Vec::new();
    for worker in 0..8u32 {
        let service = service.clone();
        handles.push(tokio::spawn(async move {
            let dict: HashMap<String, WordId> =
                (0..20).map(|i| (format!("w{worker}-{i}"), worker * 100 + i)).collect();
            service.register_words(&dict).await.unwrap();
            let doc: DocId = 1000 + worker;
            let word_ids: BTreeSet<WordId> = dict.values().copied().collect();
            service.add_document(doc, &format!("https://{worker}.example"), &word_ids).await.unwrap();
        }));
    }
    for h in handles {
        h.await.unwrap();
    }
    let stats = service.stats().await.unwrap();
    assert_eq!((stats.words, stats.documents, stats.occurrences), (160, 8, 160));
    assert_eq!(service.lookup("w5-7").await.unwrap(), 507);
    service.verify().await.unwrap();
}

#[tokio::test]
async fn search_client_over_service() {
    let dir = tempdir().unwrap();
    let service = Arc::new(open(&dir, 3).await);
    seed(&service).await;
    let client = SearchClient::connect(service.clone()).await.unwrap();
    assert_eq!(client.id_of("w3").unwrap(), 3);
    assert!(client.id_of("w4").unwrap_err().is_not_found());
    let urls = client.search(&["w2", "w4"]).await.unwrap();
    assert_eq!(urls, vec!["https://d1.example", "https://d2.example", "https://d3.example"]);
}
