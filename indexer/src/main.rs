use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, EnvFilter};
use walkdir::WalkDir;
use wordindex_core::tokenizer::distinct_words;
use wordindex_core::{AddOutcome, DocId, Dictionary, IndexConfig, IndexService, SearchClient, WordId};

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Deserialize)]
struct InputDoc {
    #[serde(default)]
    id: Option<DocId>,
    url: String,
    #[serde(default)]
    title: Option<String>,
    body: String,
}

#[derive(Parser)]
#[command(name = "indexer")]
#[command(about = "Build and query a partitioned word index", long_about = None)]
struct Cli {
    /// Index directory path
    #[arg(long, env = "WORDINDEX_ROOT", default_value = "./index", global = true)]
    index: PathBuf,
    /// Number of word partitions; fixed once the index exists
    #[arg(long, env = "WORDINDEX_PARTITIONS", default_value_t = 4, global = true)]
    partitions: usize,
    /// Per-operation timeout in milliseconds
    #[arg(long, env = "WORDINDEX_TIMEOUT_MS", default_value_t = 5_000, global = true)]
    timeout_ms: u64,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Drop and recreate every store, leaving an empty index
    Init,
    /// Drop every store
    Drop,
    /// Ingest documents from JSON/JSONL files or a directory of them
    Ingest {
        /// Input path (file or directory)
        #[arg(long)]
        input: PathBuf,
    },
    /// Search for documents containing the query words
    Search {
        query: String,
        /// Maximum number of urls to print
        #[arg(long, default_value_t = 10)]
        k: usize,
    },
    /// Print the merged dictionary as JSON
    Words,
    /// Remove documents left half-ingested and their postings
    Repair,
    /// Print store counts and run the consistency check
    Stats,
}

#[derive(Serialize)]
struct SearchOutput {
    query: String,
    took_s: f64,
    total_hits: usize,
    results: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let cli = Cli::parse();
    let config = IndexConfig::new(&cli.index)
        .with_partitions(cli.partitions)
        .with_timeout(Duration::from_millis(cli.timeout_ms));
    let service = IndexService::open(config)
        .await
        .with_context(|| format!("opening index at {}", cli.index.display()))?;
    let service = Arc::new(service);

    let result = run(&service, cli.command).await;
    match Arc::try_unwrap(service) {
        Ok(service) => service.close().await?,
        Err(_) => anyhow::bail!("index still in use at shutdown"),
    }
    result
}

async fn run(service: &Arc<IndexService>, command: Commands) -> Result<()> {
    match command {
        Commands::Init => {
            service.recreate_schema().await?;
            tracing::info!("index initialised");
        }
        Commands::Drop => service.drop_schema().await?,
        Commands::Ingest { input } => {
            if !service.schema_ready() {
                service.create_schema().await?;
            }
            ingest(service, &input).await?;
        }
        Commands::Search { query, k } => {
            let start = Instant::now();
            let client = SearchClient::connect(service.clone()).await?;
            let urls = client.search_text(&query).await?;
            let output = SearchOutput {
                query,
                took_s: start.elapsed().as_secs_f64(),
                total_hits: urls.len(),
                results: urls.into_iter().take(k.max(1)).collect(),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Commands::Words => {
            let dict = service.enumerate_all().await?;
            println!("{}", serde_json::to_string_pretty(&dict)?);
        }
        Commands::Repair => {
            let report = service.repair().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Stats => {
            let stats = service.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            service.verify().await.context("consistency check failed")?;
        }
    }
    Ok(())
}

/// Assigns ids to unseen words and documents, then hands both to the service.
struct Ingestor<'a> {
    service: &'a IndexService,
    dictionary: Dictionary,
    next_word_id: WordId,
    next_doc_id: DocId,
    indexed: usize,
    skipped: usize,
}

impl<'a> Ingestor<'a> {
    async fn new(service: &'a IndexService) -> Result<Self> {
        let dictionary = service.enumerate_all().await?;
        let next_word_id = service.next_word_id().await?;
        let next_doc_id = service.next_document_id().await?;
        Ok(Self { service, dictionary, next_word_id, next_doc_id, indexed: 0, skipped: 0 })
    }

    async fn ingest_doc(&mut self, doc: InputDoc) -> Result<()> {
        let text = match &doc.title {
            Some(title) => format!("{title}\n{}", doc.body),
            None => doc.body.clone(),
        };
        let mut fresh = Dictionary::new();
        let mut word_ids = BTreeSet::new();
        for word in distinct_words(&text) {
            let id = match self.dictionary.get(&word) {
                Some(&id) => id,
                None => {
                    let id = self.next_word_id;
                    self.next_word_id += 1;
                    fresh.insert(word.clone(), id);
                    self.dictionary.insert(word, id);
                    id
                }
            };
            word_ids.insert(id);
        }
        if !fresh.is_empty() {
            self.service.register_words(&fresh).await?;
        }

        let doc_id = doc.id.unwrap_or(self.next_doc_id);
        self.next_doc_id = self.next_doc_id.max(doc_id.saturating_add(1));
        match self.service.add_document(doc_id, &doc.url, &word_ids).await? {
            AddOutcome::Indexed { postings } => {
                tracing::debug!(doc_id, url = %doc.url, postings, "ingested");
                self.indexed += 1;
            }
            AddOutcome::AlreadyIndexed => self.skipped += 1,
        }
        Ok(())
    }
}

async fn ingest(service: &IndexService, input: &Path) -> Result<()> {
    let mut files: Vec<PathBuf> = Vec::new();
    if input.is_dir() {
        for entry in WalkDir::new(input).into_iter().filter_map(|e| e.ok()) {
            let p = entry.path();
            if p.is_file() && matches!(p.extension().and_then(|s| s.to_str()), Some("json" | "jsonl")) {
                files.push(p.to_path_buf());
            }
        }
        files.sort();
    } else if input.is_file() {
        files.push(input.to_path_buf());
    } else {
        anyhow::bail!("input {} does not exist", input.display());
    }

    let mut ingestor = Ingestor::new(service).await?;
    for file in files {
        for doc in read_docs(&file).with_context(|| format!("reading {}", file.display()))? {
            ingestor.ingest_doc(doc).await?;
        }
    }
    tracing::info!(
        indexed = ingestor.indexed,
        skipped = ingestor.skipped,
        words = ingestor.dictionary.len(),
        "ingestion complete"
    );
    Ok(())
}

fn read_docs(file: &Path) -> Result<Vec<InputDoc>> {
    let reader = BufReader::new(File::open(file)?);
    if file.extension().and_then(|s| s.to_str()) == Some("jsonl") {
        let mut docs = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() { continue; }
            docs.push(serde_json::from_str(&line)?);
        }
        return Ok(docs);
    }
    let json: serde_json::Value = serde_json::from_reader(reader)?;
    match json {
        serde_json::Value::Array(arr) => {
            Ok(arr.into_iter().map(serde_json::from_value).collect::<Result<Vec<_>, _>>()?)
        }
        serde_json::Value::Object(_) => Ok(vec![serde_json::from_value(json)?]),
        _ => Ok(Vec::new()),
    }
}
