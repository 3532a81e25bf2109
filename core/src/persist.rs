use crate::error::{IndexError, Result};
use serde::{Deserialize, Serialize};
use std::fs::{create_dir_all, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaFile {
    pub version: u32,
    pub partitions: usize,
    pub created_at: String,
    pub schema_ready: bool,
}

impl MetaFile {
    pub fn new(partitions: usize) -> Self {
        let created_at = time::OffsetDateTime::now_utc()
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap_or_default();
        Self { version: MANIFEST_VERSION, partitions, created_at, schema_ready: false }
    }
}

/// On-disk layout of an index root: one sled database per store plus `meta.json`.
#[derive(Debug, Clone)]
pub struct IndexPaths {
    pub root: PathBuf,
}

impl IndexPaths {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self { root: root.as_ref().to_path_buf() }
    }
    pub fn word_partition(&self, shard: usize) -> PathBuf { self.root.join(format!("words-{shard}")) }
    pub fn documents(&self) -> PathBuf { self.root.join("documents") }
    pub fn occurrences(&self) -> PathBuf { self.root.join("occurrences") }
    fn meta(&self) -> PathBuf { self.root.join("meta.json") }
}

pub fn save_meta(paths: &IndexPaths, meta: &MetaFile) -> Result<()> {
    create_dir_all(&paths.root)?;
    // Replaced atomically via rename.
    let tmp = paths.root.join("meta.json.tmp");
    let mut f = File::create(&tmp)?;
    let json = serde_json::to_string_pretty(meta)?;
    f.write_all(json.as_bytes())?;
    f.sync_all()?;
    std::fs::rename(tmp, paths.meta())?;
    Ok(())
}

/// Returns `None` for a fresh root that has never been opened.
pub fn load_meta(paths: &IndexPaths) -> Result<Option<MetaFile>> {
    let mut f = match File::open(paths.meta()) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut buf = String::new();
    f.read_to_string(&mut buf)?;
    let meta: MetaFile = serde_json::from_str(&buf)?;
    if meta.version != MANIFEST_VERSION {
        return Err(IndexError::Manifest(format!(
            "unsupported manifest version {} (expected {MANIFEST_VERSION})",
            meta.version
        )));
    }
    Ok(Some(meta))
}

/// Loads the manifest for `partitions`, creating it on first open. The
/// partition count is fixed once the manifest exists.
pub fn load_or_init_meta(paths: &IndexPaths, partitions: usize) -> Result<MetaFile> {
    match load_meta(paths)? {
        Some(meta) if meta.partitions != partitions => Err(IndexError::Config(format!(
            "index at {} was created with {} partitions, configured for {}",
            paths.root.display(),
            meta.partitions,
            partitions
        ))),
        Some(meta) => Ok(meta),
        None => {
            let meta = MetaFile::new(partitions);
            save_meta(paths, &meta)?;
            Ok(meta)
        }
    }
}
