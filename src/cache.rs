//! Artifact cache for incremental builds.
//!
//! The cache maps a [`CacheKey`] (a task identity plus a digest of everything
//! the task reads) to the artifacts the task produced. Output bytes live in a
//! content-addressed [`BlobStore`], so identical outputs are stored once.
//!
//! All reads are fail-safe: a missing or corrupt blob is logged and treated
//! as a miss, never as an error. When persisted, the manifest is only a hint.
//! A persisted entry is reused only if the current inputs derive the same
//! key, and every blob is re-hashed before use.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{self, BufReader, BufWriter};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::core::{Artifact, Hash32, TaskId};
use crate::error::CacheError;
use crate::output::Output;

/// Bumped whenever the manifest layout changes.
const MANIFEST_VERSION: u32 = 1;

const MANIFEST_FILE: &str = "manifest.cbor";
const BLOB_SUBDIR: &str = "blobs";

/// Identifies one cached execution of a task.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub task: TaskId,
    pub digest: Hash32,
}

impl CacheKey {
    /// Derive a key from the task identity, the environment fingerprint and
    /// the input path/fingerprint pairs. The pairs are sorted first, so the
    /// key does not depend on the order inputs were discovered in.
    pub fn derive(task: &TaskId, environment: Hash32, inputs: &[(String, Hash32)]) -> Self {
        let mut sorted: Vec<&(String, Hash32)> = inputs.iter().collect();
        sorted.sort();

        Self {
            task: task.clone(),
            digest: Hash32::hash_value(&(task.as_ref(), environment, sorted)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub outputs: Vec<Artifact>,
}

impl CacheEntry {
    fn same_content(&self, other: &[Artifact]) -> bool {
        self.outputs.len() == other.len()
            && self
                .outputs
                .iter()
                .zip(other)
                .all(|(a, b)| a.same_content(b))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The key was not present.
    Inserted,
    /// The key was present with identical outputs; nothing changed.
    Unchanged,
    /// The key was present with different outputs, which were overwritten.
    Replaced,
}

/// Content-addressed storage for output bytes.
///
/// Blobs are kept in memory, and additionally under `<dir>/blobs/<hex>` when
/// the cache is persisted.
#[derive(Default)]
pub struct BlobStore {
    mem: HashMap<Hash32, Arc<[u8]>>,
    dir: Option<Utf8PathBuf>,
}

impl BlobStore {
    fn new(dir: Option<Utf8PathBuf>) -> Self {
        Self {
            mem: HashMap::new(),
            dir: dir.map(|d| d.join(BLOB_SUBDIR)),
        }
    }

    fn path(&self, hash: Hash32) -> Option<Utf8PathBuf> {
        self.dir.as_ref().map(|dir| dir.join(hash.to_hex()))
    }

    fn put(&mut self, data: &[u8]) -> Result<Hash32, CacheError> {
        let hash = Hash32::hash(data);

        // A file on disk that was never read back is only trusted if it
        // still hashes to its name.
        if let Some(path) = self.path(hash)
            && !self.mem.contains_key(&hash)
            && !Hash32::hash_file(&path).is_ok_and(|actual| actual == hash)
        {
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir)?;
            }
            fs::write(&path, data)?;
        }

        self.mem.entry(hash).or_insert_with(|| Arc::from(data));
        Ok(hash)
    }

    fn get(&mut self, hash: Hash32) -> Result<Arc<[u8]>, CacheError> {
        if let Some(data) = self.mem.get(&hash) {
            return Ok(data.clone());
        }

        let path = self
            .path(hash)
            .ok_or_else(|| CacheError::Corruption(format!("blob {hash} is missing")))?;

        let data: Arc<[u8]> = match fs::read(&path) {
            Ok(data) => data.into(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CacheError::Corruption(format!("blob {hash} is missing")));
            }
            Err(e) => return Err(e.into()),
        };

        let actual = Hash32::hash(&data);
        if actual != hash {
            if let Err(e) = fs::remove_file(&path) {
                tracing::debug!("couldn't remove corrupt blob {path}: {e}");
            }
            return Err(CacheError::Corruption(format!(
                "blob {hash} hashes to {actual}"
            )));
        }

        self.mem.insert(hash, data.clone());
        Ok(data)
    }

    /// Drop every blob not in `live`. Returns the number of files removed
    /// from disk.
    fn gc(&mut self, live: &HashSet<Hash32>) -> Result<usize, CacheError> {
        self.mem.retain(|hash, _| live.contains(hash));

        let Some(dir) = &self.dir else {
            return Ok(0);
        };

        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let live: HashSet<String> = live.iter().map(|h| h.to_hex()).collect();
        let mut removed = 0;

        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            if !live.contains(name.to_string_lossy().as_ref()) {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }

        Ok(removed)
    }
}

#[derive(Serialize, Deserialize)]
struct Manifest {
    version: u32,
    entries: Vec<ManifestEntry>,
}

#[derive(Serialize, Deserialize)]
struct ManifestEntry {
    task: String,
    digest: Hash32,
    outputs: Vec<Artifact>,
}

/// Maps task executions to their previously produced outputs.
#[derive(Default)]
pub struct ArtifactCache {
    entries: HashMap<CacheKey, CacheEntry>,
    blobs: BlobStore,
    dir: Option<Utf8PathBuf>,
}

impl ArtifactCache {
    /// An in-memory cache, lost when the process exits.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Loads a persisted cache from `dir`, or starts an empty one there.
    ///
    /// Any problem with the existing manifest results in starting fresh.
    pub fn load(dir: impl Into<Utf8PathBuf>) -> Self {
        let dir = dir.into();

        let entries = match read_manifest(&dir) {
            Ok(Some(manifest)) => manifest
                .entries
                .into_iter()
                .map(|e| {
                    let key = CacheKey {
                        task: e.task.into(),
                        digest: e.digest,
                    };
                    (key, CacheEntry { outputs: e.outputs })
                })
                .collect(),
            Ok(None) => HashMap::new(),
            Err(e) => {
                tracing::warn!("discarding the artifact cache in {dir}: {e}");
                HashMap::new()
            }
        };

        Self {
            entries,
            blobs: BlobStore::new(Some(dir.clone())),
            dir: Some(dir),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_persistent(&self) -> bool {
        self.dir.is_some()
    }

    /// Look up the outputs stored under `key`.
    ///
    /// On a miss, every other entry of the same task is stale and gets
    /// evicted. A corrupt entry is evicted and reported as a miss.
    pub fn get(&mut self, key: &CacheKey) -> Option<Vec<Output>> {
        let Some(entry) = self.entries.get(key) else {
            self.evict_task(&key.task);
            return None;
        };

        let outputs = entry.outputs.clone();
        match self.load_outputs(&outputs) {
            Ok(outputs) => Some(outputs),
            Err(e) => {
                tracing::warn!(task = %key.task, "ignoring cached outputs: {e}");
                self.evict_task(&key.task);
                None
            }
        }
    }

    /// Store `outputs` under `key`. Idempotent for identical outputs.
    pub fn put(&mut self, key: CacheKey, outputs: &[Output]) -> Result<PutOutcome, CacheError> {
        let artifacts: Vec<Artifact> = outputs.iter().map(Output::to_artifact).collect();

        let outcome = match self.entries.get(&key) {
            Some(entry) if entry.same_content(&artifacts) => return Ok(PutOutcome::Unchanged),
            Some(_) => PutOutcome::Replaced,
            None => PutOutcome::Inserted,
        };

        for output in outputs {
            self.blobs.put(output.bytes())?;
        }

        self.entries.insert(key, CacheEntry { outputs: artifacts });
        Ok(outcome)
    }

    /// The artifacts stored under `key`, without loading any blobs.
    pub fn entry(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Persist the manifest. No-op for an in-memory cache.
    pub fn save(&self) -> Result<(), CacheError> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };

        fs::create_dir_all(dir)?;

        let manifest = Manifest {
            version: MANIFEST_VERSION,
            entries: self
                .entries
                .iter()
                .map(|(key, entry)| ManifestEntry {
                    task: key.task.to_string(),
                    digest: key.digest,
                    outputs: entry.outputs.clone(),
                })
                .collect(),
        };

        // Write to a temporary file first, so a crash never leaves a torn
        // manifest behind.
        let temp = dir.join(format!("{MANIFEST_FILE}.tmp"));
        let mut file = BufWriter::new(fs::File::create(&temp)?);
        ciborium::into_writer(&manifest, &mut file)
            .map_err(|e| CacheError::Encode(e.to_string()))?;
        io::Write::flush(&mut file)?;
        drop(file);
        fs::rename(&temp, dir.join(MANIFEST_FILE))?;

        Ok(())
    }

    /// Remove blobs no entry refers to. Returns the number of files removed.
    pub fn gc(&mut self) -> Result<usize, CacheError> {
        let live: HashSet<Hash32> = self
            .entries
            .values()
            .flat_map(|entry| entry.outputs.iter().map(|a| a.fingerprint))
            .collect();

        self.blobs.gc(&live)
    }

    fn evict_task(&mut self, task: &TaskId) {
        let before = self.entries.len();
        self.entries.retain(|key, _| &key.task != task);

        let evicted = before - self.entries.len();
        if evicted > 0 {
            tracing::debug!(%task, evicted, "evicted stale cache entries");
        }
    }

    fn load_outputs(&mut self, artifacts: &[Artifact]) -> Result<Vec<Output>, CacheError> {
        artifacts
            .iter()
            .map(|artifact| {
                let data = self.blobs.get(artifact.fingerprint)?;
                Ok(Output::binary(&artifact.path, data))
            })
            .collect()
    }
}

fn read_manifest(dir: &Utf8Path) -> Result<Option<Manifest>, CacheError> {
    let file = match fs::File::open(dir.join(MANIFEST_FILE)) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let manifest: Manifest = ciborium::from_reader(BufReader::new(file))
        .map_err(|e| CacheError::Corruption(format!("unreadable manifest: {e}")))?;

    if manifest.version != MANIFEST_VERSION {
        return Err(CacheError::Corruption(format!(
            "manifest version {} is not {MANIFEST_VERSION}",
            manifest.version
        )));
    }

    Ok(Some(manifest))
}
