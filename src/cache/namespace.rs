//! Cache Namespace
//!
//! One named store mapping request URLs to responses. Entries live on disk as
//! one JSON file per URL (named by the SHA1 of the URL) and are written
//! atomically, so a single entry is either fully present or absent. A Moka
//! cache in front of the disk keeps recently served entries in memory.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use moka::sync::Cache;
use sha1::{Digest, Sha1};
use tracing::{debug, trace};

use crate::origin::{FetchRequest, HttpResponse, StoredEntry};

/// File inside a namespace directory holding the namespace's real name
pub const NAME_FILE: &str = "NAMESPACE";

/// Extension of entry files
const ENTRY_EXT: &str = "json";

/// A single cache namespace
pub struct Namespace {
    /// Namespace name as given by the caller
    name: String,
    /// Directory holding the entry files
    dir: PathBuf,
    /// Recently read or written entries by URL
    hot: Cache<String, Arc<StoredEntry>>,
    /// Lookup hit counter
    hits: AtomicU64,
    /// Lookup miss counter
    misses: AtomicU64,
}

impl Namespace {
    /// Create (or reopen) the namespace `name` under `root`
    pub fn create(root: &Path, name: &str, hot_entries: u64) -> Result<Self> {
        let dir = root.join(dir_name(name));
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create namespace directory: {:?}", dir))?;
        fs::write(dir.join(NAME_FILE), name)
            .with_context(|| format!("Failed to write namespace name in {:?}", dir))?;

        debug!(namespace = name, dir = %dir.display(), "Opened cache namespace");
        Ok(Self::with_dir(name.to_string(), dir, hot_entries))
    }

    /// Load an existing namespace directory, reading its name from disk
    pub fn load(dir: PathBuf, hot_entries: u64) -> Result<Self> {
        let name = fs::read_to_string(dir.join(NAME_FILE))
            .with_context(|| format!("Not a cache namespace: {:?}", dir))?;
        Ok(Self::with_dir(name, dir, hot_entries))
    }

    fn with_dir(name: String, dir: PathBuf, hot_entries: u64) -> Self {
        let hot = Cache::builder()
            .max_capacity(hot_entries)
            .name(&format!("namespace:{}", name))
            .build();

        let namespace = Self {
            name,
            dir,
            hot,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        };
        namespace.cleanup();
        namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Look up a stored response for the request, counting the hit or miss
    ///
    /// Non-GET requests never match.
    pub fn get(&self, request: &FetchRequest) -> Result<Option<HttpResponse>> {
        let found = self.lookup(request)?;
        match found {
            Some(_) => self.record_hit(),
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(found)
    }

    /// Look up a stored response without touching the hit/miss counters
    pub fn lookup(&self, request: &FetchRequest) -> Result<Option<HttpResponse>> {
        if !request.is_cacheable() {
            return Ok(None);
        }
        let url = request.cache_key();

        if let Some(entry) = self.hot.get(url) {
            trace!(namespace = %self.name, url = url, "Namespace HIT (memory)");
            return Ok(Some(entry.response.clone()));
        }

        let path = self.entry_path(url);
        if !path.exists() {
            trace!(namespace = %self.name, url = url, "Namespace MISS");
            return Ok(None);
        }

        let raw = fs::read(&path)
            .with_context(|| format!("Failed to read cache entry: {:?}", path))?;
        let entry: StoredEntry = serde_json::from_slice(&raw)
            .with_context(|| format!("Corrupt cache entry: {:?}", path))?;

        // Hash collisions are not expected, but never serve another URL's body
        if entry.response.url != url {
            return Ok(None);
        }

        trace!(namespace = %self.name, url = url, "Namespace HIT (disk)");
        let response = entry.response.clone();
        self.hot.insert(url.to_string(), Arc::new(entry));
        Ok(Some(response))
    }

    /// Count a hit served from this namespace
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Store a response for the request, replacing any previous entry
    pub fn put(&self, request: &FetchRequest, response: HttpResponse) -> Result<()> {
        if !request.is_cacheable() {
            bail!(
                "Cannot cache {} request for {}",
                request.method,
                request.cache_key()
            );
        }
        if response.status == 206 {
            bail!("Cannot cache partial response for {}", request.cache_key());
        }

        let url = request.cache_key().to_string();
        let entry = StoredEntry::new(request, response);
        let data = serde_json::to_vec(&entry).context("Failed to encode cache entry")?;
        let path = self.entry_path(&url);

        let mut tmp = tempfile::Builder::new()
            .prefix(".entry-")
            .suffix(".tmp")
            .tempfile_in(&self.dir)
            .context("Failed to create temp file for cache entry")?;
        tmp.write_all(&data)
            .context("Failed to write cache entry")?;
        tmp.persist(&path)
            .with_context(|| format!("Failed to persist cache entry: {:?}", path))?;

        debug!(
            namespace = %self.name,
            url = %url,
            size = entry.response.body.len(),
            "Stored response"
        );
        self.hot.insert(url, Arc::new(entry));
        Ok(())
    }

    /// Number of stored entries
    pub fn len(&self) -> usize {
        fs::read_dir(&self.dir)
            .map(|rd| {
                rd.flatten()
                    .filter(|e| e.path().extension().is_some_and(|ext| ext == ENTRY_EXT))
                    .count()
            })
            .unwrap_or(0)
    }

    /// Remove temp files left behind by interrupted writes
    fn cleanup(&self) {
        if let Ok(read_dir) = fs::read_dir(&self.dir) {
            for entry in read_dir.flatten() {
                let path = entry.path();
                if path.extension().is_some_and(|ext| ext == "tmp") {
                    debug!(path = %path.display(), "Removing stale temp file");
                    let _ = fs::remove_file(&path);
                }
            }
        }
    }

    fn entry_path(&self, url: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", sha1_hex(url), ENTRY_EXT))
    }

    /// Returns (hits, misses, hit_rate)
    pub fn stats(&self) -> (u64, u64, f64) {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 {
            (hits as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        (hits, misses, hit_rate)
    }

    pub fn log_metrics(&self) {
        let (hits, misses, hit_rate) = self.stats();
        debug!(
            namespace = %self.name,
            hits = hits,
            misses = misses,
            hit_rate = format!("{:.1}%", hit_rate),
            hot_entries = self.hot.entry_count(),
            "Namespace metrics"
        );
    }
}

fn sha1_hex(input: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Filesystem-safe directory name for a namespace
///
/// Names are free-form strings, so keep a readable prefix and disambiguate
/// with a digest of the full name.
fn dir_name(name: &str) -> String {
    let readable: String = name
        .chars()
        .take(48)
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{}-{}", readable.trim_start_matches('.'), &sha1_hex(name)[..8])
}
