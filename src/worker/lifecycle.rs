//! Version lifecycle
//!
//! Install populates the static namespace with the application shell;
//! activate garbage-collects namespaces of older versions and records the
//! active version so a restart does not repeat either step.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cache::{run_blocking, CacheStorage};
use crate::config::WorkerConfig;
use crate::origin::{FetchRequest, OriginClient};

/// File in the cache root recording the active version
pub const RECORD_FILE: &str = "worker-state.json";

/// State of the most recently installed version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Nothing installed yet
    Parsed,
    /// Shell assets being fetched
    Installing,
    /// Shell stored, about to activate
    Installed,
    /// Removing stale namespaces
    Activating,
    /// Routing requests
    Activated,
    /// Install failed; the previous version (if any) keeps routing
    Redundant,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Parsed => "parsed",
            WorkerState::Installing => "installing",
            WorkerState::Installed => "installed",
            WorkerState::Activating => "activating",
            WorkerState::Activated => "activated",
            WorkerState::Redundant => "redundant",
        }
    }
}

/// Persisted record of the active version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionRecord {
    /// Static cache name of the active version
    pub active_version: String,
    /// Tile cache name in use when it activated
    pub tile_cache: String,
    /// Activation time in seconds since epoch
    pub activated_at: u64,
}

impl VersionRecord {
    /// Whether this record describes the configured version
    pub fn matches(&self, config: &WorkerConfig) -> bool {
        self.active_version == config.static_cache && self.tile_cache == config.tile_cache
    }
}

/// Read the version record, if one has been written
pub fn load_record(root: &Path) -> Result<Option<VersionRecord>> {
    let path = root.join(RECORD_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read(&path).with_context(|| format!("Failed to read {:?}", path))?;
    let record = serde_json::from_slice(&raw).with_context(|| format!("Corrupt {:?}", path))?;
    Ok(Some(record))
}

/// Write the version record atomically
pub fn save_record(root: &Path, record: &VersionRecord) -> Result<()> {
    let path = root.join(RECORD_FILE);
    let data = serde_json::to_vec_pretty(record).context("Failed to encode version record")?;

    let mut tmp = tempfile::NamedTempFile::new_in(root)
        .context("Failed to create temp file for version record")?;
    tmp.write_all(&data)
        .context("Failed to write version record")?;
    tmp.persist(&path)
        .with_context(|| format!("Failed to persist {:?}", path))?;
    Ok(())
}

/// Fetch every shell asset and store them in the static namespace
///
/// All assets are fetched before anything is written: one failed fetch or
/// non-2xx status fails the whole install and stores nothing.
pub async fn install(
    storage: &Arc<CacheStorage>,
    origin: &OriginClient,
    config: &WorkerConfig,
) -> Result<usize> {
    let urls = config.shell_urls()?;
    info!(
        version = %config.static_cache,
        assets = urls.len(),
        "Installing shell assets"
    );

    let static_storage = Arc::clone(storage);
    let static_cache = config.static_cache.clone();
    let namespace = run_blocking(move || static_storage.open(&static_cache)).await?;

    let responses = futures::future::try_join_all(urls.iter().map(|url| origin.fetch_ok(url)))
        .await
        .with_context(|| format!("Install of {} failed", config.static_cache))?;

    let count = responses.len();
    run_blocking(move || {
        for (url, response) in urls.into_iter().zip(responses) {
            debug!(url = %url, status = response.status, "Caching shell asset");
            namespace.put(&FetchRequest::get(url), response)?;
        }
        Ok(())
    })
    .await?;

    info!(version = %config.static_cache, assets = count, "Install complete");
    Ok(count)
}

/// Delete every namespace that belongs to neither current cache name
///
/// Returns the names of the deleted namespaces and persists the version
/// record for the configured version.
pub async fn activate(storage: &Arc<CacheStorage>, config: &WorkerConfig) -> Result<Vec<String>> {
    let storage = Arc::clone(storage);
    let static_cache = config.static_cache.clone();
    let tile_cache = config.tile_cache.clone();

    let deleted = run_blocking(move || {
        let mut deleted = Vec::new();
        for name in storage.keys() {
            if name == static_cache || name == tile_cache {
                continue;
            }
            storage.delete(&name)?;
            deleted.push(name);
        }

        let record = VersionRecord {
            active_version: static_cache,
            tile_cache,
            activated_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        };
        save_record(storage.root(), &record)?;
        Ok(deleted)
    })
    .await?;

    info!(
        version = %config.static_cache,
        deleted = ?deleted,
        "Activated"
    );
    Ok(deleted)
}
