//! Cache Storage
//!
//! The set of named namespaces under one root directory. Namespaces are
//! created lazily on first open and discovered from disk on startup.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use super::namespace::{Namespace, NAME_FILE};
use crate::origin::{FetchRequest, HttpResponse};

/// All cache namespaces owned by the daemon
pub struct CacheStorage {
    /// Directory holding one subdirectory per namespace
    root: PathBuf,
    /// In-memory entry budget handed to each namespace
    hot_entries: u64,
    /// Open namespaces by name
    namespaces: RwLock<BTreeMap<String, Arc<Namespace>>>,
}

impl CacheStorage {
    /// Open cache storage rooted at `root`, loading existing namespaces
    pub fn open_root(root: PathBuf, hot_entries: u64) -> Result<Self> {
        fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create cache root: {:?}", root))?;

        let mut namespaces = BTreeMap::new();
        for entry in fs::read_dir(&root)
            .with_context(|| format!("Failed to read cache root: {:?}", root))?
            .flatten()
        {
            let path = entry.path();
            if !path.is_dir() || !path.join(NAME_FILE).exists() {
                continue;
            }
            match Namespace::load(path.clone(), hot_entries) {
                Ok(ns) => {
                    namespaces.insert(ns.name().to_string(), Arc::new(ns));
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable namespace"),
            }
        }

        info!(
            root = %root.display(),
            namespaces = namespaces.len(),
            "Cache storage opened"
        );

        Ok(Self {
            root,
            hot_entries,
            namespaces: RwLock::new(namespaces),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Open a namespace, creating it if it does not exist yet
    pub fn open(&self, name: &str) -> Result<Arc<Namespace>> {
        if let Some(ns) = self.get(name) {
            return Ok(ns);
        }

        let mut namespaces = self.namespaces.write().unwrap_or_else(PoisonError::into_inner);
        // Another opener may have won the race since the read lock was dropped
        if let Some(ns) = namespaces.get(name) {
            return Ok(Arc::clone(ns));
        }
        let ns = Arc::new(Namespace::create(&self.root, name, self.hot_entries)?);
        namespaces.insert(name.to_string(), Arc::clone(&ns));
        Ok(ns)
    }

    /// Get a namespace without creating it
    pub fn get(&self, name: &str) -> Option<Arc<Namespace>> {
        let namespaces = self.namespaces.read().unwrap_or_else(PoisonError::into_inner);
        namespaces.get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Delete a namespace and everything in it
    pub fn delete(&self, name: &str) -> Result<bool> {
        let removed = {
            let mut namespaces = self.namespaces.write().unwrap_or_else(PoisonError::into_inner);
            namespaces.remove(name)
        };

        match removed {
            Some(ns) => {
                fs::remove_dir_all(ns.dir())
                    .with_context(|| format!("Failed to delete namespace: {:?}", ns.dir()))?;
                info!(namespace = name, "Deleted cache namespace");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Names of all namespaces, sorted
    pub fn keys(&self) -> Vec<String> {
        let namespaces = self.namespaces.read().unwrap_or_else(PoisonError::into_inner);
        namespaces.keys().cloned().collect()
    }

    /// All open namespaces, sorted by name
    pub fn namespaces(&self) -> Vec<Arc<Namespace>> {
        let namespaces = self.namespaces.read().unwrap_or_else(PoisonError::into_inner);
        namespaces.values().cloned().collect()
    }

    /// Match a request across every namespace, in name order
    ///
    /// Returns the first hit together with the namespace it came from. Only
    /// the serving namespace counts the hit; namespaces searched before it
    /// do not count a miss. An unreadable entry is skipped so a later
    /// namespace can still answer.
    pub fn match_any(&self, request: &FetchRequest) -> Option<(String, HttpResponse)> {
        for ns in self.namespaces() {
            match ns.lookup(request) {
                Ok(Some(response)) => {
                    ns.record_hit();
                    debug!(namespace = ns.name(), url = %request.url, "Cache HIT");
                    return Some((ns.name().to_string(), response));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(namespace = ns.name(), url = %request.url, error = %e, "Skipping unreadable cache entry");
                }
            }
        }
        debug!(url = %request.url, "Cache MISS in all namespaces");
        None
    }
}
