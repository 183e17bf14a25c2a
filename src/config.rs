//! Daemon configuration
//!
//! Cache names, the shell asset list and the URL routing rules. Everything has
//! a built-in default; a JSON file can override any subset of fields.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use tracing::debug;
use url::Url;

/// Default origin serving the application shell
const DEFAULT_ORIGIN: &str = "http://127.0.0.1:5000";

/// Static cache name; bump together with the shell asset list
const DEFAULT_STATIC_CACHE: &str = "field-shell-v4";

/// Tile cache name; bump only when the tile caching scheme changes
const DEFAULT_TILE_CACHE: &str = "field-tiles-v1";

/// Default socket path for client connections
const DEFAULT_SOCKET_PATH: &str = "/tmp/shellcache.sock";

const DEFAULT_SHELL_ASSETS: &[&str] = &[
    "/",
    "/manifest.json",
    "https://unpkg.com/leaflet@1.9.4/dist/leaflet.css",
    "https://unpkg.com/leaflet@1.9.4/dist/leaflet.js",
];

const DEFAULT_TILE_PATTERNS: &[&str] = &["tile.openstreetmap.org", "arcgisonline.com", "/tile/"];

const DEFAULT_NETWORK_ONLY_PREFIXES: &[&str] = &["/api", "/sync"];

/// Runtime configuration for the caching daemon
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    /// Origin that root-relative shell assets resolve against
    pub origin: Url,
    /// Name of the static asset namespace (doubles as the version id)
    pub static_cache: String,
    /// Name of the tile namespace
    pub tile_cache: String,
    /// Resources fetched into the static namespace at install time
    pub shell_assets: Vec<String>,
    /// Substrings of the full URL that mark a tile request
    pub tile_patterns: Vec<String>,
    /// Path prefixes that are never served from or written to cache
    pub network_only_prefixes: Vec<String>,
    /// Root directory of cache storage
    pub cache_dir: Option<PathBuf>,
    /// Unix socket clients connect to
    pub socket_path: PathBuf,
    /// Timeout applied to every network fetch
    pub request_timeout_secs: u64,
    /// Entries kept in memory per namespace
    pub hot_entries: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            origin: Url::parse(DEFAULT_ORIGIN).expect("default origin is a valid URL"),
            static_cache: DEFAULT_STATIC_CACHE.to_string(),
            tile_cache: DEFAULT_TILE_CACHE.to_string(),
            shell_assets: to_strings(DEFAULT_SHELL_ASSETS),
            tile_patterns: to_strings(DEFAULT_TILE_PATTERNS),
            network_only_prefixes: to_strings(DEFAULT_NETWORK_ONLY_PREFIXES),
            cache_dir: None,
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            request_timeout_secs: 30,
            hot_entries: 512,
        }
    }
}

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl WorkerConfig {
    /// Load configuration from an optional JSON file, falling back to defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let raw = fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file: {:?}", path))?;
                let config: WorkerConfig = serde_json::from_str(&raw)
                    .with_context(|| format!("Failed to parse config file: {:?}", path))?;
                debug!(path = %path.display(), "Loaded config file");
                config
            }
            None => WorkerConfig::default(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Check the invariants the lifecycle relies on
    pub fn validate(&self) -> Result<()> {
        if self.static_cache.trim().is_empty() || self.tile_cache.trim().is_empty() {
            bail!("Cache names must not be empty");
        }
        if self.static_cache == self.tile_cache {
            bail!(
                "Static and tile caches must have distinct names (both are '{}')",
                self.static_cache
            );
        }
        if !matches!(self.origin.scheme(), "http" | "https") {
            bail!("Origin must be an http(s) URL: {}", self.origin);
        }
        if self.request_timeout_secs == 0 {
            bail!("request_timeout_secs must be greater than zero");
        }
        self.shell_urls()?;
        Ok(())
    }

    /// Shell asset list resolved to absolute URLs, in declaration order
    pub fn shell_urls(&self) -> Result<Vec<Url>> {
        self.shell_assets
            .iter()
            .map(|asset| self.resolve(asset))
            .collect()
    }

    /// Resolve a root-relative or absolute URL string against the origin
    pub fn resolve(&self, raw: &str) -> Result<Url> {
        self.origin
            .join(raw)
            .map_err(|e| anyhow!("Invalid URL '{}': {}", raw, e))
    }

    /// Cache storage root, defaulting to the platform cache directory
    pub fn cache_root(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join("shellcache")
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
