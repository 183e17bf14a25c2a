//! Request classification
//!
//! Maps a request URL to exactly one caching strategy.

use url::Url;

use crate::config::WorkerConfig;

/// Caching strategy for a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Serve cached tile if present, refresh the tile cache in the background
    Tile,
    /// Never read or write any cache
    NetworkOnly,
    /// Serve from any namespace if present, else the network without storing
    CacheFirst,
}

impl Route {
    pub fn as_str(&self) -> &'static str {
        match self {
            Route::Tile => "tile",
            Route::NetworkOnly => "networkOnly",
            Route::CacheFirst => "cacheFirst",
        }
    }
}

/// URL rules deciding the route of each request
#[derive(Debug, Clone)]
pub struct Classifier {
    /// Substrings of the full URL identifying tile requests
    tile_patterns: Vec<String>,
    /// Path prefixes reserved for network-only handling
    network_only_prefixes: Vec<String>,
}

impl Classifier {
    pub fn new(tile_patterns: Vec<String>, network_only_prefixes: Vec<String>) -> Self {
        Self {
            tile_patterns,
            network_only_prefixes,
        }
    }

    pub fn from_config(config: &WorkerConfig) -> Self {
        Self::new(
            config.tile_patterns.clone(),
            config.network_only_prefixes.clone(),
        )
    }

    /// Classify a URL; tile patterns are checked before path prefixes
    ///
    /// Prefixes are plain string prefixes of the path, so `/api` also covers
    /// `/apiary`.
    pub fn classify(&self, url: &Url) -> Route {
        let full = url.as_str();
        if self.tile_patterns.iter().any(|p| full.contains(p.as_str())) {
            return Route::Tile;
        }

        let path = url.path();
        if self
            .network_only_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
        {
            return Route::NetworkOnly;
        }

        Route::CacheFirst
    }
}
