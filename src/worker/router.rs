//! Request Router
//!
//! Dispatches every intercepted request of a controlled client to one of the
//! three caching strategies.

use std::sync::Arc;

use tracing::{debug, warn};

use super::classify::{Classifier, Route};
use crate::cache::{run_blocking, CacheStorage};
use crate::origin::{FetchError, FetchRequest, HttpResponse, OriginClient};

/// Where a served response came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Cache,
    Network,
}

impl ResponseSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseSource::Cache => "cache",
            ResponseSource::Network => "network",
        }
    }
}

/// A response together with how it was produced
#[derive(Debug, Clone)]
pub struct Routed {
    pub response: HttpResponse,
    pub source: ResponseSource,
    /// None for requests of uncontrolled clients
    pub route: Option<Route>,
}

/// Routing logic of one activated version
pub struct Router {
    /// Version this router belongs to (the static cache name)
    version: String,
    /// Name of the tile namespace
    tile_cache: String,
    classifier: Classifier,
    storage: Arc<CacheStorage>,
    origin: OriginClient,
}

impl Router {
    pub fn new(
        version: String,
        tile_cache: String,
        classifier: Classifier,
        storage: Arc<CacheStorage>,
        origin: OriginClient,
    ) -> Self {
        Self {
            version,
            tile_cache,
            classifier,
            storage,
            origin,
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Route a request to its strategy
    pub async fn handle(&self, request: FetchRequest) -> Result<Routed, FetchError> {
        let route = self.classifier.classify(&request.url);
        debug!(
            method = %request.method,
            url = %request.url,
            route = route.as_str(),
            "Routing request"
        );

        match route {
            Route::Tile => self.tile(request).await,
            Route::NetworkOnly => self.network_only(request).await,
            Route::CacheFirst => self.cache_first(request).await,
        }
    }

    /// Serve a cached tile if present while always refreshing in the background
    ///
    /// The refresh runs in its own task so it completes even when the cached
    /// copy has already been returned. Concurrent requests for the same tile
    /// each fetch and each store; the last write wins.
    async fn tile(&self, request: FetchRequest) -> Result<Routed, FetchError> {
        let cached = self.lookup_tile(&request).await;

        let refresh = tokio::spawn(refresh_tile(
            self.origin.clone(),
            Arc::clone(&self.storage),
            self.tile_cache.clone(),
            request,
        ));

        if let Some(response) = cached {
            // Dropping the handle detaches the refresh; its outcome is unobserved
            return Ok(Routed {
                response,
                source: ResponseSource::Cache,
                route: Some(Route::Tile),
            });
        }

        let response = refresh
            .await
            .map_err(|e| FetchError::Network(format!("Tile refresh task failed: {}", e)))??;
        Ok(Routed {
            response,
            source: ResponseSource::Network,
            route: Some(Route::Tile),
        })
    }

    async fn lookup_tile(&self, request: &FetchRequest) -> Option<HttpResponse> {
        let storage = Arc::clone(&self.storage);
        let tile_cache = self.tile_cache.clone();
        let lookup = request.clone();

        match run_blocking(move || storage.open(&tile_cache)?.get(&lookup)).await {
            Ok(hit) => hit,
            Err(e) => {
                warn!(url = %request.url, error = %e, "Tile cache lookup failed, treating as miss");
                None
            }
        }
    }

    /// Forward to the network with no cache read or write
    async fn network_only(&self, request: FetchRequest) -> Result<Routed, FetchError> {
        let response = self.origin.fetch(&request).await?;
        Ok(Routed {
            response,
            source: ResponseSource::Network,
            route: Some(Route::NetworkOnly),
        })
    }

    /// Serve from any namespace, else from the network without storing
    async fn cache_first(&self, request: FetchRequest) -> Result<Routed, FetchError> {
        let storage = Arc::clone(&self.storage);
        let lookup = request.clone();

        let cached = match run_blocking(move || Ok(storage.match_any(&lookup))).await {
            Ok(hit) => hit,
            Err(e) => {
                warn!(url = %request.url, error = %e, "Cache lookup task failed, treating as miss");
                None
            }
        };

        if let Some((_, response)) = cached {
            return Ok(Routed {
                response,
                source: ResponseSource::Cache,
                route: Some(Route::CacheFirst),
            });
        }

        let response = self.origin.fetch(&request).await?;
        Ok(Routed {
            response,
            source: ResponseSource::Network,
            route: Some(Route::CacheFirst),
        })
    }
}

/// Fetch a tile and store a copy in the tile namespace
async fn refresh_tile(
    origin: OriginClient,
    storage: Arc<CacheStorage>,
    tile_cache: String,
    request: FetchRequest,
) -> Result<HttpResponse, FetchError> {
    let response = match origin.fetch(&request).await {
        Ok(response) => response,
        Err(e) => {
            debug!(url = %request.url, error = %e, "Tile refresh failed");
            return Err(e);
        }
    };

    let url = request.url.clone();
    let stored = response.clone();
    if let Err(e) = run_blocking(move || storage.open(&tile_cache)?.put(&request, stored)).await {
        warn!(url = %url, error = %e, "Failed to store tile");
    }

    Ok(response)
}
