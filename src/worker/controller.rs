//! Worker Controller
//!
//! Owns the active version and the connected clients. Installs and activates
//! the configured version, claims clients on activation, and dispatches each
//! client request either through the active router or, for uncontrolled
//! clients, straight to the network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::classify::Classifier;
use super::lifecycle::{self, WorkerState};
use super::router::{ResponseSource, Routed, Router};
use crate::cache::{run_blocking, CacheStorage};
use crate::config::WorkerConfig;
use crate::origin::{ErrorEntry, FetchError, FetchRequest, OriginClient};

/// Identifier of a connected client page
pub type ClientId = u64;

/// Per-namespace summary for status reporting
#[derive(Debug, Clone)]
pub struct NamespaceSummary {
    pub name: String,
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Snapshot of the controller for status reporting
#[derive(Debug, Clone)]
pub struct ControllerStatus {
    /// Configured version (static cache name)
    pub version: String,
    /// Version currently routing requests, if any
    pub active_version: Option<String>,
    /// State of the configured version
    pub state: WorkerState,
    /// Connected clients
    pub clients: usize,
    /// Connected clients routed by the active version
    pub controlled: usize,
    /// Last observed reachability
    pub network: &'static str,
    pub namespaces: Vec<NamespaceSummary>,
    /// Most recent failed fetches, oldest first
    pub recent_errors: Vec<ErrorEntry>,
}

/// Coordinates lifecycle, clients and routing
pub struct WorkerController {
    config: WorkerConfig,
    storage: Arc<CacheStorage>,
    origin: OriginClient,
    /// Router of the active version
    active: RwLock<Option<Arc<Router>>>,
    /// State of the configured version
    state: RwLock<WorkerState>,
    /// Connected clients and the version controlling each
    clients: RwLock<HashMap<ClientId, Option<String>>>,
    next_client: AtomicU64,
}

impl WorkerController {
    /// Open cache storage and the network client for a configuration
    pub fn new(config: WorkerConfig) -> Result<Self> {
        let storage = Arc::new(CacheStorage::open_root(
            config.cache_root(),
            config.hot_entries,
        )?);
        let origin = OriginClient::new(config.request_timeout())?;

        Ok(Self {
            config,
            storage,
            origin,
            active: RwLock::new(None),
            state: RwLock::new(WorkerState::Parsed),
            clients: RwLock::new(HashMap::new()),
            next_client: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<CacheStorage> {
        &self.storage
    }

    /// Bring the configured version into service
    ///
    /// Resumes it when it is already the recorded active version, otherwise
    /// installs and activates it. A recorded older version keeps routing
    /// while the install runs and stays in control if the install fails.
    pub async fn start(&self) -> Result<()> {
        if self.resume().await? {
            return Ok(());
        }
        self.install_and_activate().await
    }

    /// Resume the recorded active version without reinstalling
    ///
    /// The recorded version takes control even when it is not the configured
    /// one. Returns true only when the configured version is the one resumed.
    pub async fn resume(&self) -> Result<bool> {
        let root = self.storage.root().to_path_buf();
        let record = match run_blocking(move || lifecycle::load_record(&root)).await? {
            Some(record) => record,
            None => return Ok(false),
        };

        if !self.storage.has(&record.active_version) {
            warn!(version = %record.active_version, "Recorded version has no static cache");
            return Ok(false);
        }

        info!(version = %record.active_version, "Resuming active version");
        self.set_active(record.active_version.clone(), record.tile_cache.clone())
            .await;
        self.claim().await;

        if record.matches(&self.config) {
            *self.state.write().await = WorkerState::Activated;
            return Ok(true);
        }

        info!(
            recorded = %record.active_version,
            configured = %self.config.static_cache,
            "Configured version differs from the active one"
        );
        Ok(false)
    }

    /// Install the configured version, then activate it right away
    ///
    /// A failed install marks the version redundant and leaves any previously
    /// active version routing requests.
    pub async fn install_and_activate(&self) -> Result<()> {
        *self.state.write().await = WorkerState::Installing;

        if let Err(e) = lifecycle::install(&self.storage, &self.origin, &self.config).await {
            error!(version = %self.config.static_cache, error = %e, "Install failed");
            *self.state.write().await = WorkerState::Redundant;
            return Err(e);
        }
        *self.state.write().await = WorkerState::Installed;

        // Skip waiting: activate without waiting for clients of the old version
        *self.state.write().await = WorkerState::Activating;
        if let Err(e) = lifecycle::activate(&self.storage, &self.config).await {
            error!(version = %self.config.static_cache, error = %e, "Activation failed");
            *self.state.write().await = WorkerState::Redundant;
            return Err(e);
        }

        self.set_active(
            self.config.static_cache.clone(),
            self.config.tile_cache.clone(),
        )
        .await;
        *self.state.write().await = WorkerState::Activated;
        self.claim().await;
        Ok(())
    }

    async fn set_active(&self, version: String, tile_cache: String) {
        let router = Router::new(
            version,
            tile_cache,
            Classifier::from_config(&self.config),
            Arc::clone(&self.storage),
            self.origin.clone(),
        );
        *self.active.write().await = Some(Arc::new(router));
    }

    /// Make the active version control every connected client
    pub async fn claim(&self) {
        let version = match self.active.read().await.as_ref() {
            Some(router) => router.version().to_string(),
            None => return,
        };

        let mut clients = self.clients.write().await;
        for controller in clients.values_mut() {
            *controller = Some(version.clone());
        }
        info!(version = %version, clients = clients.len(), "Claimed clients");
    }

    /// Register a newly connected client
    ///
    /// A client that connects while a version is active is controlled by it
    /// from the start.
    pub async fn connect_client(&self) -> ClientId {
        let id = self.next_client.fetch_add(1, Ordering::Relaxed);
        let controller = self
            .active
            .read()
            .await
            .as_ref()
            .map(|router| router.version().to_string());

        debug!(client = id, controlled = controller.is_some(), "Client connected");
        self.clients.write().await.insert(id, controller);
        id
    }

    pub async fn disconnect_client(&self, id: ClientId) {
        self.clients.write().await.remove(&id);
        debug!(client = id, "Client disconnected");
    }

    /// Handle one request issued by a client
    pub async fn fetch(&self, client: ClientId, request: FetchRequest) -> Result<Routed, FetchError> {
        let controlled = matches!(self.clients.read().await.get(&client), Some(Some(_)));
        let router = if controlled {
            self.active.read().await.clone()
        } else {
            None
        };

        match router {
            Some(router) => router.handle(request).await,
            None => {
                debug!(client = client, url = %request.url, "Uncontrolled client, going to network");
                let response = self.origin.fetch(&request).await?;
                Ok(Routed {
                    response,
                    source: ResponseSource::Network,
                    route: None,
                })
            }
        }
    }

    pub async fn status(&self) -> ControllerStatus {
        let active_version = self
            .active
            .read()
            .await
            .as_ref()
            .map(|router| router.version().to_string());
        let (clients, controlled) = {
            let clients = self.clients.read().await;
            (clients.len(), clients.values().filter(|c| c.is_some()).count())
        };

        let storage = Arc::clone(&self.storage);
        let namespaces: Vec<NamespaceSummary> = run_blocking(move || {
            Ok(storage
                .namespaces()
                .iter()
                .map(|ns| {
                    ns.log_metrics();
                    let (hits, misses, _) = ns.stats();
                    NamespaceSummary {
                        name: ns.name().to_string(),
                        entries: ns.len(),
                        hits,
                        misses,
                    }
                })
                .collect())
        })
        .await
        .unwrap_or_else(|e| {
            warn!(error = %e, "Failed to summarize namespaces");
            Vec::new()
        });

        ControllerStatus {
            version: self.config.static_cache.clone(),
            active_version,
            state: *self.state.read().await,
            clients,
            controlled,
            network: self.origin.network_status(),
            namespaces,
            recent_errors: self.origin.recent_errors(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn shell_server() -> MockServer {
        let server = MockServer::start().await;
        for (route, body) in [("/", "<html>"), ("/manifest.json", "{}")] {
            Mock::given(method("GET"))
                .and(path(route))
                .respond_with(ResponseTemplate::new(200).set_body_string(body))
                .mount(&server)
                .await;
        }
        server
    }

    fn config(server: &MockServer, root: &std::path::Path) -> WorkerConfig {
        WorkerConfig {
            origin: Url::parse(&server.uri()).unwrap(),
            shell_assets: vec!["/".to_string(), "/manifest.json".to_string()],
            cache_dir: Some(root.to_path_buf()),
            ..WorkerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_start_installs_activates_and_claims() {
        let server = shell_server().await;
        let root = tempfile::tempdir().unwrap();
        let controller = WorkerController::new(config(&server, root.path())).unwrap();

        let early = controller.connect_client().await;
        assert_eq!(controller.status().await.controlled, 0);

        controller.start().await.unwrap();

        let status = controller.status().await;
        assert_eq!(status.state, WorkerState::Activated);
        assert_eq!(status.active_version.as_deref(), Some("field-shell-v4"));
        assert_eq!(status.clients, 1);
        assert_eq!(status.controlled, 1);

        // The early client is now served from the shell cache
        let url = controller.config().resolve("/manifest.json").unwrap();
        let routed = controller.fetch(early, FetchRequest::get(url)).await.unwrap();
        assert_eq!(routed.source, ResponseSource::Cache);
    }

    #[tokio::test]
    async fn test_uncontrolled_client_goes_to_network() {
        let server = shell_server().await;
        let root = tempfile::tempdir().unwrap();
        let controller = WorkerController::new(config(&server, root.path())).unwrap();

        let client = controller.connect_client().await;
        let url = controller.config().resolve("/manifest.json").unwrap();
        let routed = controller.fetch(client, FetchRequest::get(url)).await.unwrap();

        assert_eq!(routed.route, None);
        assert_eq!(routed.source, ResponseSource::Network);
    }

    #[tokio::test]
    async fn test_restart_resumes_without_reinstalling() {
        let server = shell_server().await;
        let root = tempfile::tempdir().unwrap();
        WorkerController::new(config(&server, root.path()))
            .unwrap()
            .start()
            .await
            .unwrap();

        // Shell is no longer served; a reinstall would fail
        server.reset().await;

        let controller = WorkerController::new(config(&server, root.path())).unwrap();
        assert!(controller.resume().await.unwrap());
        controller.start().await.unwrap();
        assert_eq!(controller.status().await.state, WorkerState::Activated);
    }

    #[tokio::test]
    async fn test_failed_install_keeps_previous_version() {
        let server = shell_server().await;
        let root = tempfile::tempdir().unwrap();
        let controller = WorkerController::new(config(&server, root.path())).unwrap();
        controller.start().await.unwrap();

        server.reset().await;
        assert!(controller.install_and_activate().await.is_err());

        let status = controller.status().await;
        assert_eq!(status.state, WorkerState::Redundant);
        assert_eq!(status.active_version.as_deref(), Some("field-shell-v4"));
    }

    #[tokio::test]
    async fn test_failed_bump_after_restart_keeps_recorded_version() {
        let server = shell_server().await;
        let root = tempfile::tempdir().unwrap();
        WorkerController::new(config(&server, root.path()))
            .unwrap()
            .start()
            .await
            .unwrap();

        // Offline restart with a new version: its install cannot succeed
        server.reset().await;
        let bumped = WorkerConfig {
            static_cache: "field-shell-v5".to_string(),
            ..config(&server, root.path())
        };
        let controller = WorkerController::new(bumped).unwrap();
        assert!(controller.start().await.is_err());

        let status = controller.status().await;
        assert_eq!(status.state, WorkerState::Redundant);
        assert_eq!(status.active_version.as_deref(), Some("field-shell-v4"));

        let client = controller.connect_client().await;
        let url = controller.config().resolve("/manifest.json").unwrap();
        let routed = controller.fetch(client, FetchRequest::get(url)).await.unwrap();
        assert_eq!(routed.source, ResponseSource::Cache);
        assert_eq!(routed.response.body, b"{}");
    }

    #[tokio::test]
    async fn test_version_bump_replaces_static_cache() {
        let server = shell_server().await;
        let root = tempfile::tempdir().unwrap();
        WorkerController::new(config(&server, root.path()))
            .unwrap()
            .start()
            .await
            .unwrap();

        let bumped = WorkerConfig {
            static_cache: "field-shell-v5".to_string(),
            ..config(&server, root.path())
        };
        let controller = WorkerController::new(bumped).unwrap();
        assert!(!controller.resume().await.unwrap());
        controller.start().await.unwrap();

        let names: Vec<String> = controller.storage().keys();
        assert_eq!(names, vec!["field-shell-v5"]);
    }
}
