//! Origin Client
//!
//! Performs the real network fetches behind every strategy: shell assets at
//! install time, tile refreshes, and pass-through requests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{Client, Method};
use tracing::{debug, warn};
use url::Url;

use super::errors::FetchError;
use super::types::{FetchRequest, HttpResponse};

/// Maximum number of recent errors to track
const MAX_ERROR_HISTORY: usize = 10;

/// Request headers that belong to the client connection, not the request
const SKIPPED_HEADERS: &[&str] = &["host", "connection", "content-length", "transfer-encoding"];

/// Reachability values
pub const NETWORK_ONLINE: u8 = 0;
pub const NETWORK_OFFLINE: u8 = 1;

/// A recent fetch failure
#[derive(Debug, Clone)]
pub struct ErrorEntry {
    pub timestamp: u64,
    pub url: String,
    pub error: String,
}

/// HTTP client shared by all strategies
#[derive(Clone)]
pub struct OriginClient {
    /// HTTP client for making requests
    http_client: Client,
    /// Reachability as observed by the last fetch (0=online, 1=offline)
    network: Arc<AtomicU8>,
    /// Recent error log
    error_log: Arc<RwLock<VecDeque<ErrorEntry>>>,
}

impl OriginClient {
    /// Create a client with the given per-request timeout
    pub fn new(timeout: Duration) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http_client,
            network: Arc::new(AtomicU8::new(NETWORK_ONLINE)),
            error_log: Arc::new(RwLock::new(VecDeque::with_capacity(MAX_ERROR_HISTORY))),
        })
    }

    /// Fetch a request from the network
    ///
    /// Any HTTP status is a successful fetch; only transport failures are
    /// returned as errors.
    pub async fn fetch(&self, request: &FetchRequest) -> Result<HttpResponse, FetchError> {
        let url = request.url.as_str();
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|e| FetchError::InvalidRequest(format!("{}: {}", request.method, e)))?;

        debug!(method = %method, url = %url, "Fetching from network");

        let mut builder = self.http_client.request(method, request.url.clone());
        for (name, value) in &request.headers {
            if SKIPPED_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h)) {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let result = self.send(url, builder).await;
        match &result {
            Ok(_) => self.network.store(NETWORK_ONLINE, Ordering::Relaxed),
            Err(e) => {
                if e.is_network() {
                    self.network.store(NETWORK_OFFLINE, Ordering::Relaxed);
                }
                self.log_error(url, &e.to_string());
            }
        }
        result
    }

    /// Fetch a URL with GET and require a 2xx status
    pub async fn fetch_ok(&self, url: &Url) -> Result<HttpResponse, FetchError> {
        let response = self.fetch(&FetchRequest::get(url.clone())).await?;
        if !response.is_ok() {
            warn!(url = %url, status = response.status, "Fetch returned non-success status");
            return Err(FetchError::BadStatus {
                url: url.to_string(),
                status: response.status,
            });
        }
        Ok(response)
    }

    async fn send(
        &self,
        url: &str,
        builder: reqwest::RequestBuilder,
    ) -> Result<HttpResponse, FetchError> {
        let response = builder
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(url, e))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    String::from_utf8_lossy(v.as_bytes()).into_owned(),
                )
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::from_reqwest(url, e))?;

        debug!(url = %url, status = status, size = body.len(), "Network response");
        Ok(HttpResponse {
            url: url.to_string(),
            status,
            headers,
            body: body.to_vec(),
        })
    }

    /// Log an error to the error history ring buffer
    fn log_error(&self, url: &str, error: &str) {
        let entry = ErrorEntry {
            timestamp: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            url: url.to_string(),
            error: error.to_string(),
        };

        let mut log = self.error_log.write().unwrap_or_else(PoisonError::into_inner);
        if log.len() >= MAX_ERROR_HISTORY {
            log.pop_front();
        }
        log.push_back(entry);
    }

    /// Reachability string as seen by the most recent fetch
    pub fn network_status(&self) -> &'static str {
        match self.network.load(Ordering::Relaxed) {
            NETWORK_ONLINE => "online",
            _ => "offline",
        }
    }

    /// Get recent errors
    pub fn recent_errors(&self) -> Vec<ErrorEntry> {
        let log = self.error_log.read().unwrap_or_else(PoisonError::into_inner);
        log.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_bytes, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client() -> OriginClient {
        OriginClient::new(Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_returns_error_statuses_as_responses() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404).set_body_string("nope"))
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/missing", server.uri())).unwrap();
        let response = client().fetch(&FetchRequest::get(url)).await.unwrap();

        assert_eq!(response.status, 404);
        assert_eq!(response.body, b"nope");
    }

    #[tokio::test]
    async fn test_fetch_forwards_method_headers_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sync"))
            .and(header("content-type", "application/json"))
            .and(body_bytes(b"[]".to_vec()))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"status":"success"}"#))
            .expect(1)
            .mount(&server)
            .await;

        let request = FetchRequest {
            method: "POST".to_string(),
            url: Url::parse(&format!("{}/sync", server.uri())).unwrap(),
            headers: vec![
                ("Content-Type".to_string(), "application/json".to_string()),
                ("Host".to_string(), "ignored.example".to_string()),
            ],
            body: Some(b"[]".to_vec()),
        };
        let response = client().fetch(&request).await.unwrap();
        assert_eq!(response.status, 200);
    }

    #[tokio::test]
    async fn test_fetch_ok_rejects_non_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/manifest.json", server.uri())).unwrap();
        let err = client().fetch_ok(&url).await.unwrap_err();
        assert!(matches!(err, FetchError::BadStatus { status: 500, .. }));
    }

    #[tokio::test]
    async fn test_connection_refused_marks_offline() {
        // Bind then drop a listener to get a port nothing is serving on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = client();
        let url = Url::parse(&format!("http://127.0.0.1:{}/", port)).unwrap();
        let err = client.fetch(&FetchRequest::get(url)).await.unwrap_err();

        assert!(err.is_network());
        assert_eq!(client.network_status(), "offline");
        assert_eq!(client.recent_errors().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_method_is_rejected_before_sending() {
        let request = FetchRequest {
            method: "BAD METHOD".to_string(),
            ..FetchRequest::get(Url::parse("http://127.0.0.1:1/").unwrap())
        };
        let err = client().fetch(&request).await.unwrap_err();
        assert!(matches!(err, FetchError::InvalidRequest(_)));
    }
}
