//! Request and response types
//!
//! Owned representations of intercepted requests and the responses served
//! back to clients, shared by the origin client, cache storage and IPC layer.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use url::Url;

/// Serialize response bodies as base64 strings.
/// Bodies are arbitrary bytes (tiles are PNG/JPEG), so JSON arrays of numbers
/// would be several times larger than the payload.
pub mod base64_body {
    use base64::Engine;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(de::Error::custom)
    }
}

/// A request intercepted from a client page
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// HTTP method, upper case
    pub method: String,
    /// Absolute request URL (also the cache key)
    pub url: Url,
    /// Request headers in the order the client sent them
    pub headers: Vec<(String, String)>,
    /// Request body, forwarded for network-only calls
    pub body: Option<Vec<u8>>,
}

impl FetchRequest {
    /// Create a plain GET request
    pub fn get(url: Url) -> Self {
        Self {
            method: "GET".to_string(),
            url,
            headers: Vec::new(),
            body: None,
        }
    }

    /// Only GET requests can be stored in or matched from a namespace
    pub fn is_cacheable(&self) -> bool {
        self.method.eq_ignore_ascii_case("GET")
    }

    /// Cache key for this request
    pub fn cache_key(&self) -> &str {
        self.url.as_str()
    }
}

/// A response as received from the network or read back from cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpResponse {
    /// URL the response was fetched for
    pub url: String,
    /// HTTP status code
    pub status: u16,
    /// Response headers
    pub headers: Vec<(String, String)>,
    /// Response body
    #[serde(with = "base64_body")]
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Whether the status is 2xx
    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Look up a header value (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A response persisted in a cache namespace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEntry {
    /// Method of the request that produced the response
    pub method: String,
    /// Store time in milliseconds since epoch
    pub stored_at: u64,
    /// The stored response
    pub response: HttpResponse,
}

impl StoredEntry {
    pub fn new(request: &FetchRequest, response: HttpResponse) -> Self {
        Self {
            method: request.method.clone(),
            stored_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
            response,
        }
    }
}
