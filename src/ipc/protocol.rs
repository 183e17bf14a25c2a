//! IPC protocol definitions for client communication
//!
//! Pages talk to the daemon with newline-delimited JSON over a Unix domain
//! socket. Each connection is one client; every `fetch` command on it is an
//! intercepted request.

use serde::{Deserialize, Serialize};

use crate::origin::types::base64_body;

/// Protocol version for future compatibility
pub const PROTOCOL_VERSION: u32 = 1;

/// Commands sent from a client page to the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Command {
    /// Intercept a request
    #[serde(rename_all = "camelCase")]
    Fetch {
        /// Absolute or origin-relative URL
        url: String,
        /// HTTP method (defaults to GET)
        #[serde(default)]
        method: Option<String>,
        /// Request headers
        #[serde(default)]
        headers: Vec<(String, String)>,
        /// Base64-encoded request body
        #[serde(default)]
        body: Option<String>,
    },
    /// Re-run install and activate for the configured version
    Install,
    /// List cache namespace names
    ListCaches,
    /// Get daemon status
    GetStatus,
}

/// Responses sent from the daemon to a client page
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Response {
    /// Result of an intercepted request
    #[serde(rename_all = "camelCase")]
    Fetched {
        status: u16,
        headers: Vec<(String, String)>,
        /// Base64-encoded response body
        #[serde(with = "base64_body")]
        body: Vec<u8>,
        /// "cache" or "network"
        source: String,
        /// "tile", "networkOnly", "cacheFirst" or "uncontrolled"
        strategy: String,
    },
    /// Cache namespace names
    #[serde(rename_all = "camelCase")]
    Caches { names: Vec<String> },
    /// Status response with daemon state
    #[serde(rename_all = "camelCase")]
    Status {
        /// Protocol version
        version: u32,
        /// Configured version (static cache name)
        configured_version: String,
        /// Version routing requests, if any
        active_version: Option<String>,
        /// Lifecycle state of the configured version
        state: String,
        /// Last observed reachability ("online" or "offline")
        network: String,
        /// Connected clients
        clients: usize,
        /// Clients routed by the active version
        controlled: usize,
        namespaces: Vec<NamespaceInfo>,
        /// Most recent failed fetches, oldest first
        recent_errors: Vec<ErrorInfo>,
    },
    /// Success response
    #[serde(rename_all = "camelCase")]
    Success {
        /// Optional success message
        message: Option<String>,
    },
    /// Error response
    #[serde(rename_all = "camelCase")]
    Error {
        /// Error message
        error: String,
    },
}

/// Information about one namespace (for status response)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceInfo {
    pub name: String,
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

/// A recent failed fetch (for status response)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    /// Seconds since epoch
    pub timestamp: u64,
    pub url: String,
    pub error: String,
}

/// Parse a JSON command from bytes
pub fn parse_command(data: &[u8]) -> Result<Command, serde_json::Error> {
    serde_json::from_slice(data)
}

/// Serialize a response to JSON bytes
pub fn serialize_response(response: &Response) -> Result<Vec<u8>, serde_json::Error> {
    let mut json = serde_json::to_vec(response)?;
    json.push(b'\n'); // Add newline delimiter
    Ok(json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_fetch_command() {
        let json = r#"{"type":"fetch","url":"/manifest.json"}"#;
        match parse_command(json.as_bytes()).unwrap() {
            Command::Fetch {
                url,
                method,
                headers,
                body,
            } => {
                assert_eq!(url, "/manifest.json");
                assert!(method.is_none());
                assert!(headers.is_empty());
                assert!(body.is_none());
            }
            _ => panic!("Expected Fetch command"),
        }
    }

    #[test]
    fn test_parse_sync_fetch_command() {
        let json = r#"{"type":"fetch","url":"/sync","method":"POST","headers":[["Content-Type","application/json"]],"body":"W10="}"#;
        match parse_command(json.as_bytes()).unwrap() {
            Command::Fetch {
                method,
                headers,
                body,
                ..
            } => {
                assert_eq!(method.as_deref(), Some("POST"));
                assert_eq!(headers[0].0, "Content-Type");
                assert_eq!(body.as_deref(), Some("W10="));
            }
            _ => panic!("Expected Fetch command"),
        }
    }

    #[test]
    fn test_parse_unit_commands() {
        assert!(matches!(
            parse_command(br#"{"type":"install"}"#).unwrap(),
            Command::Install
        ));
        assert!(matches!(
            parse_command(br#"{"type":"listCaches"}"#).unwrap(),
            Command::ListCaches
        ));
        assert!(matches!(
            parse_command(br#"{"type":"getStatus"}"#).unwrap(),
            Command::GetStatus
        ));
    }

    #[test]
    fn test_unknown_command_is_rejected() {
        assert!(parse_command(br#"{"type":"mount"}"#).is_err());
    }

    #[test]
    fn test_serialize_fetched_response() {
        let response = Response::Fetched {
            status: 200,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: b"{}".to_vec(),
            source: "cache".to_string(),
            strategy: "cacheFirst".to_string(),
        };
        let json = serialize_response(&response).unwrap();
        let json_str = String::from_utf8(json).unwrap();
        assert!(json_str.ends_with('\n'));
        assert!(json_str.contains(r#""type":"fetched""#));
        assert!(json_str.contains(r#""body":"e30=""#));
        assert!(json_str.contains(r#""strategy":"cacheFirst""#));
    }

    #[test]
    fn test_serialize_status_response() {
        let response = Response::Status {
            version: PROTOCOL_VERSION,
            configured_version: "field-shell-v4".to_string(),
            active_version: Some("field-shell-v4".to_string()),
            state: "activated".to_string(),
            network: "online".to_string(),
            clients: 2,
            controlled: 2,
            namespaces: vec![NamespaceInfo {
                name: "field-tiles-v1".to_string(),
                entries: 12,
                hits: 40,
                misses: 12,
            }],
            recent_errors: vec![ErrorInfo {
                timestamp: 1_700_000_000,
                url: "http://127.0.0.1:5000/sync".to_string(),
                error: "Network error: connection refused".to_string(),
            }],
        };
        let json_str = String::from_utf8(serialize_response(&response).unwrap()).unwrap();
        assert!(json_str.contains(r#""activeVersion":"field-shell-v4""#));
        assert!(json_str.contains("field-tiles-v1"));
        assert!(json_str.contains(r#""recentErrors":[{"timestamp":1700000000"#));
    }

    #[test]
    fn test_serialize_error_response() {
        let response = Response::Error {
            error: "Network error: connection refused".to_string(),
        };
        let json_str = String::from_utf8(serialize_response(&response).unwrap()).unwrap();
        assert!(json_str.contains(r#""type":"error""#));
        assert!(json_str.contains("connection refused"));
    }
}
