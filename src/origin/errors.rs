//! Fetch Error Types
//!
//! Failures of a single network fetch. Only transport problems count as
//! failures for routing; HTTP error statuses are ordinary responses except
//! while installing the shell.

/// Network fetch error types
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timeout: {0}")]
    Timeout(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Failed to read response body: {0}")]
    Body(String),

    #[error("Bad status ({status}) for {url}")]
    BadStatus { url: String, status: u16 },
}

impl FetchError {
    /// Whether this is a transport failure (no response at all)
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            FetchError::Network(_) | FetchError::Timeout(_) | FetchError::Body(_)
        )
    }

    /// Map a reqwest error onto the taxonomy
    pub fn from_reqwest(url: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout(url.to_string())
        } else if err.is_builder() {
            FetchError::InvalidRequest(format!("{}: {}", url, err))
        } else if err.is_body() || err.is_decode() {
            FetchError::Body(format!("{}: {}", url, err))
        } else {
            FetchError::Network(format!("{}: {}", url, err))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_status_is_not_a_network_failure() {
        let err = FetchError::BadStatus {
            url: "http://127.0.0.1:5000/manifest.json".to_string(),
            status: 404,
        };
        assert!(!err.is_network());
        assert_eq!(
            err.to_string(),
            "Bad status (404) for http://127.0.0.1:5000/manifest.json"
        );
    }

    #[test]
    fn test_transport_failures_are_network() {
        assert!(FetchError::Network("refused".into()).is_network());
        assert!(FetchError::Timeout("slow".into()).is_network());
        assert!(!FetchError::InvalidRequest("bad method".into()).is_network());
    }
}
