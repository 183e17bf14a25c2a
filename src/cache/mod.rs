//! Cache storage layer
//!
//! Named namespaces of URL-keyed responses persisted on disk, with a Moka
//! memory layer in front of each namespace.

pub mod namespace;
pub mod storage;

use anyhow::{Context, Result};

pub use namespace::Namespace;
pub use storage::CacheStorage;

/// Run synchronous cache I/O on the blocking pool
pub async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .context("Cache task panicked")?
}
