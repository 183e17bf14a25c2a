//! Network access for intercepted requests

pub mod client;
pub mod errors;
pub mod types;

pub use client::{ErrorEntry, OriginClient};
pub use errors::FetchError;
pub use types::*;
