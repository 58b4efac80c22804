//! Outbound upstream access: pacing, retry policy, and the fetch client.

mod backoff;
mod client;
mod limiter;
mod urls;

pub use backoff::{Backoff, RetryPolicy};
pub use client::FetchClient;
pub use limiter::RequestPacer;
pub use urls::UpstreamUrls;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Classified outcome of upstream retrieval.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("resource not found upstream")]
    NotFound,
    #[error("upstream unavailable after {attempts} attempts")]
    Unavailable { attempts: u32 },
    #[error("upstream rejected the request with status {status}")]
    BadRequest { status: u16 },
    #[error("failed to read upstream payload: {0}")]
    Payload(String),
}

impl FetchError {
    /// Transient failures may be answered from a stale cache entry;
    /// `NotFound` and `BadRequest` never are.
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Unavailable { .. } | FetchError::Payload(_))
    }
}

/// Seam between the caches and the network. Production uses [`FetchClient`];
/// tests substitute fakes with scripted responses.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError>;
}
