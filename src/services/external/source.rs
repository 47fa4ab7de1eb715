use async_trait::async_trait;

use crate::error::ApiError;
use crate::models::{FailureKind, HostFacts, SourceName};

/// A passive intelligence provider queried once per host.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source(&self) -> SourceName;

    /// Facts the provider holds for `domain`. An empty `HostFacts` means the
    /// provider answered but knows nothing about the host.
    async fn fetch(&self, domain: &str) -> Result<HostFacts, ApiError>;
}

/// Runs an active scan against one host and returns the raw XML report.
#[async_trait]
pub trait ScanInvoker: Send + Sync {
    async fn scan(&self, host: &str) -> Result<Vec<u8>, ApiError>;
}

/// Lists known subdomains of a root domain. Provider failures are swallowed;
/// an empty list is a valid answer.
#[async_trait]
pub trait SubdomainEnumerator: Send + Sync {
    async fn enumerate_subdomains(&self, root_domain: &str) -> Vec<String>;
}

/// Failure category recorded for a source call that returned an error.
pub fn failure_kind(error: &ApiError) -> FailureKind {
    match error {
        ApiError::Timeout(_) => FailureKind::Timeout,
        ApiError::Parse(_) | ApiError::Serialization(_) => FailureKind::Parse,
        ApiError::HttpClient(e) if e.is_timeout() => FailureKind::Timeout,
        ApiError::HttpClient(e) if e.is_decode() => FailureKind::Parse,
        _ => FailureKind::Network,
    }
}
