#![allow(dead_code)]

use async_trait::async_trait;
use axum::Router;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use asset_recon::{
    config::Settings,
    create_router,
    error::ApiError,
    models::{DiscoveryStatus, HostFacts, SourceName},
    repositories::{AssetRepository, InMemoryAssetRepository},
    services::{
        external::{ScanInvoker, SourceAdapter, SubdomainEnumerator},
        DiscoveryOptions, DiscoveryService,
    },
    AppState,
};

pub const SCAN_REPORT: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<nmaprun scanner="nmap" args="nmap -sV -O -oX - sub.example.com">
  <host>
    <status state="up" reason="echo-reply"/>
    <address addr="93.184.216.34" addrtype="ipv4"/>
    <hostnames><hostname name="sub.example.com" type="user"/></hostnames>
    <ports>
      <port protocol="tcp" portid="80"><state state="open" reason="syn-ack" reason_ttl="53"/></port>
      <port protocol="tcp" portid="443"><state state="open" reason="syn-ack" reason_ttl="53"/></port>
    </ports>
    <os><osmatch name="Linux" accuracy="96" line="1"/></os>
    <distance value="11"/>
  </host>
</nmaprun>"#;

/// Enumerator returning a fixed list
pub struct StaticEnumerator(pub Vec<String>);

#[async_trait]
impl SubdomainEnumerator for StaticEnumerator {
    async fn enumerate_subdomains(&self, _root_domain: &str) -> Vec<String> {
        self.0.clone()
    }
}

/// Passive source answering with canned facts after an optional delay
pub struct FakeAdapter {
    pub source: SourceName,
    pub facts: HostFacts,
    pub delay: Duration,
    pub calls: AtomicUsize,
}

impl FakeAdapter {
    pub fn new(source: SourceName, facts: HostFacts) -> Self {
        Self {
            source,
            facts,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl SourceAdapter for FakeAdapter {
    fn source(&self) -> SourceName {
        self.source
    }

    async fn fetch(&self, _domain: &str) -> Result<HostFacts, ApiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self.facts.clone())
    }
}

/// Passive source that always fails
pub struct FailingAdapter(pub SourceName);

#[async_trait]
impl SourceAdapter for FailingAdapter {
    fn source(&self) -> SourceName {
        self.0
    }

    async fn fetch(&self, domain: &str) -> Result<HostFacts, ApiError> {
        Err(ApiError::external_service(format!("upstream refused {}", domain)))
    }
}

/// Scanner replaying a fixed nmap XML report after an optional delay
pub struct FakeScanner {
    pub report: String,
    pub delay: Duration,
}

impl FakeScanner {
    pub fn new(report: &str) -> Self {
        Self {
            report: report.to_string(),
            delay: Duration::ZERO,
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl ScanInvoker for FakeScanner {
    async fn scan(&self, _host: &str) -> Result<Vec<u8>, ApiError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self.report.clone().into_bytes())
    }
}

pub fn test_settings() -> Settings {
    Settings::from_defaults().expect("default settings are valid")
}

pub fn discovery_service(
    subdomains: Vec<&str>,
    adapters: Vec<Arc<dyn SourceAdapter>>,
    scanner: Option<Arc<dyn ScanInvoker>>,
) -> DiscoveryService {
    DiscoveryService::new(
        Arc::new(StaticEnumerator(
            subdomains.into_iter().map(str::to_string).collect(),
        )),
        adapters,
        scanner,
        DiscoveryOptions {
            source_timeout: Duration::from_secs(2),
            scan_timeout: Duration::from_secs(2),
            ..DiscoveryOptions::default()
        },
    )
}

/// App state over the in-memory store
pub fn create_test_state(discovery: DiscoveryService) -> (AppState, Arc<InMemoryAssetRepository>) {
    let repo = Arc::new(InMemoryAssetRepository::new());
    let asset_repo: Arc<dyn AssetRepository> = repo.clone();
    let state = AppState::with_components(test_settings(), asset_repo, discovery)
        .expect("test state");
    (state, repo)
}

pub fn create_test_app() -> (Router, AppState, Arc<InMemoryAssetRepository>) {
    let (state, repo) = create_test_state(discovery_service(vec![], vec![], None));
    (create_router(state.clone()), state, repo)
}

/// Poll until the organization's run leaves the running state
pub async fn wait_for_run(state: &AppState, organization_id: &str) -> DiscoveryStatus {
    for _ in 0..300 {
        let status = state.run_manager.status(organization_id).await;
        if !status.is_running() {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("discovery run for {} did not finish", organization_id);
}

pub async fn extract_body(response: axum::response::Response) -> Vec<u8> {
    use axum::body::to_bytes;
    let body = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
    body.to_vec()
}
