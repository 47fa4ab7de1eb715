use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::timeout;

use crate::{
    config::Settings,
    error::ApiError,
    models::{
        CandidateHosts, DiscoveryOutcome, FailureKind, HostObservation, ScanHost, SourceFailure,
        SourceName,
    },
    services::{
        external::{failure_kind, ExternalServicesManager, ScanInvoker, SourceAdapter, SubdomainEnumerator},
        report_normalizer,
    },
};

/// Tuning knobs of one discovery cycle
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    pub source_timeout: Duration,
    pub scan_timeout: Duration,
    pub concurrency: usize,
    pub default_subdomain: String,
}

impl DiscoveryOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            source_timeout: settings.source_timeout(),
            scan_timeout: settings.scan_timeout(),
            concurrency: settings.discovery_concurrency.max(1) as usize,
            default_subdomain: settings.default_subdomain.clone(),
        }
    }
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            source_timeout: Duration::from_secs(20),
            scan_timeout: Duration::from_secs(300),
            concurrency: 16,
            default_subdomain: "www".to_string(),
        }
    }
}

type CallResult = Result<Vec<HostObservation>, SourceFailure>;

/// Aborts every spawned call when the cycle itself is dropped, so a
/// cancelled run leaves nothing running behind it.
struct AbortOnDrop(Vec<AbortHandle>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

/// Fans out to the active scanner and every passive adapter for each
/// candidate host and collects one result per (host, source) call.
pub struct DiscoveryService {
    enumerator: Arc<dyn SubdomainEnumerator>,
    adapters: Vec<Arc<dyn SourceAdapter>>,
    scanner: Option<Arc<dyn ScanInvoker>>,
    options: DiscoveryOptions,
}

impl DiscoveryService {
    pub fn new(
        enumerator: Arc<dyn SubdomainEnumerator>,
        adapters: Vec<Arc<dyn SourceAdapter>>,
        scanner: Option<Arc<dyn ScanInvoker>>,
        options: DiscoveryOptions,
    ) -> Self {
        Self {
            enumerator,
            adapters,
            scanner,
            options,
        }
    }

    pub fn from_manager(manager: Arc<ExternalServicesManager>, settings: &Settings) -> Self {
        let adapters = manager.adapters().to_vec();
        let scanner = manager.scanner();
        Self::new(manager, adapters, scanner, DiscoveryOptions::from_settings(settings))
    }

    /// Probe list for a root domain: enumerated subdomains plus hints, or the
    /// default subdomain when both are empty.
    pub async fn candidate_hosts(&self, root_domain: &str, hints: &[String]) -> CandidateHosts {
        let mut names = self.enumerator.enumerate_subdomains(root_domain).await;
        names.extend(hints.iter().cloned());
        CandidateHosts::new(root_domain, names, &self.options.default_subdomain)
    }

    /// Run one discovery cycle. Individual source failures are returned as
    /// data; the only error is an unusable root domain.
    pub async fn discover(
        &self,
        organization_id: &str,
        root_domain: &str,
        hints: &[String],
    ) -> Result<DiscoveryOutcome, ApiError> {
        let root = root_domain.trim().trim_end_matches('.').to_ascii_lowercase();
        validate_root_domain(&root)?;

        let hosts = self.candidate_hosts(&root, hints).await;
        tracing::info!(
            organization_id,
            root_domain = %root,
            hosts = hosts.len(),
            sources = self.adapters.len() + usize::from(self.scanner.is_some()),
            "starting discovery cycle"
        );

        // every observation of the cycle carries the cycle's start time
        let cycle_at = Utc::now();
        let semaphore = Arc::new(Semaphore::new(self.options.concurrency));
        let mut calls: Vec<(String, SourceName, JoinHandle<CallResult>)> = Vec::new();

        for host in hosts.iter() {
            if let Some(scanner) = self.scanner.clone() {
                let task = scan_call(
                    scanner,
                    organization_id.to_string(),
                    root.clone(),
                    host.clone(),
                    cycle_at,
                    self.options.scan_timeout,
                );
                calls.push((host.clone(), SourceName::Nmap, spawn_limited(&semaphore, task)));
            }

            for adapter in &self.adapters {
                let task = adapter_call(
                    adapter.clone(),
                    organization_id.to_string(),
                    host.clone(),
                    cycle_at,
                    self.options.source_timeout,
                );
                calls.push((host.clone(), adapter.source(), spawn_limited(&semaphore, task)));
            }
        }

        let _abort_guard = AbortOnDrop(calls.iter().map(|(_, _, h)| h.abort_handle()).collect());

        let mut outcome = DiscoveryOutcome {
            hosts_probed: hosts.into_vec(),
            ..Default::default()
        };

        for (host, source, handle) in calls {
            match handle.await {
                Ok(Ok(observations)) => outcome.observations.extend(observations),
                Ok(Err(failure)) => {
                    tracing::warn!(
                        organization_id,
                        domain = %failure.domain,
                        source = %failure.source,
                        kind = ?failure.kind,
                        error = %failure.message,
                        "source call failed"
                    );
                    outcome.failures.push(failure);
                }
                Err(join_error) => {
                    let kind = if join_error.is_panic() {
                        FailureKind::Panicked
                    } else {
                        FailureKind::Cancelled
                    };
                    tracing::error!(
                        organization_id,
                        domain = %host,
                        source = %source,
                        error = %join_error,
                        "source call did not complete"
                    );
                    outcome.failures.push(SourceFailure {
                        domain: host,
                        source,
                        kind,
                        message: join_error.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            organization_id,
            root_domain = %root,
            observations = outcome.observations.len(),
            failures = outcome.failures.len(),
            "discovery cycle finished"
        );

        Ok(outcome)
    }
}

fn validate_root_domain(root: &str) -> Result<(), ApiError> {
    if root.is_empty() {
        return Err(ApiError::validation("root domain cannot be empty"));
    }
    if root.starts_with('-')
        || root.starts_with('.')
        || root.contains("..")
        || !root
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
    {
        return Err(ApiError::validation(format!("invalid root domain: {}", root)));
    }
    Ok(())
}

fn spawn_limited<F>(semaphore: &Arc<Semaphore>, call: F) -> JoinHandle<CallResult>
where
    F: Future<Output = CallResult> + Send + 'static,
{
    let semaphore = semaphore.clone();
    tokio::spawn(async move {
        // the semaphore is never closed
        let _permit = semaphore.acquire_owned().await.ok();
        call.await
    })
}

async fn adapter_call(
    adapter: Arc<dyn SourceAdapter>,
    organization_id: String,
    host: String,
    observed_at: DateTime<Utc>,
    limit: Duration,
) -> CallResult {
    let source = adapter.source();
    let failure = |kind, message: String| SourceFailure {
        domain: host.clone(),
        source,
        kind,
        message,
    };

    let facts = match timeout(limit, adapter.fetch(&host)).await {
        Ok(Ok(facts)) => facts,
        Ok(Err(e)) => return Err(failure(failure_kind(&e), e.to_string())),
        Err(_) => {
            return Err(failure(
                FailureKind::Timeout,
                format!("no answer within {:?}", limit),
            ))
        }
    };

    if facts.is_empty() {
        tracing::debug!(domain = %host, source = %source, "source has no facts for host");
        return Ok(Vec::new());
    }

    Ok(vec![HostObservation::new(
        &organization_id,
        &host,
        source,
        observed_at,
        facts,
    )])
}

async fn scan_call(
    scanner: Arc<dyn ScanInvoker>,
    organization_id: String,
    root_domain: String,
    host: String,
    observed_at: DateTime<Utc>,
    limit: Duration,
) -> CallResult {
    let failure = |kind, message: String| SourceFailure {
        domain: host.clone(),
        source: SourceName::Nmap,
        kind,
        message,
    };

    let report = match timeout(limit, scanner.scan(&host)).await {
        Ok(Ok(report)) => report,
        Ok(Err(e)) => return Err(failure(failure_kind(&e), e.to_string())),
        Err(_) => {
            return Err(failure(
                FailureKind::Timeout,
                format!("scan did not finish within {:?}", limit),
            ))
        }
    };

    let scan_hosts = report_normalizer::normalize(&report)
        .map_err(|e| failure(FailureKind::Parse, e.to_string()))?;

    Ok(scan_observations(
        &organization_id,
        &root_domain,
        &host,
        scan_hosts,
        observed_at,
    ))
}

/// Observations for the hosts of one scan report. A host entry is filed under
/// its own hostname when that lies inside `root_domain`, otherwise under the
/// scanned target. The first entry wins when two map to the same domain.
pub fn scan_observations(
    organization_id: &str,
    root_domain: &str,
    target: &str,
    scan_hosts: Vec<ScanHost>,
    observed_at: DateTime<Utc>,
) -> Vec<HostObservation> {
    let mut seen = HashSet::new();
    let mut observations = Vec::new();

    for scan_host in scan_hosts {
        let domain = scan_host
            .hostname_within(root_domain)
            .unwrap_or(target)
            .to_ascii_lowercase();
        if !seen.insert(domain.clone()) {
            tracing::debug!(domain = %domain, "skipping duplicate scan entry for host");
            continue;
        }
        let facts = scan_host.into_facts();
        if facts.is_empty() {
            continue;
        }
        observations.push(HostObservation::new(
            organization_id,
            &domain,
            SourceName::Nmap,
            observed_at,
            facts,
        ));
    }

    observations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{HostFacts, Port};
    use async_trait::async_trait;

    struct NoSubdomains;

    #[async_trait]
    impl SubdomainEnumerator for NoSubdomains {
        async fn enumerate_subdomains(&self, _root_domain: &str) -> Vec<String> {
            Vec::new()
        }
    }

    struct SlowAdapter;

    #[async_trait]
    impl SourceAdapter for SlowAdapter {
        fn source(&self) -> SourceName {
            SourceName::Zoomeye
        }

        async fn fetch(&self, _domain: &str) -> Result<HostFacts, ApiError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(HostFacts::default())
        }
    }

    struct PanickingAdapter;

    #[async_trait]
    impl SourceAdapter for PanickingAdapter {
        fn source(&self) -> SourceName {
            SourceName::Virustotal
        }

        async fn fetch(&self, _domain: &str) -> Result<HostFacts, ApiError> {
            panic!("adapter bug");
        }
    }

    struct FixedAdapter;

    #[async_trait]
    impl SourceAdapter for FixedAdapter {
        fn source(&self) -> SourceName {
            SourceName::Shodan
        }

        async fn fetch(&self, _domain: &str) -> Result<HostFacts, ApiError> {
            Ok(HostFacts {
                ports: vec![Port::new("tcp", 443)],
                ..Default::default()
            })
        }
    }

    enum ScanBehavior {
        Report(&'static str),
        Hang,
        Fail,
    }

    struct StubScanner(ScanBehavior);

    #[async_trait]
    impl ScanInvoker for StubScanner {
        async fn scan(&self, host: &str) -> Result<Vec<u8>, ApiError> {
            match self.0 {
                ScanBehavior::Report(report) => Ok(report.as_bytes().to_vec()),
                ScanBehavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(Vec::new())
                }
                ScanBehavior::Fail => Err(ApiError::external_service(format!(
                    "nmap exited with status 1 for {}",
                    host
                ))),
            }
        }
    }

    const REPORT: &str = r#"<nmaprun><host>
        <address addr="10.0.0.7" addrtype="ipv4"/>
        <hostnames><hostname name="www.example.com" type="user"/></hostnames>
        <ports><port protocol="tcp" portid="22"><state state="open"/></port></ports>
    </host></nmaprun>"#;

    fn scanning_service(behavior: ScanBehavior) -> DiscoveryService {
        DiscoveryService::new(
            Arc::new(NoSubdomains),
            vec![Arc::new(FixedAdapter)],
            Some(Arc::new(StubScanner(behavior))),
            DiscoveryOptions {
                source_timeout: Duration::from_secs(5),
                scan_timeout: Duration::from_millis(50),
                ..Default::default()
            },
        )
    }

    fn assert_only_scan_failed(outcome: &DiscoveryOutcome, kind: FailureKind) {
        assert_eq!(outcome.observations.len(), 1);
        assert_eq!(outcome.observations[0].source, SourceName::Shodan);
        assert_eq!(outcome.failures.len(), 1);
        let failure = &outcome.failures[0];
        assert_eq!(failure.domain, "www.example.com");
        assert_eq!(failure.source, SourceName::Nmap);
        assert_eq!(failure.kind, kind);
    }

    #[tokio::test]
    async fn test_malformed_scan_report_is_a_parse_failure() {
        let discovery = scanning_service(ScanBehavior::Report("Starting Nmap 7.94 ..."));
        let outcome = discovery.discover("org1", "example.com", &[]).await.unwrap();
        assert_only_scan_failed(&outcome, FailureKind::Parse);
    }

    #[tokio::test]
    async fn test_scan_timeout_is_isolated() {
        let discovery = scanning_service(ScanBehavior::Hang);
        let outcome = discovery.discover("org1", "example.com", &[]).await.unwrap();
        assert_only_scan_failed(&outcome, FailureKind::Timeout);
    }

    #[tokio::test]
    async fn test_scan_error_is_isolated() {
        let discovery = scanning_service(ScanBehavior::Fail);
        let outcome = discovery.discover("org1", "example.com", &[]).await.unwrap();

        assert_only_scan_failed(&outcome, FailureKind::Network);
        assert!(outcome.failures[0].message.contains("www.example.com"));
    }

    #[tokio::test]
    async fn test_cycle_observations_share_one_timestamp() {
        let discovery = scanning_service(ScanBehavior::Report(REPORT));
        let outcome = discovery.discover("org1", "example.com", &[]).await.unwrap();

        assert!(outcome.failures.is_empty());
        assert_eq!(outcome.observations.len(), 2);
        assert_eq!(
            outcome.observations[0].observed_at,
            outcome.observations[1].observed_at
        );
    }

    fn service(adapters: Vec<Arc<dyn SourceAdapter>>) -> DiscoveryService {
        DiscoveryService::new(
            Arc::new(NoSubdomains),
            adapters,
            None,
            DiscoveryOptions {
                source_timeout: Duration::from_millis(50),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_timeout_and_panic_are_isolated() {
        let discovery = service(vec![
            Arc::new(SlowAdapter),
            Arc::new(PanickingAdapter),
            Arc::new(FixedAdapter),
        ]);

        let outcome = discovery.discover("org1", "Example.com", &[]).await.unwrap();

        assert_eq!(outcome.hosts_probed, vec!["www.example.com"]);
        assert_eq!(outcome.observations.len(), 1);
        assert_eq!(outcome.observations[0].source, SourceName::Shodan);
        assert_eq!(outcome.observations[0].domain, "www.example.com");

        let kinds: Vec<_> = outcome.failures.iter().map(|f| (f.source, f.kind)).collect();
        assert!(kinds.contains(&(SourceName::Zoomeye, FailureKind::Timeout)));
        assert!(kinds.contains(&(SourceName::Virustotal, FailureKind::Panicked)));
    }

    #[tokio::test]
    async fn test_invalid_root_domain_is_rejected() {
        let discovery = service(vec![]);
        assert!(discovery.discover("org1", "  ", &[]).await.is_err());
        assert!(discovery.discover("org1", "-oX.evil", &[]).await.is_err());
        assert!(discovery.discover("org1", "exa mple.com", &[]).await.is_err());
    }

    #[test]
    fn test_scan_observations_file_under_hostname_or_target() {
        let inside = ScanHost {
            address: Some("10.0.0.1".into()),
            hostnames: vec!["api.example.com".into()],
            ..Default::default()
        };
        let outside = ScanHost {
            address: Some("10.0.0.2".into()),
            hostnames: vec!["edge.cdn.net".into()],
            ..Default::default()
        };
        let duplicate = ScanHost {
            address: Some("10.0.0.3".into()),
            hostnames: vec!["API.example.com".into()],
            ..Default::default()
        };

        let observations = scan_observations(
            "org1",
            "example.com",
            "www.example.com",
            vec![inside, outside, duplicate],
            Utc::now(),
        );

        let filed: Vec<_> = observations
            .iter()
            .map(|o| (o.domain.as_str(), o.facts.ip.as_deref()))
            .collect();
        assert_eq!(
            filed,
            vec![
                ("api.example.com", Some("10.0.0.1")),
                ("www.example.com", Some("10.0.0.2"))
            ]
        );
    }
}
