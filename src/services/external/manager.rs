use super::source::{ScanInvoker, SourceAdapter, SubdomainEnumerator};
use super::{CrtShClient, NmapScanner, ShodanAdapter, VirusTotalAdapter, ZoomEyeAdapter};
use crate::config::Settings;
use crate::error::ApiError;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

/// Owns every configured intelligence source: the passive adapters, the
/// active scanner and the subdomain listers.
pub struct ExternalServicesManager {
    crtsh_client: Option<CrtShClient>,
    virustotal: Option<Arc<VirusTotalAdapter>>,
    adapters: Vec<Arc<dyn SourceAdapter>>,
    scanner: Option<Arc<dyn ScanInvoker>>,
    subdomain_timeout: Duration,
}

impl ExternalServicesManager {
    /// Create a new external services manager with configured API clients
    pub fn new(settings: &Settings) -> Result<Self, ApiError> {
        let crtsh_client = if settings.enable_crtsh {
            Some(CrtShClient::new()?)
        } else {
            None
        };

        let mut adapters: Vec<Arc<dyn SourceAdapter>> = Vec::new();

        if let Some(key) = settings.shodan_api_key.clone() {
            adapters.push(Arc::new(ShodanAdapter::new(key)?));
        }
        if let Some(key) = settings.zoomeye_api_key.clone() {
            adapters.push(Arc::new(ZoomEyeAdapter::new(key)?));
        }
        let virustotal = match settings.virustotal_api_key.clone() {
            Some(key) => {
                let adapter = Arc::new(VirusTotalAdapter::new(key)?);
                adapters.push(adapter.clone());
                Some(adapter)
            }
            None => None,
        };

        let scanner: Option<Arc<dyn ScanInvoker>> = if settings.enable_active_scan {
            Some(Arc::new(NmapScanner::new(
                settings.nmap_path.clone(),
                settings.nmap_args.clone(),
            )))
        } else {
            None
        };

        tracing::info!(
            adapters = ?adapters.iter().map(|a| a.source()).collect::<Vec<_>>(),
            active_scan = scanner.is_some(),
            crtsh = crtsh_client.is_some(),
            "external sources configured"
        );

        Ok(Self {
            crtsh_client,
            virustotal,
            adapters,
            scanner,
            subdomain_timeout: settings.subdomain_timeout(),
        })
    }

    /// Manager with no subdomain listers, built from explicit sources.
    pub fn with_sources(
        adapters: Vec<Arc<dyn SourceAdapter>>,
        scanner: Option<Arc<dyn ScanInvoker>>,
    ) -> Self {
        Self {
            crtsh_client: None,
            virustotal: None,
            adapters,
            scanner,
            subdomain_timeout: Duration::from_secs(60),
        }
    }

    pub fn adapters(&self) -> &[Arc<dyn SourceAdapter>] {
        &self.adapters
    }

    pub fn scanner(&self) -> Option<Arc<dyn ScanInvoker>> {
        self.scanner.clone()
    }
}

#[async_trait]
impl SubdomainEnumerator for ExternalServicesManager {
    /// Union of crt.sh and VirusTotal listings. Each lister runs under its own
    /// timeout and a failing lister only loses its own names.
    async fn enumerate_subdomains(&self, root_domain: &str) -> Vec<String> {
        let crtsh = async {
            match self.crtsh_client.as_ref() {
                Some(client) => {
                    match tokio::time::timeout(self.subdomain_timeout, client.search_domain(root_domain)).await {
                        Ok(Ok(names)) => names,
                        Ok(Err(e)) => {
                            tracing::warn!(domain = root_domain, error = %e, "crt.sh enumeration failed");
                            Vec::new()
                        }
                        Err(_) => {
                            tracing::warn!(domain = root_domain, "crt.sh enumeration timed out");
                            Vec::new()
                        }
                    }
                }
                None => Vec::new(),
            }
        };

        let virustotal = async {
            match self.virustotal.as_ref() {
                Some(client) => {
                    match tokio::time::timeout(self.subdomain_timeout, client.get_subdomains(root_domain)).await {
                        Ok(Ok(names)) => names,
                        Ok(Err(e)) => {
                            tracing::warn!(domain = root_domain, error = %e, "VirusTotal enumeration failed");
                            Vec::new()
                        }
                        Err(_) => {
                            tracing::warn!(domain = root_domain, "VirusTotal enumeration timed out");
                            Vec::new()
                        }
                    }
                }
                None => Vec::new(),
            }
        };

        let (from_crtsh, from_virustotal) = tokio::join!(crtsh, virustotal);
        let all: BTreeSet<String> = from_crtsh
            .into_iter()
            .chain(from_virustotal)
            .map(|name| name.to_ascii_lowercase())
            .collect();

        tracing::info!(
            domain = root_domain,
            count = all.len(),
            "subdomain enumeration complete"
        );
        all.into_iter().collect()
    }
}
