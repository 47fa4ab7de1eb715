use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::observation::{HostObservation, SourceFailure};

// ============================================================================
// Candidate hosts - the non-empty probe list of one discovery cycle
// ============================================================================

/// Fully-qualified hosts to probe. Never empty: construction falls back to
/// `<default_subdomain>.<root_domain>` when nothing else is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateHosts {
    first: String,
    rest: Vec<String>,
}

impl CandidateHosts {
    pub fn new(root_domain: &str, names: Vec<String>, default_subdomain: &str) -> Self {
        let root = normalize_host(root_domain);
        let mut unique: BTreeSet<String> = names
            .iter()
            .map(|name| qualify(name, &root))
            .filter(|name| !name.is_empty())
            .collect();

        if unique.is_empty() {
            unique.insert(qualify(default_subdomain, &root));
        }

        let mut hosts = unique.into_iter();
        // unique is non-empty here
        let first = hosts.next().unwrap_or_else(|| root.clone());
        Self {
            first,
            rest: hosts.collect(),
        }
    }

    pub fn first(&self) -> &str {
        &self.first
    }

    pub fn len(&self) -> usize {
        1 + self.rest.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        std::iter::once(&self.first).chain(self.rest.iter())
    }

    pub fn into_vec(self) -> Vec<String> {
        let mut hosts = Vec::with_capacity(1 + self.rest.len());
        hosts.push(self.first);
        hosts.extend(self.rest);
        hosts
    }
}

fn normalize_host(name: &str) -> String {
    name.trim()
        .trim_start_matches("*.")
        .trim_end_matches('.')
        .to_ascii_lowercase()
}

/// Expand a bare label (`api`) into `api.<root>`; keep names already inside root.
fn qualify(name: &str, root: &str) -> String {
    let name = normalize_host(name);
    if name.is_empty() {
        return name;
    }
    if name == root || name.ends_with(&format!(".{}", root)) {
        name
    } else if name.contains('.') {
        // a foreign fqdn; not part of this organization's root domain
        String::new()
    } else {
        format!("{}.{}", name, root)
    }
}

// ============================================================================
// Discovery cycle output and ingestion report
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryOutcome {
    pub hosts_probed: Vec<String>,
    pub observations: Vec<HostObservation>,
    pub failures: Vec<SourceFailure>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestReport {
    pub hosts_created: usize,
    pub hosts_updated: usize,
    /// Hosts where at least one source failed and at least one succeeded.
    pub degraded_hosts: usize,
    pub failed_sources: Vec<SourceFailure>,
    /// Hosts whose write-back failed in the store.
    pub store_errors: Vec<String>,
}

impl IngestReport {
    pub fn is_total_failure(&self) -> bool {
        self.hosts_created == 0 && self.hosts_updated == 0
    }
}

// ============================================================================
// Discovery run tracking
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryRunStatus {
    #[default]
    Idle,
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryStatus {
    pub status: DiscoveryRunStatus,
    pub root_domain: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub hosts_probed: usize,
    pub report: Option<IngestReport>,
    pub errors: Vec<String>,
}

impl DiscoveryStatus {
    pub fn is_running(&self) -> bool {
        self.status == DiscoveryRunStatus::Running
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryRequest {
    pub root_domain: String,
    #[serde(default)]
    pub subdomains: Vec<String>,
}
