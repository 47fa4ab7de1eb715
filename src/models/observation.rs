use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Intelligence sources that can report on a host.
///
/// `Manual` never appears in an asset's provenance map; it only tags fields
/// that were edited through the asset endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceName {
    Nmap,
    Shodan,
    Zoomeye,
    Virustotal,
    Manual,
}

impl SourceName {
    pub const ALL: [SourceName; 5] = [
        SourceName::Nmap,
        SourceName::Shodan,
        SourceName::Zoomeye,
        SourceName::Virustotal,
        SourceName::Manual,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceName::Nmap => "nmap",
            SourceName::Shodan => "shodan",
            SourceName::Zoomeye => "zoomeye",
            SourceName::Virustotal => "virustotal",
            SourceName::Manual => "manual",
        }
    }
}

impl std::fmt::Display for SourceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SourceName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nmap" => Ok(SourceName::Nmap),
            "shodan" => Ok(SourceName::Shodan),
            "zoomeye" => Ok(SourceName::Zoomeye),
            "virustotal" => Ok(SourceName::Virustotal),
            "manual" => Ok(SourceName::Manual),
            other => Err(format!("unknown source: {}", other)),
        }
    }
}

/// Natural key of a port: protocol plus port number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortKey {
    pub protocol: String,
    pub port_id: u16,
}

/// One port as reported by a source. Descriptive attributes are all optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Port {
    pub protocol: String,
    pub port_id: u16,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub reason_ttl: Option<u32>,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub product: Option<String>,
    #[serde(default)]
    pub extra_info: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub confidence: Option<u8>,
}

impl Port {
    pub fn new(protocol: &str, port_id: u16) -> Self {
        Self {
            protocol: protocol.trim().to_ascii_lowercase(),
            port_id,
            state: None,
            reason: None,
            reason_ttl: None,
            service: None,
            product: None,
            extra_info: None,
            method: None,
            confidence: None,
        }
    }

    pub fn with_state(mut self, state: &str) -> Self {
        self.state = Some(state.to_string());
        self
    }

    pub fn with_product(mut self, product: &str) -> Self {
        self.product = Some(product.to_string());
        self
    }

    pub fn key(&self) -> PortKey {
        PortKey {
            protocol: self.protocol.to_ascii_lowercase(),
            port_id: self.port_id,
        }
    }
}

/// One traceroute hop, in the order the scanner reported it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceHop {
    pub ttl: Option<u32>,
    pub ip: Option<String>,
    pub rtt: Option<f64>,
    pub hostname: Option<String>,
}

/// Timing and TCP/IP fingerprint block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Fingerprint {
    #[serde(default)]
    pub srtt: Option<i64>,
    #[serde(default)]
    pub rtt_variance: Option<i64>,
    #[serde(default)]
    pub timeout: Option<i64>,
    #[serde(default)]
    pub tcp_sequence: Option<String>,
    #[serde(default)]
    pub ip_id_sequence: Option<String>,
    #[serde(default)]
    pub tcp_timestamp_seq: Option<String>,
    #[serde(default)]
    pub distance: Option<u32>,
    #[serde(default)]
    pub traceroute: Option<Vec<TraceHop>>,
}

/// Facts a single source reported about a host. `None` means "not reported".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostFacts {
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub os: Option<String>,
    #[serde(default)]
    pub hostnames: Option<Vec<String>>,
    #[serde(default)]
    pub ports: Vec<Port>,
    #[serde(default)]
    pub fingerprint: Fingerprint,
}

impl HostFacts {
    /// Collapse duplicate port keys (last one wins) and turn empty lists into
    /// "not reported".
    pub fn normalized(mut self) -> Self {
        let mut by_key = std::collections::BTreeMap::new();
        for port in self.ports.drain(..) {
            by_key.insert(port.key(), port);
        }
        self.ports = by_key.into_values().collect();

        if matches!(self.hostnames.as_ref(), Some(h) if h.is_empty()) {
            self.hostnames = None;
        }
        if matches!(self.fingerprint.traceroute.as_ref(), Some(t) if t.is_empty()) {
            self.fingerprint.traceroute = None;
        }
        if matches!(self.ip.as_deref(), Some(ip) if ip.trim().is_empty()) {
            self.ip = None;
        }
        if matches!(self.os.as_deref(), Some(os) if os.trim().is_empty()) {
            self.os = None;
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ip.is_none()
            && self.os.is_none()
            && self.hostnames.is_none()
            && self.ports.is_empty()
            && self.fingerprint == Fingerprint::default()
    }
}

/// One source's report about one host during one discovery cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostObservation {
    pub organization_id: String,
    pub domain: String,
    pub source: SourceName,
    pub observed_at: DateTime<Utc>,
    pub facts: HostFacts,
}

impl HostObservation {
    pub fn new(
        organization_id: &str,
        domain: &str,
        source: SourceName,
        observed_at: DateTime<Utc>,
        facts: HostFacts,
    ) -> Self {
        Self {
            organization_id: organization_id.to_string(),
            domain: domain.trim().trim_end_matches('.').to_ascii_lowercase(),
            source,
            observed_at,
            facts: facts.normalized(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    Network,
    Parse,
    Cancelled,
    Panicked,
}

/// A (host, source) call that produced nothing in this cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceFailure {
    pub domain: String,
    pub source: SourceName,
    pub kind: FailureKind,
    pub message: String,
}

/// Order of two (timestamp, source) tags under a source-priority ranking.
/// Used by the reconciliation engine for every tagged value.
pub fn compare_tags(
    a: (DateTime<Utc>, SourceName),
    b: (DateTime<Utc>, SourceName),
    rank: impl Fn(SourceName) -> usize,
) -> Ordering {
    // lower rank means higher priority
    a.0.cmp(&b.0).then_with(|| rank(b.1).cmp(&rank(a.1)))
}
