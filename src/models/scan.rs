use serde::{Deserialize, Serialize};

use super::observation::{Fingerprint, HostFacts, Port, TraceHop};

/// Timing block of an active-scan host entry, in microseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostTimes {
    pub srtt: Option<i64>,
    pub rtt_variance: Option<i64>,
    pub timeout: Option<i64>,
}

/// One `host` entry of an active-scan report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanHost {
    pub address: Option<String>,
    pub address_type: Option<String>,
    pub ports: Vec<Port>,
    pub os: Option<String>,
    pub hostnames: Vec<String>,
    pub times: Option<HostTimes>,
    pub tcp_sequence: Option<String>,
    pub ip_id_sequence: Option<String>,
    pub tcp_timestamp_seq: Option<String>,
    pub distance: Option<u32>,
    pub traceroute: Vec<TraceHop>,
}

impl ScanHost {
    /// Hostname of this entry that belongs to `root_domain`, if any.
    pub fn hostname_within(&self, root_domain: &str) -> Option<&str> {
        let root = root_domain.to_ascii_lowercase();
        let suffix = format!(".{}", root);
        self.hostnames
            .iter()
            .map(|h| h.as_str())
            .find(|h| {
                let h = h.to_ascii_lowercase();
                h == root || h.ends_with(&suffix)
            })
    }

    pub fn into_facts(self) -> HostFacts {
        let times = self.times.unwrap_or_default();
        HostFacts {
            ip: self.address,
            os: self.os,
            hostnames: Some(self.hostnames),
            ports: self.ports,
            fingerprint: Fingerprint {
                srtt: times.srtt,
                rtt_variance: times.rtt_variance,
                timeout: times.timeout,
                tcp_sequence: self.tcp_sequence,
                ip_id_sequence: self.ip_id_sequence,
                tcp_timestamp_seq: self.tcp_timestamp_seq,
                distance: self.distance,
                traceroute: Some(self.traceroute),
            },
        }
        .normalized()
    }
}
