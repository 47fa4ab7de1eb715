//! Reconciliation of host observations into canonical assets
//!
//! Every scalar field of an [`Asset`] is a [`Tagged`] value carrying the source
//! and timestamp of the observation that supplied it. Merging an observation
//! follows one rule for every tagged value, ports included:
//!
//! 1. A field the observation does not report is left alone. Silence never erases.
//! 2. A reported value replaces the current one when its tag is not older.
//!    Tags are ordered by `observed_at` first; on equal timestamps the source
//!    ranked higher in the priority list wins.
//! 3. Ports are a keyed union on `(protocol, port_id)`. Keys only present on
//!    the asset are kept; shared keys follow rule 2.
//! 4. `sources[source]` keeps the newest timestamp seen for that source and
//!    `last_seen` is the maximum over `sources`.
//!
//! Because every field converges on the greatest tag, folding a set of
//! observations with distinct timestamps gives the same asset regardless of
//! order.
//!
//! # Example
//!
//! ```rust
//! use asset_recon::models::{HostFacts, HostObservation, SourceName};
//! use asset_recon::services::reconciliation::Reconciler;
//!
//! let reconciler = Reconciler::default();
//! let obs = HostObservation::new(
//!     "org1",
//!     "sub.example.com",
//!     SourceName::Shodan,
//!     chrono::Utc::now(),
//!     HostFacts { ip: Some("93.184.216.34".into()), ..Default::default() },
//! );
//!
//! let asset = reconciler.reconcile(None, &obs);
//! assert_eq!(asset.ip_value(), Some("93.184.216.34"));
//! ```

use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use uuid::Uuid;
use crate::models::{
    compare_tags, Asset, AssetFingerprint, AssetPort, AssetType, AssetUpdate, HostObservation,
    SourceName, Tagged,
};

/// Priority used when no ordering is configured, highest first. Observations
/// of one discovery cycle share a timestamp, so this decides between the scan
/// and the passive sources; passive service detail outranks the scan.
pub const DEFAULT_SOURCE_PRIORITY: [SourceName; 4] = [
    SourceName::Shodan,
    SourceName::Zoomeye,
    SourceName::Virustotal,
    SourceName::Nmap,
];

#[derive(Debug, Clone)]
pub struct Reconciler {
    priority: Vec<SourceName>,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new(DEFAULT_SOURCE_PRIORITY.to_vec())
    }
}

impl Reconciler {
    pub fn new(priority: Vec<SourceName>) -> Self {
        Self { priority }
    }

    pub fn priority(&self) -> &[SourceName] {
        &self.priority
    }

    /// Rank of a source; lower is stronger. Manual edits outrank everything,
    /// unlisted sources rank below every listed one.
    pub fn rank(&self, source: SourceName) -> usize {
        if source == SourceName::Manual {
            return 0;
        }
        match self.priority.iter().position(|s| *s == source) {
            Some(position) => position + 1,
            None => self.priority.len() + 1 + source as usize,
        }
    }

    fn supersedes(
        &self,
        incoming: (DateTime<Utc>, SourceName),
        current: (DateTime<Utc>, SourceName),
    ) -> bool {
        compare_tags(incoming, current, |s| self.rank(s)) != Ordering::Less
    }

    fn merge_field<T>(
        &self,
        current: &mut Option<Tagged<T>>,
        value: Option<T>,
        tag: (DateTime<Utc>, SourceName),
    ) {
        let Some(value) = value else {
            return;
        };
        let replace = match current.as_ref() {
            Some(existing) => self.supersedes(tag, existing.tag()),
            None => true,
        };
        if replace {
            *current = Some(Tagged::new(value, tag.1, tag.0));
        }
    }

    /// Merge one observation into the existing asset for its key, or seed a
    /// new asset when there is none.
    pub fn reconcile(&self, existing: Option<Asset>, observation: &HostObservation) -> Asset {
        let mut asset = existing.unwrap_or_else(|| seed_asset(observation));
        let tag = (observation.observed_at, observation.source);
        let facts = observation.facts.clone();

        self.merge_field(&mut asset.ip, facts.ip, tag);
        self.merge_field(&mut asset.os, facts.os, tag);
        self.merge_field(&mut asset.hostnames, facts.hostnames, tag);

        let fp = facts.fingerprint;
        let target: &mut AssetFingerprint = &mut asset.fingerprint;
        self.merge_field(&mut target.srtt, fp.srtt, tag);
        self.merge_field(&mut target.rtt_variance, fp.rtt_variance, tag);
        self.merge_field(&mut target.timeout, fp.timeout, tag);
        self.merge_field(&mut target.tcp_sequence, fp.tcp_sequence, tag);
        self.merge_field(&mut target.ip_id_sequence, fp.ip_id_sequence, tag);
        self.merge_field(&mut target.tcp_timestamp_seq, fp.tcp_timestamp_seq, tag);
        self.merge_field(&mut target.distance, fp.distance, tag);
        self.merge_field(&mut target.traceroute, fp.traceroute, tag);

        for port in facts.ports {
            let key = port.key();
            let incoming = AssetPort {
                port,
                source: observation.source,
                observed_at: observation.observed_at,
            };
            match asset.ports.iter_mut().find(|p| p.key() == key) {
                Some(current) => {
                    if self.supersedes(tag, current.tag()) {
                        *current = incoming;
                    }
                }
                None => asset.ports.push(incoming),
            }
        }
        asset.ports.sort_by_key(|p| p.key());

        if observation.source != SourceName::Manual {
            let seen = asset
                .sources
                .entry(observation.source)
                .or_insert(observation.observed_at);
            if observation.observed_at > *seen {
                *seen = observation.observed_at;
            }
        }
        if let Some(latest) = asset.sources.values().max() {
            asset.last_seen = asset.last_seen.max(*latest);
        }

        asset
    }

    /// Fold a group of observations for one key into the existing asset.
    /// Returns `None` only when there is neither an asset nor an observation.
    pub fn reconcile_all<'a, I>(&self, existing: Option<Asset>, observations: I) -> Option<Asset>
    where
        I: IntoIterator<Item = &'a HostObservation>,
    {
        observations
            .into_iter()
            .fold(existing, |acc, obs| Some(self.reconcile(acc, obs)))
    }

    /// Apply a manual edit. Edited values are tagged `manual` at `edited_at`
    /// so they hold until a strictly newer observation reports the field.
    pub fn apply_manual_update(
        &self,
        mut asset: Asset,
        update: &AssetUpdate,
        edited_at: DateTime<Utc>,
    ) -> Asset {
        if let Some(domain) = update.domain.as_deref() {
            let domain = domain.trim().trim_end_matches('.').to_ascii_lowercase();
            if !domain.is_empty() {
                asset.asset_type = AssetType::for_key(&domain);
                asset.domain = domain;
            }
        }
        if let Some(asset_type) = update.asset_type {
            asset.asset_type = asset_type;
        }
        if let Some(ip) = update.ip.as_deref() {
            let ip = ip.trim();
            if !ip.is_empty() {
                asset.ip = Some(Tagged::new(ip.to_string(), SourceName::Manual, edited_at));
            }
        }
        if let Some(ports) = update.ports.as_ref() {
            let mut by_key = std::collections::BTreeMap::new();
            for port in ports {
                let mut port = port.clone();
                port.protocol = port.protocol.trim().to_ascii_lowercase();
                by_key.insert(
                    port.key(),
                    AssetPort {
                        port,
                        source: SourceName::Manual,
                        observed_at: edited_at,
                    },
                );
            }
            asset.ports = by_key.into_values().collect();
        }
        asset.updated_at = edited_at;
        asset
    }
}

/// Merge with the default source priority.
pub fn reconcile(existing: Option<Asset>, observation: &HostObservation) -> Asset {
    Reconciler::default().reconcile(existing, observation)
}

fn seed_asset(observation: &HostObservation) -> Asset {
    Asset {
        id: Uuid::new_v4(),
        organization_id: observation.organization_id.clone(),
        domain: observation.domain.clone(),
        asset_type: AssetType::for_key(&observation.domain),
        ip: None,
        os: None,
        hostnames: None,
        fingerprint: AssetFingerprint::default(),
        ports: Vec::new(),
        sources: Default::default(),
        last_seen: observation.observed_at,
        created_at: observation.observed_at,
        updated_at: observation.observed_at,
    }
}
