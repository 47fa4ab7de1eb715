use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::BTreeMap;
use uuid::Uuid;

use super::observation::{Port, PortKey, SourceName, TraceHop};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetType {
    Domain,
    Ip,
}

impl AssetType {
    /// Type implied by the asset key: literal addresses are `Ip`, everything
    /// else is a `Domain`.
    pub fn for_key(domain: &str) -> Self {
        if domain.parse::<std::net::IpAddr>().is_ok() {
            AssetType::Ip
        } else {
            AssetType::Domain
        }
    }
}

impl std::fmt::Display for AssetType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssetType::Domain => write!(f, "domain"),
            AssetType::Ip => write!(f, "ip"),
        }
    }
}

/// A value together with the source and cycle timestamp that supplied it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tagged<T> {
    pub value: T,
    pub source: SourceName,
    pub observed_at: DateTime<Utc>,
}

impl<T> Tagged<T> {
    pub fn new(value: T, source: SourceName, observed_at: DateTime<Utc>) -> Self {
        Self {
            value,
            source,
            observed_at,
        }
    }

    pub fn tag(&self) -> (DateTime<Utc>, SourceName) {
        (self.observed_at, self.source)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssetFingerprint {
    #[serde(default)]
    pub srtt: Option<Tagged<i64>>,
    #[serde(default)]
    pub rtt_variance: Option<Tagged<i64>>,
    #[serde(default)]
    pub timeout: Option<Tagged<i64>>,
    #[serde(default)]
    pub tcp_sequence: Option<Tagged<String>>,
    #[serde(default)]
    pub ip_id_sequence: Option<Tagged<String>>,
    #[serde(default)]
    pub tcp_timestamp_seq: Option<Tagged<String>>,
    #[serde(default)]
    pub distance: Option<Tagged<u32>>,
    #[serde(default)]
    pub traceroute: Option<Tagged<Vec<TraceHop>>>,
}

/// A port held by an asset, with the observation that last refreshed it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetPort {
    #[serde(flatten)]
    pub port: Port,
    pub source: SourceName,
    pub observed_at: DateTime<Utc>,
}

impl AssetPort {
    pub fn key(&self) -> PortKey {
        self.port.key()
    }

    pub fn tag(&self) -> (DateTime<Utc>, SourceName) {
        (self.observed_at, self.source)
    }
}

/// Canonical record for one host within one organization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub id: Uuid,
    pub organization_id: String,
    pub domain: String,
    pub asset_type: AssetType,
    #[serde(default)]
    pub ip: Option<Tagged<String>>,
    #[serde(default)]
    pub os: Option<Tagged<String>>,
    #[serde(default)]
    pub hostnames: Option<Tagged<Vec<String>>>,
    #[serde(default)]
    pub fingerprint: AssetFingerprint,
    /// Sorted by (protocol, port id).
    #[serde(default)]
    pub ports: Vec<AssetPort>,
    pub sources: BTreeMap<SourceName, DateTime<Utc>>,
    pub last_seen: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Asset {
    pub fn port(&self, protocol: &str, port_id: u16) -> Option<&AssetPort> {
        let key = PortKey {
            protocol: protocol.to_ascii_lowercase(),
            port_id,
        };
        self.ports.iter().find(|p| p.key() == key)
    }

    pub fn ip_value(&self) -> Option<&str> {
        self.ip.as_ref().map(|t| t.value.as_str())
    }

    pub fn os_value(&self) -> Option<&str> {
        self.os.as_ref().map(|t| t.value.as_str())
    }
}

/// Row shape of the `assets` table; the canonical record lives in `document`.
#[derive(Debug, Clone, FromRow)]
pub struct AssetRow {
    pub id: Uuid,
    pub organization_id: String,
    pub domain: String,
    pub document: sqlx::types::Json<Asset>,
    pub last_seen: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<AssetRow> for Asset {
    fn from(row: AssetRow) -> Self {
        let mut asset = row.document.0;
        // columns are authoritative for identity and bookkeeping
        asset.id = row.id;
        asset.organization_id = row.organization_id;
        asset.domain = row.domain;
        asset.last_seen = row.last_seen;
        asset.created_at = row.created_at;
        asset.updated_at = row.updated_at;
        asset
    }
}

/// Manual edit of an asset's editable fields.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AssetUpdate {
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub asset_type: Option<AssetType>,
    #[serde(default)]
    pub ip: Option<String>,
    /// Replaces the whole port list when present.
    #[serde(default)]
    pub ports: Option<Vec<Port>>,
}

impl AssetUpdate {
    pub fn is_empty(&self) -> bool {
        self.domain.is_none() && self.asset_type.is_none() && self.ip.is_none() && self.ports.is_none()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssetDeleteRequest {
    pub ids: Vec<Uuid>,
}
