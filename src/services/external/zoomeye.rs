use super::rate_limited_client::RateLimitedClient;
use super::source::SourceAdapter;
use crate::error::ApiError;
use crate::models::{HostFacts, Port, SourceName};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Deserialize;

const ZOOMEYE_API_URL: &str = "https://api.zoomeye.org";

#[derive(Debug, Deserialize)]
pub struct ZoomEyeSearchResponse {
    #[serde(default)]
    pub matches: Vec<ZoomEyeMatch>,
    pub total: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ZoomEyeMatch {
    pub ip: Option<String>,
    pub portinfo: Option<ZoomEyePortInfo>,
    pub protocol: Option<ZoomEyeProtocol>,
    pub rdns: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ZoomEyePortInfo {
    pub port: Option<u16>,
    pub service: Option<String>,
    pub app: Option<String>,
    pub version: Option<String>,
    pub extrainfo: Option<String>,
    pub os: Option<String>,
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ZoomEyeProtocol {
    pub transport: Option<String>,
}

/// ZoomEye host search client
pub struct ZoomEyeAdapter {
    client: RateLimitedClient,
    api_key: String,
    base_url: String,
}

impl ZoomEyeAdapter {
    pub fn new(api_key: String) -> Result<Self, ApiError> {
        Self::with_base_url(api_key, ZOOMEYE_API_URL)
    }

    pub fn with_base_url(api_key: String, base_url: &str) -> Result<Self, ApiError> {
        Ok(Self {
            client: RateLimitedClient::new(1, 3)?,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub async fn search_host(&self, domain: &str) -> Result<Vec<ZoomEyeMatch>, ApiError> {
        let url = format!(
            "{}/host/search?query={}",
            self.base_url,
            urlencoding::encode(&format!("hostname:{}", domain))
        );

        let mut headers = HeaderMap::new();
        headers.insert(
            "API-KEY",
            HeaderValue::from_str(&self.api_key)
                .map_err(|e| ApiError::Validation(format!("Invalid API key format: {}", e)))?,
        );

        tracing::debug!(domain, "querying zoomeye");

        let response: ZoomEyeSearchResponse = self.client.get_json(&url, headers).await?;
        Ok(response.matches)
    }
}

pub fn facts_from_matches(matches: &[ZoomEyeMatch]) -> HostFacts {
    let mut hostnames = Vec::new();
    let mut ports = Vec::new();
    let mut os = None;

    for m in matches {
        let transport = m
            .protocol
            .as_ref()
            .and_then(|p| p.transport.as_deref())
            .unwrap_or("tcp");
        if let Some(info) = m.portinfo.as_ref() {
            if let Some(port_id) = info.port {
                let mut port = Port::new(transport, port_id);
                port.state = Some("open".to_string());
                port.service = info.service.clone();
                port.product = info.app.clone();
                port.extra_info = info.version.clone().or_else(|| info.extrainfo.clone());
                ports.push(port);
            }
            if os.is_none() {
                os = info.os.clone().filter(|o| !o.trim().is_empty());
            }
            if let Some(name) = info.hostname.as_deref().filter(|h| !h.is_empty()) {
                let name = name.to_ascii_lowercase();
                if !hostnames.contains(&name) {
                    hostnames.push(name);
                }
            }
        }
        if let Some(rdns) = m.rdns.as_deref().filter(|h| !h.is_empty()) {
            let rdns = rdns.to_ascii_lowercase();
            if !hostnames.contains(&rdns) {
                hostnames.push(rdns);
            }
        }
    }

    HostFacts {
        ip: matches.iter().find_map(|m| m.ip.clone()),
        os,
        hostnames: Some(hostnames),
        ports,
        ..Default::default()
    }
    .normalized()
}

#[async_trait]
impl SourceAdapter for ZoomEyeAdapter {
    fn source(&self) -> SourceName {
        SourceName::Zoomeye
    }

    async fn fetch(&self, domain: &str) -> Result<HostFacts, ApiError> {
        let matches = self.search_host(domain).await?;
        Ok(facts_from_matches(&matches))
    }
}
