use super::rate_limited_client::RateLimitedClient;
use super::source::SourceAdapter;
use crate::error::ApiError;
use crate::models::{HostFacts, Port, SourceName};
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};

const SHODAN_API_URL: &str = "https://api.shodan.io";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShodanResult {
    pub ip_str: String,
    pub port: u16,
    #[serde(default)]
    pub transport: Option<String>,
    #[serde(default)]
    pub product: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub os: Option<String>,
    #[serde(default)]
    pub hostnames: Option<Vec<String>>,
    #[serde(default)]
    pub domains: Option<Vec<String>>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ShodanSearchResponse {
    #[serde(default)]
    pub matches: Vec<ShodanResult>,
    pub total: Option<u64>,
}

/// Shodan host search, one `hostname:` query per candidate host.
pub struct ShodanAdapter {
    client: RateLimitedClient,
    api_key: String,
    base_url: String,
}

impl ShodanAdapter {
    /// Free tier allows one request per second
    pub fn new(api_key: String) -> Result<Self, ApiError> {
        Self::with_base_url(api_key, SHODAN_API_URL)
    }

    pub fn with_base_url(api_key: String, base_url: &str) -> Result<Self, ApiError> {
        Ok(Self {
            client: RateLimitedClient::new(1, 3)?,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Search Shodan for banners matching the query
    pub async fn search(&self, query: &str) -> Result<Vec<ShodanResult>, ApiError> {
        if query.is_empty() {
            return Err(ApiError::Validation(
                "Search query cannot be empty".to_string(),
            ));
        }

        let url = format!(
            "{}/shodan/host/search?key={}&query={}",
            self.base_url,
            self.api_key,
            urlencoding::encode(query)
        );

        tracing::debug!(query, "querying shodan");

        let response: ShodanSearchResponse = self.client.get_json(&url, HeaderMap::new()).await?;
        Ok(response.matches)
    }
}

/// Fold the banners that name `domain` into one set of host facts.
pub fn facts_from_matches(domain: &str, matches: &[ShodanResult]) -> HostFacts {
    let names_host = |m: &&ShodanResult| {
        m.hostnames
            .iter()
            .flatten()
            .any(|h| h.eq_ignore_ascii_case(domain))
    };

    let relevant: Vec<&ShodanResult> = matches.iter().filter(names_host).collect();
    if relevant.is_empty() {
        return HostFacts::default();
    }

    let mut hostnames: Vec<String> = Vec::new();
    for name in relevant.iter().flat_map(|m| m.hostnames.iter().flatten()) {
        let name = name.to_ascii_lowercase();
        if !hostnames.contains(&name) {
            hostnames.push(name);
        }
    }

    let ports = relevant
        .iter()
        .map(|m| {
            let mut port = Port::new(m.transport.as_deref().unwrap_or("tcp"), m.port);
            port.state = Some("open".to_string());
            port.product = m.product.clone();
            port.extra_info = m.version.clone();
            port
        })
        .collect();

    HostFacts {
        ip: relevant.first().map(|m| m.ip_str.clone()),
        os: relevant.iter().find_map(|m| m.os.clone()),
        hostnames: Some(hostnames),
        ports,
        ..Default::default()
    }
    .normalized()
}

#[async_trait]
impl SourceAdapter for ShodanAdapter {
    fn source(&self) -> SourceName {
        SourceName::Shodan
    }

    async fn fetch(&self, domain: &str) -> Result<HostFacts, ApiError> {
        let matches = self.search(&format!("hostname:{}", domain)).await?;
        let facts = facts_from_matches(domain, &matches);
        tracing::debug!(
            domain,
            matches = matches.len(),
            ports = facts.ports.len(),
            "shodan lookup complete"
        );
        Ok(facts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::{
        matchers::{method, path, query_param},
        Mock, MockServer, ResponseTemplate,
    };

    const SEARCH_BODY: &str = r#"{
        "total": 3,
        "matches": [
            {"ip_str": "93.184.216.34", "port": 443, "transport": "tcp", "product": "nginx",
             "version": "1.18.0", "hostnames": ["sub.example.com"], "os": null},
            {"ip_str": "93.184.216.34", "port": 53, "transport": "udp",
             "hostnames": ["SUB.example.com", "ns.example.com"], "os": "Linux"},
            {"ip_str": "10.1.1.1", "port": 22, "hostnames": ["other.example.com"]}
        ]
    }"#;

    #[tokio::test]
    async fn test_fetch_maps_matches_for_host() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/shodan/host/search"))
            .and(query_param("query", "hostname:sub.example.com"))
            .and(query_param("key", "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_string(SEARCH_BODY))
            .mount(&mock_server)
            .await;

        let adapter = ShodanAdapter::with_base_url("test-key".into(), &mock_server.uri()).unwrap();
        let facts = adapter.fetch("sub.example.com").await.unwrap();

        assert_eq!(facts.ip.as_deref(), Some("93.184.216.34"));
        assert_eq!(facts.os.as_deref(), Some("Linux"));
        assert_eq!(facts.ports.len(), 2);
        let https = facts.ports.iter().find(|p| p.port_id == 443).unwrap();
        assert_eq!(https.product.as_deref(), Some("nginx"));
        assert_eq!(https.extra_info.as_deref(), Some("1.18.0"));
        assert!(facts.ports.iter().any(|p| p.protocol == "udp" && p.port_id == 53));
        assert_eq!(
            facts.hostnames,
            Some(vec!["sub.example.com".to_string(), "ns.example.com".to_string()])
        );
    }

    #[tokio::test]
    async fn test_fetch_unknown_host_is_empty() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"matches": [], "total": 0}"#))
            .mount(&mock_server)
            .await;

        let adapter = ShodanAdapter::with_base_url("k".into(), &mock_server.uri()).unwrap();
        let facts = adapter.fetch("nothing.example.com").await.unwrap();
        assert!(facts.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_auth_failure_is_error() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid key"))
            .mount(&mock_server)
            .await;

        let adapter = ShodanAdapter::with_base_url("bad".into(), &mock_server.uri()).unwrap();
        let result = adapter.fetch("sub.example.com").await;
        assert!(matches!(result, Err(ApiError::ExternalService(_))));
    }
}
