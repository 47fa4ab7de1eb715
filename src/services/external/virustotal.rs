use super::rate_limited_client::RateLimitedClient;
use super::source::SourceAdapter;
use crate::error::ApiError;
use crate::models::{HostFacts, SourceName};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};

const VIRUSTOTAL_API_URL: &str = "https://www.virustotal.com";
const FREE_TIER_REQUESTS_PER_MINUTE: u32 = 4;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirusTotalDomainReport {
    pub id: String,
    #[serde(default)]
    pub attributes: VirusTotalDomainAttributes,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VirusTotalDomainAttributes {
    #[serde(default)]
    pub last_dns_records: Option<Vec<VirusTotalDnsRecord>>,
    #[serde(default)]
    pub last_dns_records_date: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirusTotalDnsRecord {
    #[serde(rename = "type")]
    pub record_type: String,
    pub value: String,
    pub ttl: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct VirusTotalResponse<T> {
    pub data: T,
}

#[derive(Debug, Deserialize)]
pub struct VirusTotalListResponse<T> {
    pub data: Vec<T>,
}

/// VirusTotal domain reports (host address) and subdomain listings
pub struct VirusTotalAdapter {
    client: RateLimitedClient,
    api_key: String,
    base_url: String,
}

impl VirusTotalAdapter {
    /// Free tier: 4 requests per minute, refilled one every 15 seconds
    pub fn new(api_key: String) -> Result<Self, ApiError> {
        Self::with_base_url(api_key, VIRUSTOTAL_API_URL)
    }

    pub fn with_base_url(api_key: String, base_url: &str) -> Result<Self, ApiError> {
        Ok(Self {
            client: RateLimitedClient::per_minute(FREE_TIER_REQUESTS_PER_MINUTE, 3)?,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn headers(&self) -> Result<HeaderMap, ApiError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-apikey",
            HeaderValue::from_str(&self.api_key)
                .map_err(|e| ApiError::Validation(format!("Invalid API key format: {}", e)))?,
        );
        Ok(headers)
    }

    /// Get domain report from VirusTotal
    pub async fn get_domain_report(
        &self,
        domain: &str,
    ) -> Result<VirusTotalDomainReport, ApiError> {
        if domain.is_empty() {
            return Err(ApiError::Validation("Domain cannot be empty".to_string()));
        }

        let url = format!("{}/api/v3/domains/{}", self.base_url, domain);
        tracing::debug!(domain, "querying virustotal domain report");

        let response: VirusTotalResponse<VirusTotalDomainReport> =
            self.client.get_json(&url, self.headers()?).await?;
        Ok(response.data)
    }

    /// Get subdomains for a domain from VirusTotal
    pub async fn get_subdomains(&self, domain: &str) -> Result<Vec<String>, ApiError> {
        if domain.is_empty() {
            return Err(ApiError::Validation("Domain cannot be empty".to_string()));
        }

        let url = format!(
            "{}/api/v3/domains/{}/subdomains?limit=40",
            self.base_url, domain
        );
        tracing::debug!(domain, "querying virustotal subdomains");

        let response: VirusTotalListResponse<VirusTotalDomainReport> =
            self.client.get_json(&url, self.headers()?).await?;

        let subdomains: Vec<String> = response.data.into_iter().map(|report| report.id).collect();
        tracing::info!(domain, count = subdomains.len(), "virustotal subdomains listed");
        Ok(subdomains)
    }
}

/// The last A or AAAA record of the report is taken as the host address.
pub fn facts_from_report(report: &VirusTotalDomainReport) -> HostFacts {
    let ip = report
        .attributes
        .last_dns_records
        .iter()
        .flatten()
        .filter(|r| matches!(r.record_type.to_ascii_uppercase().as_str(), "A" | "AAAA"))
        .last()
        .map(|r| r.value.clone());

    HostFacts {
        ip,
        ..Default::default()
    }
    .normalized()
}

#[async_trait]
impl SourceAdapter for VirusTotalAdapter {
    fn source(&self) -> SourceName {
        SourceName::Virustotal
    }

    async fn fetch(&self, domain: &str) -> Result<HostFacts, ApiError> {
        let report = self.get_domain_report(domain).await?;
        Ok(facts_from_report(&report))
    }
}
