use super::rate_limited_client::RateLimitedClient;
use crate::error::ApiError;
use regex::Regex;
use reqwest::header::HeaderMap;
use serde::Deserialize;
use std::collections::BTreeSet;

const CRTSH_URL: &str = "https://crt.sh";

#[derive(Debug, Deserialize)]
pub struct CrtShEntry {
    pub name_value: String,
    pub common_name: Option<String>,
}

/// Certificate Transparency log client for subdomain enumeration
pub struct CrtShClient {
    client: RateLimitedClient,
    domain_regex: Regex,
    base_url: String,
}

impl CrtShClient {
    /// Create a new CRT.sh client with rate limiting (2 requests per second)
    pub fn new() -> Result<Self, ApiError> {
        Self::with_base_url(CRTSH_URL)
    }

    pub fn with_base_url(base_url: &str) -> Result<Self, ApiError> {
        let client = RateLimitedClient::new(2, 3)?;
        let domain_regex = Regex::new(r"^[a-zA-Z0-9]([a-zA-Z0-9\-]{0,61}[a-zA-Z0-9])?(\.[a-zA-Z0-9]([a-zA-Z0-9\-]{0,61}[a-zA-Z0-9])?)*$")
            .map_err(|e| ApiError::Internal(format!("Failed to compile domain regex: {}", e)))?;

        Ok(Self {
            client,
            domain_regex,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Subdomains of `domain` seen in certificate transparency logs
    pub async fn search_domain(&self, domain: &str) -> Result<Vec<String>, ApiError> {
        if domain.is_empty() {
            return Err(ApiError::Validation("Domain cannot be empty".to_string()));
        }

        let names = self.search_crt_sh(&format!("%.{}", domain)).await?;

        let valid: BTreeSet<String> = names
            .iter()
            .flat_map(|value| value.split('\n'))
            .filter_map(|name| self.validate_and_clean_domain(name, domain))
            .collect();

        tracing::info!(domain, count = valid.len(), "crt.sh subdomains listed");
        Ok(valid.into_iter().collect())
    }

    async fn search_crt_sh(&self, query: &str) -> Result<Vec<String>, ApiError> {
        let url = format!(
            "{}/?q={}&output=json",
            self.base_url,
            urlencoding::encode(query)
        );

        tracing::debug!(url = %url, "querying crt.sh");

        let response = self.client.get_with_headers(&url, HeaderMap::new()).await?;

        // crt.sh answers an empty body when nothing matches
        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let entries: Vec<CrtShEntry> = serde_json::from_str(&text)?;
        Ok(entries
            .into_iter()
            .flat_map(|entry| std::iter::once(entry.name_value).chain(entry.common_name))
            .collect())
    }

    /// Validate and clean a name from certificate data. Wildcards resolve to
    /// the name below the wildcard label.
    pub fn validate_and_clean_domain(&self, name: &str, base_domain: &str) -> Option<String> {
        let cleaned = name.trim().trim_start_matches("*.").to_lowercase();
        if cleaned.is_empty() || cleaned.contains('*') || cleaned.contains(char::is_whitespace) {
            return None;
        }

        let base = base_domain.to_lowercase();
        if cleaned != base && !cleaned.ends_with(&format!(".{}", base)) {
            return None;
        }

        self.domain_regex.is_match(&cleaned).then_some(cleaned)
    }
}
