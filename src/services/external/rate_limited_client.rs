use crate::error::ApiError;
use governor::{Quota, RateLimiter};
use reqwest::header::HeaderMap;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

type DirectLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Rate-limited HTTP client shared by the intelligence source adapters
pub struct RateLimitedClient {
    client: Client,
    rate_limiter: Arc<DirectLimiter>,
    max_retries: u32,
    base_delay: Duration,
}

impl RateLimitedClient {
    /// Create a new rate-limited client
    pub fn new(requests_per_second: u32, max_retries: u32) -> Result<Self, ApiError> {
        let quota = Quota::per_second(NonZeroU32::new(requests_per_second).ok_or_else(|| {
            ApiError::Validation("requests_per_second must be greater than 0".to_string())
        })?);
        Self::with_quota(quota, max_retries)
    }

    /// Client for APIs metered per minute; the full minute's allowance may burst.
    pub fn per_minute(requests_per_minute: u32, max_retries: u32) -> Result<Self, ApiError> {
        let quota = Quota::per_minute(NonZeroU32::new(requests_per_minute).ok_or_else(|| {
            ApiError::Validation("requests_per_minute must be greater than 0".to_string())
        })?);
        Self::with_quota(quota, max_retries)
    }

    fn with_quota(quota: Quota, max_retries: u32) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("asset-recon/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
            max_retries,
            base_delay: Duration::from_millis(1000),
        })
    }

    /// Override the first retry delay; later retries back off exponentially.
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Make a rate-limited GET request with retries
    pub async fn get(&self, url: &str) -> Result<Response, ApiError> {
        self.make_request(|client| client.get(url)).await
    }

    /// Make a rate-limited GET request with custom headers
    pub async fn get_with_headers(&self, url: &str, headers: HeaderMap) -> Result<Response, ApiError> {
        self.make_request(|client| client.get(url).headers(headers.clone()))
            .await
    }

    /// GET and decode a JSON body. Undecodable bodies surface as
    /// `ApiError::Serialization`.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        headers: HeaderMap,
    ) -> Result<T, ApiError> {
        let response = self.get_with_headers(url, headers).await?;
        let text = response.text().await?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Internal method to make requests with rate limiting and retries
    async fn make_request<F>(&self, request_builder: F) -> Result<Response, ApiError>
    where
        F: Fn(&Client) -> reqwest::RequestBuilder,
    {
        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            self.rate_limiter.until_ready().await;

            match request_builder(&self.client).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    } else if status.is_server_error() && attempt < self.max_retries {
                        let delay = self.base_delay * 2_u32.pow(attempt);
                        tracing::warn!(
                            status = %status,
                            attempt = attempt + 1,
                            ?delay,
                            "server error from source, retrying"
                        );
                        sleep(delay).await;
                        continue;
                    } else {
                        let body = response.text().await.unwrap_or_default();
                        return Err(ApiError::ExternalService(format!(
                            "HTTP {} error: {}",
                            status, body
                        )));
                    }
                }
                Err(e) => {
                    if attempt < self.max_retries {
                        let delay = self.base_delay * 2_u32.pow(attempt);
                        tracing::warn!(
                            attempt = attempt + 1,
                            ?delay,
                            error = %e,
                            "request to source failed, retrying"
                        );
                        sleep(delay).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) => Err(ApiError::HttpClient(e)),
            None => Err(ApiError::ExternalService(
                "request was not attempted".to_string(),
            )),
        }
    }
}
