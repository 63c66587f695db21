use crate::error::{FetchError, Result};
use crate::result::FetchOptions;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

/// Anything that can turn a domain into the list of URLs it exposes.
#[async_trait]
pub trait UrlMapper: Send + Sync {
    async fn fetch_urls(&self, domain: &str, options: &FetchOptions) -> Result<Vec<String>>;
}

/// Client for a Firecrawl-compatible `/v1/map` endpoint.
pub struct FirecrawlMapper {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MapResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    links: Vec<MapLink>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MapLink {
    Plain(String),
    Detailed { url: String },
}

impl MapLink {
    fn into_url(self) -> String {
        match self {
            MapLink::Plain(url) => url,
            MapLink::Detailed { url } => url,
        }
    }
}

impl FirecrawlMapper {
    pub fn new(endpoint: &str, api_key: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("lotmap/", env!("CARGO_PKG_VERSION")))
            .pool_idle_timeout(std::time::Duration::from_secs(90))
            .tcp_keepalive(std::time::Duration::from_secs(60))
            .build()
            .map_err(|e| FetchError::Unavailable(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Build the start URL for a bare domain, rejecting anything without a usable host.
    pub fn site_url(domain: &str) -> Result<Url> {
        let trimmed = domain.trim();
        if trimmed.is_empty() {
            return Err(FetchError::InvalidDomain("empty domain".to_string()));
        }

        let candidate = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            trimmed.to_string()
        } else {
            format!("https://{}", trimmed)
        };

        let url = Url::parse(&candidate)
            .map_err(|e| FetchError::InvalidDomain(format!("{}: {}", domain, e)))?;

        match url.host_str() {
            Some(host) if host.contains('.') => Ok(url),
            _ => Err(FetchError::InvalidDomain(domain.to_string())),
        }
    }
}

#[async_trait]
impl UrlMapper for FirecrawlMapper {
    async fn fetch_urls(&self, domain: &str, options: &FetchOptions) -> Result<Vec<String>> {
        let site_url = Self::site_url(domain)?;
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| FetchError::Unavailable("no API key configured".to_string()))?;

        let body = json!({
            "url": site_url.as_str(),
            "limit": options.limit,
            "timeout": options.timeout_ms,
            "location": {
                "country": options.country(),
                "languages": options.languages(),
            },
        });

        debug!("Mapping {} via {}", site_url, self.endpoint);
        let start = Instant::now();

        let response = self
            .client
            .post(format!("{}/v1/map", self.endpoint))
            .bearer_auth(api_key)
            .timeout(options.timeout())
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!("Mapping {} failed with HTTP {}", domain, status.as_u16());
            return Err(FetchError::from_status(status.as_u16(), &text));
        }

        let parsed: MapResponse = response.json().await?;
        if !parsed.success {
            return Err(FetchError::Rejected(
                parsed.error.unwrap_or_else(|| "unknown error".to_string()),
            ));
        }

        let urls: Vec<String> = parsed.links.into_iter().map(MapLink::into_url).collect();
        info!(
            "Mapped {} URLs for {} in {}ms",
            urls.len(),
            domain,
            start.elapsed().as_millis()
        );
        Ok(urls)
    }
}
