use crate::error::FetchError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Options forwarded to the mapping service for a single domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchOptions {
    pub limit: usize,
    pub timeout_ms: u64,
    pub locale: String,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            limit: 5000,
            timeout_ms: 60_000,
            locale: "pt-BR".to_string(),
        }
    }
}

impl FetchOptions {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Country code part of the locale, e.g. `BR` for `pt-BR`.
    pub fn country(&self) -> String {
        self.locale
            .split(['-', '_'])
            .nth(1)
            .unwrap_or(&self.locale)
            .to_uppercase()
    }

    /// Languages advertised to the service, most specific first.
    pub fn languages(&self) -> Vec<String> {
        let mut languages = vec![self.locale.clone()];
        if let Some(primary) = self.locale.split(['-', '_']).next()
            && primary != self.locale
        {
            languages.push(primary.to_string());
        }
        languages
    }
}

/// Terminal outcome of fetching one domain, including how many attempts it took.
#[derive(Debug, Clone)]
pub struct MapResult {
    pub domain: String,
    pub urls: Vec<String>,
    pub attempts: u32,
    pub elapsed: Duration,
    pub error: Option<FetchError>,
}

impl MapResult {
    pub fn new(domain: String, urls: Vec<String>, attempts: u32, elapsed: Duration) -> Self {
        Self {
            domain,
            urls,
            attempts,
            elapsed,
            error: None,
        }
    }

    pub fn with_error(domain: String, error: FetchError, attempts: u32, elapsed: Duration) -> Self {
        Self {
            domain,
            urls: Vec::new(),
            attempts,
            elapsed,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}
