use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Rate limited by mapping service")]
    RateLimited,

    #[error("HTTP error {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid domain: {0}")]
    InvalidDomain(String),

    #[error("Mapping service rejected the request: {0}")]
    Rejected(String),

    #[error("Mapping service unavailable: {0}")]
    Unavailable(String),
}

/// Wire-level classification of a fetch failure, as stored on a site map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FetchErrorKind {
    Timeout,
    RateLimit,
    HttpError,
    Network,
}

impl FetchErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchErrorKind::Timeout => "timeout",
            FetchErrorKind::RateLimit => "rateLimit",
            FetchErrorKind::HttpError => "httpError",
            FetchErrorKind::Network => "network",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "timeout" => Some(FetchErrorKind::Timeout),
            "rateLimit" => Some(FetchErrorKind::RateLimit),
            "httpError" => Some(FetchErrorKind::HttpError),
            "network" => Some(FetchErrorKind::Network),
            _ => None,
        }
    }
}

impl FetchError {
    pub fn kind(&self) -> FetchErrorKind {
        match self {
            FetchError::Timeout(_) => FetchErrorKind::Timeout,
            FetchError::RateLimited => FetchErrorKind::RateLimit,
            FetchError::Network(_) => FetchErrorKind::Network,
            FetchError::Http { .. }
            | FetchError::InvalidDomain(_)
            | FetchError::Rejected(_)
            | FetchError::Unavailable(_) => FetchErrorKind::HttpError,
        }
    }

    /// Timeouts, rate limiting, 5xx and connection failures are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Timeout(_) | FetchError::RateLimited | FetchError::Network(_) => true,
            FetchError::Http { status, .. } => *status >= 500,
            FetchError::InvalidDomain(_) | FetchError::Rejected(_) | FetchError::Unavailable(_) => {
                false
            }
        }
    }

    /// The gateway itself cannot serve any site; the whole run has to stop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FetchError::Unavailable(_))
    }

    pub(crate) fn from_status(status: u16, body: &str) -> Self {
        let message: String = body.chars().take(200).collect();
        match status {
            408 => FetchError::Timeout(message),
            429 => FetchError::RateLimited,
            401 | 402 => FetchError::Unavailable(format!("HTTP {}: {}", status, message)),
            _ => FetchError::Http { status, message },
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout(err.to_string())
        } else if let Some(status) = err.status() {
            FetchError::from_status(status.as_u16(), &err.to_string())
        } else if err.is_decode() {
            FetchError::Rejected(format!("Malformed response: {}", err))
        } else {
            FetchError::Network(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, FetchError>;
