//! Upstream fetch error taxonomy.
//!
//! Every Binance/CoinGecko call site converts failures into a `FetchError`,
//! whose `error_type()` string is what clients see in `metadata.errorType`.

use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("rate limited (HTTP 429)")]
    RateLimited,

    #[error("forbidden (HTTP 403)")]
    Forbidden,

    #[error("upstream server error (HTTP {0})")]
    Server(StatusCode),

    #[error("Binance API error {code}: {message}")]
    BinanceApi { code: String, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("{0}")]
    Unknown(String),
}

impl FetchError {
    /// Classify a non-success HTTP status.
    pub fn from_status(status: StatusCode) -> Self {
        match status {
            StatusCode::TOO_MANY_REQUESTS => Self::RateLimited,
            StatusCode::FORBIDDEN => Self::Forbidden,
            s if s.is_server_error() => Self::Server(s),
            s => Self::Unknown(format!("unexpected HTTP status {s}")),
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Network(_) => "network_error",
            Self::Timeout(_) => "timeout_error",
            Self::RateLimited => "rate_limit_error",
            Self::Forbidden => "forbidden_error",
            Self::Server(_) => "server_error",
            Self::BinanceApi { .. } => "binance_api_error",
            Self::InvalidResponse(_) => "invalid_response",
            Self::Unknown(_) => "unknown_error",
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited)
    }

    /// Message shown to dashboard users for this failure.
    pub fn user_message(&self) -> String {
        match self {
            Self::Network(_) => {
                "Cannot connect to Binance API. Please check your internet connection.".to_string()
            }
            Self::Timeout(_) => "Request to Binance API timed out. Please try again.".to_string(),
            Self::RateLimited => {
                "Too many requests to Binance API. Please wait and try again.".to_string()
            }
            Self::Forbidden => "Access to Binance API is restricted.".to_string(),
            Self::Server(_) => {
                "Binance API is experiencing server issues. Please try again later.".to_string()
            }
            Self::BinanceApi { code, message } => {
                if code == "000002" {
                    "Invalid parameters sent to Binance API".to_string()
                } else if message.is_empty() {
                    "Binance API Error".to_string()
                } else {
                    format!("Binance API Error: {message}")
                }
            }
            Self::InvalidResponse(_) => {
                "Unexpected response structure from Binance API".to_string()
            }
            Self::Unknown(msg) => msg.clone(),
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(e.to_string())
        } else if e.is_connect() {
            Self::Network(e.to_string())
        } else if let Some(status) = e.status() {
            Self::from_status(status)
        } else if e.is_decode() {
            Self::InvalidResponse(e.to_string())
        } else if e.is_request() {
            Self::Network(e.to_string())
        } else {
            Self::Unknown(e.to_string())
        }
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(e: serde_json::Error) -> Self {
        Self::InvalidResponse(e.to_string())
    }
}
