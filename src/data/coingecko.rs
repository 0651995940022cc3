//! CoinGecko spot price source.
//!
//! Uses the free `simple/price` endpoint for USDT/VND and BTC/USD. Both
//! lookups sit behind their own backoff cache.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;

use crate::config::{CoinGeckoConfig, RateLimitConfig};
use crate::data::backoff::{sinusoidal_placeholder, BackoffCache, Fetched};
use crate::market::error::FetchError;
use crate::market::models::decimal_from_number;

const USDT_VND_BASE: Decimal = dec!(25500);
const USDT_VND_AMPLITUDE: Decimal = dec!(250);
pub(crate) const BTC_USD_BASE: Decimal = dec!(40000);
pub(crate) const BTC_USD_AMPLITUDE: Decimal = dec!(2000);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QuoteSource {
    Coingecko,
    Cache,
    Placeholder,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SpotQuote {
    pub price: Decimal,
    pub source: QuoteSource,
}

impl SpotQuote {
    /// Only live or cached quotes are real prices.
    pub fn is_real(&self) -> bool {
        self.source != QuoteSource::Placeholder
    }
}

// Prices come back as bare JSON numbers
type SimplePriceResponse = HashMap<String, HashMap<String, serde_json::Number>>;

pub struct CoinGeckoSource {
    client: reqwest::Client,
    base_url: String,
    tether: BackoffCache<Decimal>,
    bitcoin: BackoffCache<Decimal>,
}

impl CoinGeckoSource {
    pub fn new(config: &CoinGeckoConfig, rate_limit: &RateLimitConfig, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        let floor = Duration::from_millis(rate_limit.backoff_floor_ms);
        let ceiling = Duration::from_millis(rate_limit.spot_backoff_ceiling_ms);

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            tether: BackoffCache::new("coingecko_tether", floor, ceiling),
            bitcoin: BackoffCache::new("coingecko_bitcoin", floor, ceiling),
        })
    }

    /// USDT priced in VND.
    pub async fn usdt_vnd(&self) -> SpotQuote {
        let fetched = self
            .tether
            .get_or_fetch(|| self.simple_price("tether", "vnd"))
            .await;
        to_quote(fetched, USDT_VND_BASE, USDT_VND_AMPLITUDE)
    }

    /// BTC priced in USD.
    pub async fn btc_usd(&self) -> SpotQuote {
        let fetched = self
            .bitcoin
            .get_or_fetch(|| self.simple_price("bitcoin", "usd"))
            .await;
        to_quote(fetched, BTC_USD_BASE, BTC_USD_AMPLITUDE)
    }

    async fn simple_price(&self, id: &str, vs: &str) -> Result<Decimal, FetchError> {
        let url = format!("{}/simple/price", self.base_url);
        let resp = self
            .client
            .get(&url)
            .query(&[("ids", id), ("vs_currencies", vs)])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::from_status(status));
        }

        let body: SimplePriceResponse = resp.json().await?;
        body.get(id)
            .and_then(|prices| prices.get(vs))
            .and_then(decimal_from_number)
            .filter(|p| *p > Decimal::ZERO)
            .ok_or_else(|| FetchError::InvalidResponse(format!("no {id}/{vs} price in CoinGecko response")))
    }
}

fn to_quote(fetched: Fetched<Decimal>, base: Decimal, amplitude: Decimal) -> SpotQuote {
    match fetched {
        Fetched::Fresh(price) => SpotQuote {
            price,
            source: QuoteSource::Coingecko,
        },
        Fetched::Cached(price) => SpotQuote {
            price,
            source: QuoteSource::Cache,
        },
        Fetched::Unavailable => SpotQuote {
            price: sinusoidal_placeholder(base, amplitude),
            source: QuoteSource::Placeholder,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn source_for(server: &MockServer) -> CoinGeckoSource {
        let mut config = test_config();
        config.coingecko.base_url = server.uri();
        // Zero floor so every call goes upstream
        config.rate_limit.backoff_floor_ms = 0;
        CoinGeckoSource::new(&config.coingecko, &config.rate_limit, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_usdt_vnd_live() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/simple/price"))
            .and(query_param("ids", "tether"))
            .and(query_param("vs_currencies", "vnd"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"tether": {"vnd": 26_010.5}})))
            .mount(&server)
            .await;

        let quote = source_for(&server).usdt_vnd().await;
        assert_eq!(quote.price, dec!(26010.5));
        assert_eq!(quote.source, QuoteSource::Coingecko);
        assert!(quote.is_real());
    }

    #[tokio::test]
    async fn test_rate_limited_falls_back_to_placeholder() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let quote = source_for(&server).btc_usd().await;
        assert_eq!(quote.source, QuoteSource::Placeholder);
        assert!(!quote.is_real());
        assert!((dec!(38000)..=dec!(42000)).contains(&quote.price));
    }

    #[tokio::test]
    async fn test_failure_after_success_serves_cache() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"tether": {"vnd": 25_950.0}})))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let source = source_for(&server);
        assert_eq!(source.usdt_vnd().await.source, QuoteSource::Coingecko);

        let second = source.usdt_vnd().await;
        assert_eq!(second.source, QuoteSource::Cache);
        assert_eq!(second.price, dec!(25950));
    }
}
