//! Binance spot market source: BTCUSDT ticker, 24h stats and order book.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Datelike, Utc, Weekday};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{BinanceConfig, RateLimitConfig};
use crate::data::backoff::{sinusoidal_placeholder, BackoffCache, Fetched};
use crate::data::coingecko::{BTC_USD_AMPLITUDE, BTC_USD_BASE};
use crate::market::error::FetchError;
use crate::strategy::decision::{classify_trend, Trend};

pub const BTC_SYMBOL: &str = "BTCUSDT";
const DEPTH_LIMIT: u32 = 10;
const DEFAULT_LIQUIDITY: Decimal = Decimal::ONE_HUNDRED;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTicker24h {
    last_price: String,
    price_change_percent: String,
}

#[derive(Debug, Deserialize)]
struct RawTickerPrice {
    price: String,
}

#[derive(Debug, Deserialize)]
struct RawDepth {
    bids: Vec<[String; 2]>,
    asks: Vec<[String; 2]>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ticker24h {
    pub last_price: Decimal,
    pub price_change_percent: f64,
}

/// Summed notional of the top order-book levels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Liquidity {
    pub buy: Decimal,
    pub sell: Decimal,
}

impl Default for Liquidity {
    fn default() -> Self {
        Self {
            buy: DEFAULT_LIQUIDITY,
            sell: DEFAULT_LIQUIDITY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendSource {
    Binance,
    Cache,
    Algorithm,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BtcTrend {
    pub price: Decimal,
    pub trend: Trend,
    pub change24h: f64,
    pub source: TrendSource,
}

impl BtcTrend {
    fn live(ticker: Ticker24h, source: TrendSource) -> Self {
        let change24h = round2(ticker.price_change_percent);
        Self {
            price: ticker.last_price,
            trend: classify_trend(change24h),
            change24h,
            source,
        }
    }

    /// Weekday pattern used when Binance has never answered.
    pub fn fallback(weekday: Weekday) -> Self {
        let (trend, change24h) = match weekday {
            Weekday::Mon | Weekday::Tue => (Trend::Up, 2.5),
            Weekday::Wed | Weekday::Thu => (Trend::Down, -2.1),
            _ => (Trend::Neutral, 0.3),
        };
        Self {
            price: sinusoidal_placeholder(BTC_USD_BASE, BTC_USD_AMPLITUDE).round(),
            trend,
            change24h,
            source: TrendSource::Algorithm,
        }
    }
}

pub struct BinanceSpotSource {
    client: reqwest::Client,
    base_url: String,
    trend_cache: BackoffCache<Ticker24h>,
}

impl BinanceSpotSource {
    pub fn new(config: &BinanceConfig, rate_limit: &RateLimitConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: config.spot_base_url.trim_end_matches('/').to_string(),
            trend_cache: BackoffCache::new(
                "binance_btc_trend",
                Duration::from_millis(rate_limit.backoff_floor_ms),
                Duration::from_millis(rate_limit.trend_backoff_ceiling_ms),
            ),
        })
    }

    pub async fn ticker_24h(&self, symbol: &str) -> Result<Ticker24h, FetchError> {
        let raw: RawTicker24h = self.get_json("/api/v3/ticker/24hr", &[("symbol", symbol)]).await?;
        Ok(Ticker24h {
            last_price: parse_decimal(&raw.last_price)?,
            price_change_percent: parse_percent(&raw.price_change_percent)?,
        })
    }

    pub async fn last_price(&self, symbol: &str) -> Result<Decimal, FetchError> {
        let raw: RawTickerPrice = self.get_json("/api/v3/ticker/price", &[("symbol", symbol)]).await?;
        parse_decimal(&raw.price)
    }

    pub async fn liquidity(&self, symbol: &str) -> Result<Liquidity, FetchError> {
        let limit = DEPTH_LIMIT.to_string();
        let raw: RawDepth = self
            .get_json("/api/v3/depth", &[("symbol", symbol), ("limit", limit.as_str())])
            .await?;

        Ok(Liquidity {
            buy: notional(&raw.bids)?,
            sell: notional(&raw.asks)?,
        })
    }

    /// BTCUSDT order-book liquidity, 100/100 when the book is unavailable.
    pub async fn liquidity_or_default(&self) -> Liquidity {
        match self.liquidity(BTC_SYMBOL).await {
            Ok(l) => l,
            Err(e) => {
                warn!(error = %e, "Order book unavailable, using default liquidity");
                Liquidity::default()
            }
        }
    }

    /// BTC trend behind the trend backoff cache, never failing.
    pub async fn btc_trend(&self) -> BtcTrend {
        let fetched = self
            .trend_cache
            .get_or_fetch(|| self.ticker_24h(BTC_SYMBOL))
            .await;

        match fetched {
            Fetched::Fresh(t) => {
                let trend = BtcTrend::live(t, TrendSource::Binance);
                info!(trend = ?trend.trend, change24h = trend.change24h, "BTC trend from Binance");
                trend
            }
            Fetched::Cached(t) => BtcTrend::live(t, TrendSource::Cache),
            Fetched::Unavailable => {
                info!("Using weekday estimation for BTC trend");
                BtcTrend::fallback(Utc::now().weekday())
            }
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, FetchError> {
        let resp = self
            .client
            .get(format!("{}{path}", self.base_url))
            .query(query)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::from_status(status));
        }

        Ok(resp.json().await?)
    }
}

fn parse_decimal(raw: &str) -> Result<Decimal, FetchError> {
    raw.trim()
        .parse::<Decimal>()
        .map_err(|_| FetchError::InvalidResponse(format!("not a number: {raw:?}")))
}

fn parse_percent(raw: &str) -> Result<f64, FetchError> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| FetchError::InvalidResponse(format!("not a number: {raw:?}")))
}

fn notional(levels: &[[String; 2]]) -> Result<Decimal, FetchError> {
    levels.iter().try_fold(Decimal::ZERO, |acc, [price, qty]| {
        Ok(acc + parse_decimal(price)? * parse_decimal(qty)?)
    })
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
