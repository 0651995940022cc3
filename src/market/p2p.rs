//! Binance P2P ad-search client.
//!
//! Wraps the public `adv/search` endpoint with rate limiting, response
//! validation, and the response envelopes served by the `/api/p2p/*` routes.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::config::{BinanceConfig, RateLimitConfig};
use crate::market::error::FetchError;
use crate::market::models::{Advertisement, TradeType};

type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

const SUCCESS_CODE: &str = "000000";

/// One page of an ad search.
#[derive(Debug, Clone)]
pub struct SearchParams<'a> {
    pub asset: &'a str,
    pub fiat: &'a str,
    pub trade_type: TradeType,
    pub page: u32,
    pub rows: usize,
    pub trans_amount: Option<Decimal>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchRequest<'a> {
    page: u32,
    rows: usize,
    asset: &'a str,
    trade_type: TradeType,
    fiat: &'a str,
    publisher_type: Option<&'a str>,
    merchant_check: bool,
    pay_types: [&'a str; 0],
    countries: [&'a str; 0],
    trans_amount: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    code: Option<serde_json::Value>,
    message: Option<String>,
    data: Option<serde_json::Value>,
}

/// Amount filter accepted by the search-all route.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AmountQuery {
    Exact(Decimal),
    Range { from: Decimal, to: Decimal },
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordCounts {
    pub buy: usize,
    pub sell: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMetadata {
    pub execution_time: String,
    pub data_type: String,
    pub record_count: usize,
    pub record_counts: RecordCounts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub cached: bool,
    pub api_filtered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applied_min_limit: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub countries: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pay_types: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pages_fetched: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_amount: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_amount: Option<Decimal>,
}

/// Envelope returned by every `/api/p2p/*` route.
#[derive(Debug, Clone, Serialize)]
pub struct P2pResponse {
    pub buy: Vec<Advertisement>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sell: Option<Vec<Advertisement>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub metadata: ResponseMetadata,
}

impl P2pResponse {
    fn ok(buy: Vec<Advertisement>, sell: Option<Vec<Advertisement>>, mut metadata: ResponseMetadata) -> Self {
        let sell_len = sell.as_ref().map_or(0, Vec::len);
        metadata.record_count = buy.len() + sell_len;
        metadata.record_counts = RecordCounts {
            buy: buy.len(),
            sell: sell_len,
            total: buy.len() + sell_len,
        };
        Self {
            buy,
            sell,
            error: None,
            timestamp: Utc::now(),
            metadata,
        }
    }

    fn failed(error: &FetchError, suffix: &str, with_sell: bool, data_type: &str) -> Self {
        Self {
            buy: Vec::new(),
            sell: with_sell.then(Vec::new),
            error: Some(format!("{}{suffix}", error.user_message())),
            timestamp: Utc::now(),
            metadata: ResponseMetadata {
                execution_time: "failed".to_string(),
                data_type: data_type.to_string(),
                error_type: Some(error.error_type()),
                ..Default::default()
            },
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Result of the single-row connectivity probe.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_data: Option<Vec<Advertisement>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<&'static str>,
}

pub struct P2pClient {
    http: reqwest::Client,
    url: String,
    user_agent: String,
    top_n: usize,
    direction_delay: Duration,
    search_max_pages: u32,
    limiter: Arc<Limiter>,
}

impl P2pClient {
    pub fn new(config: &BinanceConfig, rate_limit: &RateLimitConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            url: config.p2p_url.clone(),
            user_agent: config.user_agent.clone(),
            top_n: config.top_n.max(1),
            direction_delay: Duration::from_millis(config.direction_delay_ms),
            search_max_pages: config.search_max_pages.max(1),
            limiter: create_rate_limiter(rate_limit),
        })
    }

    /// Fetch one page of ads. Returns the ads in upstream order.
    #[instrument(skip(self, params), fields(trade_type = %params.trade_type, page = params.page))]
    pub async fn search(&self, params: &SearchParams<'_>) -> Result<Vec<Advertisement>, FetchError> {
        self.limiter.until_ready().await;

        let body = SearchRequest {
            page: params.page,
            rows: params.rows,
            asset: params.asset,
            trade_type: params.trade_type,
            fiat: params.fiat,
            publisher_type: None,
            merchant_check: false,
            pay_types: [],
            countries: [],
            trans_amount: params
                .trans_amount
                .filter(|a| *a > Decimal::ZERO)
                .map(|a| a.normalize().to_string())
                .unwrap_or_default(),
        };

        let resp = self
            .http
            .post(&self.url)
            .header(reqwest::header::USER_AGENT, &self.user_agent)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::from_status(status));
        }

        let bytes = resp.bytes().await?;
        let parsed: SearchResponse = serde_json::from_slice(&bytes)?;
        parse_search_response(parsed)
    }

    /// One direction's best `top_n` ads, sorted best-first.
    pub async fn fetch_side(
        &self,
        asset: &str,
        fiat: &str,
        trade_type: TradeType,
    ) -> Result<Vec<Advertisement>, FetchError> {
        let mut ads = self
            .search(&SearchParams {
                asset,
                fiat,
                trade_type,
                page: 1,
                rows: self.top_n,
                trans_amount: None,
            })
            .await?;
        sort_by_price(&mut ads, trade_type);
        ads.truncate(self.top_n);
        Ok(ads)
    }

    /// Lowest-priced BUY ads, optionally restricted to ads that accept a
    /// single order of `min_limit`.
    pub async fn top_lowest(&self, asset: &str, fiat: &str, min_limit: Decimal) -> P2pResponse {
        const DATA_TYPE: &str = "top20_lowest_prices";
        let started = Instant::now();
        let filter_amount = (min_limit > Decimal::ZERO).then_some(min_limit);

        info!(asset, fiat, min_limit = %min_limit, "Fetching lowest P2P buy prices");

        let result = self
            .search(&SearchParams {
                asset,
                fiat,
                trade_type: TradeType::Buy,
                page: 1,
                rows: self.top_n,
                trans_amount: filter_amount,
            })
            .await;

        let mut ads = match result {
            Ok(ads) => ads,
            Err(e) => {
                warn!(asset, fiat, error = %e, error_type = e.error_type(), "P2P buy fetch failed");
                return P2pResponse::failed(&e, "", false, DATA_TYPE);
            }
        };

        if let Some(amount) = filter_amount {
            ads.retain(|ad| ad.accepts_amount(amount));
        }
        sort_by_price(&mut ads, TradeType::Buy);
        ads.truncate(self.top_n);

        let limit_note = filter_amount
            .map(|a| format!(" with min limit >= {a}"))
            .unwrap_or_default();

        let metadata = ResponseMetadata {
            execution_time: format!("{}ms", started.elapsed().as_millis()),
            data_type: DATA_TYPE.to_string(),
            description: Some(format!(
                "Top {} lowest buy prices{limit_note} (filtered by Binance API)",
                ads.len()
            )),
            api_filtered: true,
            applied_min_limit: Some(min_limit),
            ..Default::default()
        };

        P2pResponse::ok(ads, None, metadata)
    }

    /// BUY and SELL sides, filtered to bank-transfer style payment methods.
    pub async fn buy_sell_top(
        &self,
        asset: &str,
        fiat: &str,
        countries: &[String],
        pay_types: &[String],
    ) -> P2pResponse {
        const DATA_TYPE: &str = "top20_buy_sell";
        let started = Instant::now();

        let buy = match self.raw_side(asset, fiat, TradeType::Buy).await {
            Ok(ads) => ads,
            Err(e) => {
                warn!(asset, fiat, error = %e, "P2P BUY fetch failed");
                return P2pResponse::failed(&e, " (BUY)", true, DATA_TYPE);
            }
        };

        if !self.direction_delay.is_zero() {
            tokio::time::sleep(self.direction_delay).await;
        }

        let sell = match self.raw_side(asset, fiat, TradeType::Sell).await {
            Ok(ads) => ads,
            Err(e) => {
                warn!(asset, fiat, error = %e, "P2P SELL fetch failed");
                return P2pResponse::failed(&e, " (SELL)", true, DATA_TYPE);
            }
        };

        let buy = self.select_side(buy, pay_types, TradeType::Buy);
        let sell = self.select_side(sell, pay_types, TradeType::Sell);

        info!(buy = buy.len(), sell = sell.len(), "P2P buy/sell sides fetched");

        let metadata = ResponseMetadata {
            execution_time: format!("{}ms", started.elapsed().as_millis()),
            data_type: DATA_TYPE.to_string(),
            description: Some(format!(
                "Top {} lowest buy prices and top {} highest sell prices for {} with payment methods: {}",
                buy.len(),
                sell.len(),
                countries.join(", "),
                pay_types.join(", ")
            )),
            api_filtered: true,
            countries: Some(countries.to_vec()),
            pay_types: Some(pay_types.to_vec()),
            ..Default::default()
        };

        P2pResponse::ok(buy, Some(sell), metadata)
    }

    /// Page through both directions and keep ads compatible with `query`.
    pub async fn search_all(&self, asset: &str, fiat: &str, query: AmountQuery) -> P2pResponse {
        const DATA_TYPE: &str = "search_all";
        let started = Instant::now();

        let mut pages_fetched = 0u32;
        let mut sides = Vec::with_capacity(2);

        for trade_type in [TradeType::Buy, TradeType::Sell] {
            let mut matched = Vec::new();

            for page in 1..=self.search_max_pages {
                let params = SearchParams {
                    asset,
                    fiat,
                    trade_type,
                    page,
                    rows: self.top_n,
                    trans_amount: match query {
                        AmountQuery::Exact(amount) => Some(amount),
                        AmountQuery::Range { .. } => None,
                    },
                };

                let ads = match self.search(&params).await {
                    Ok(ads) => ads,
                    Err(e) => {
                        warn!(%trade_type, page, error = %e, "P2P search-all page failed");
                        let suffix = format!(" ({trade_type})");
                        return P2pResponse::failed(&e, &suffix, true, DATA_TYPE);
                    }
                };
                pages_fetched += 1;

                let page_len = ads.len();
                matched.extend(ads.into_iter().filter(|ad| match query {
                    AmountQuery::Exact(amount) => ad.accepts_amount(amount),
                    AmountQuery::Range { from, to } => ad.overlaps_range(from, to),
                }));

                if page_len < self.top_n {
                    break;
                }
            }

            sort_by_price(&mut matched, trade_type);
            sides.push(matched);
        }

        let sell = sides.pop().unwrap_or_default();
        let buy = sides.pop().unwrap_or_default();

        let (amount, from_amount, to_amount) = match query {
            AmountQuery::Exact(a) => (Some(a), None, None),
            AmountQuery::Range { from, to } => (None, Some(from), Some(to)),
        };

        let metadata = ResponseMetadata {
            execution_time: format!("{}ms", started.elapsed().as_millis()),
            data_type: DATA_TYPE.to_string(),
            description: Some(format!(
                "{} buy and {} sell ads matching the requested amount",
                buy.len(),
                sell.len()
            )),
            api_filtered: matches!(query, AmountQuery::Exact(_)),
            pages_fetched: Some(pages_fetched),
            amount,
            from_amount,
            to_amount,
            ..Default::default()
        };

        P2pResponse::ok(buy, Some(sell), metadata)
    }

    /// Single-row request used to check that the upstream is reachable.
    pub async fn probe(&self, asset: &str, fiat: &str) -> ProbeResult {
        let result = self
            .search(&SearchParams {
                asset,
                fiat,
                trade_type: TradeType::Buy,
                page: 1,
                rows: 1,
                trans_amount: None,
            })
            .await;

        match result {
            Ok(mut ads) => {
                let data_length = ads.len();
                ads.truncate(1);
                ProbeResult {
                    success: true,
                    status: Some(reqwest::StatusCode::OK.as_u16()),
                    message: "Binance API is accessible".to_string(),
                    data_length: Some(data_length),
                    sample_data: Some(ads),
                    error: None,
                    error_type: None,
                }
            }
            Err(e) => {
                warn!(error = %e, "Binance P2P connectivity probe failed");
                ProbeResult {
                    success: false,
                    status: None,
                    message: "Binance API test failed".to_string(),
                    data_length: None,
                    sample_data: None,
                    error: Some(e.to_string()),
                    error_type: Some(e.error_type()),
                }
            }
        }
    }

    async fn raw_side(
        &self,
        asset: &str,
        fiat: &str,
        trade_type: TradeType,
    ) -> Result<Vec<Advertisement>, FetchError> {
        self.search(&SearchParams {
            asset,
            fiat,
            trade_type,
            page: 1,
            rows: self.top_n,
            trans_amount: None,
        })
        .await
    }

    /// Payment-method filter with fallback to the unfiltered list when it
    /// leaves fewer than `top_n` ads, then sort and truncate.
    fn select_side(&self, ads: Vec<Advertisement>, pay_types: &[String], trade_type: TradeType) -> Vec<Advertisement> {
        let filtered: Vec<Advertisement> = ads
            .iter()
            .filter(|ad| matches_payment(ad, pay_types))
            .cloned()
            .collect();

        let mut chosen = if filtered.len() < self.top_n {
            info!(
                %trade_type,
                filtered = filtered.len(),
                "Not enough ads after payment filter, using all"
            );
            ads
        } else {
            filtered
        };

        sort_by_price(&mut chosen, trade_type);
        chosen.truncate(self.top_n);
        chosen
    }
}

/// Buy side: cheapest first. Sell side: most expensive first.
pub fn sort_by_price(ads: &mut [Advertisement], trade_type: TradeType) {
    match trade_type {
        TradeType::Buy => ads.sort_by(|a, b| a.adv.price.cmp(&b.adv.price)),
        TradeType::Sell => ads.sort_by(|a, b| b.adv.price.cmp(&a.adv.price)),
    }
}

/// An ad matches when any of its trade methods mentions one of `pay_types`,
/// or looks like a bank transfer. An empty `pay_types` matches nothing.
pub fn matches_payment(ad: &Advertisement, pay_types: &[String]) -> bool {
    ad.adv.trade_methods.iter().any(|method| {
        let id = method.identifier.to_lowercase();
        let name = method
            .trade_method_name
            .as_deref()
            .unwrap_or_default()
            .to_lowercase();

        let generic = ["bank", "transfer"]
            .iter()
            .any(|k| id.contains(k) || name.contains(k));

        pay_types.iter().any(|p| {
            let p = p.to_lowercase();
            generic || id.contains(&p) || name.contains(&p)
        })
    })
}

fn parse_search_response(resp: SearchResponse) -> Result<Vec<Advertisement>, FetchError> {
    if let Some(code) = resp.code.as_ref().and_then(code_string) {
        if code != SUCCESS_CODE {
            return Err(FetchError::BinanceApi {
                code,
                message: resp.message.unwrap_or_default(),
            });
        }
    }

    let Some(serde_json::Value::Array(items)) = resp.data else {
        return Err(FetchError::InvalidResponse(
            "missing `data` array in P2P search response".to_string(),
        ));
    };

    let total = items.len();
    let ads: Vec<Advertisement> = items
        .into_iter()
        .filter_map(|item| match serde_json::from_value(item) {
            Ok(ad) => Some(ad),
            Err(e) => {
                warn!(error = %e, "Skipping malformed P2P advertisement");
                None
            }
        })
        .collect();

    if total > 0 && ads.is_empty() {
        return Err(FetchError::InvalidResponse(
            "no advertisement in P2P search response could be parsed".to_string(),
        ));
    }

    Ok(ads)
}

fn code_string(code: &serde_json::Value) -> Option<String> {
    match code {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) if s.is_empty() => None,
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn create_rate_limiter(config: &RateLimitConfig) -> Arc<Limiter> {
    let rps = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);
    let burst = NonZeroU32::new(config.burst_size).unwrap_or(rps);

    let quota = Quota::per_second(rps).allow_burst(burst);
    Arc::new(RateLimiter::direct(quota))
}
