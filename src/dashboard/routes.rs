//! HTTP route handlers.

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::config::RuntimeConfigUpdate;
use crate::dashboard::socket::ServerEvent;
use crate::dashboard::AppState;
use crate::data::binance::BTC_SYMBOL;
use crate::market::p2p::AmountQuery;
use crate::strategy::decision::RiskAppetite;
use crate::strategy::engine::DecisionEngine;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketQuery {
    pub asset: Option<String>,
    pub fiat: Option<String>,
    pub min_limit: Option<String>,
    pub amount: Option<String>,
    pub from_amount: Option<String>,
    pub to_amount: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnomalyQuery {
    pub threshold: Option<String>,
    pub filter_enabled: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DecisionQuery {
    pub risk: Option<String>,
}

pub async fn index_handler() -> impl IntoResponse {
    let html = include_str!("../../static/index.html");
    ([(header::CONTENT_TYPE, "text/html; charset=utf-8")], html)
}

pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.health.snapshot().await)
}

pub async fn get_config_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.runtime.read().await.clone())
}

pub async fn put_config_handler(State(state): State<AppState>, body: Bytes) -> Response {
    let update = serde_json::from_slice::<serde_json::Value>(&body)
        .map_err(|_| "Invalid deviationThreshold value".to_string())
        .and_then(|value| RuntimeConfigUpdate::from_json(&value));

    let update = match update {
        Ok(u) => u,
        Err(error) => {
            warn!(error = %error, "Rejected config update");
            return (StatusCode::BAD_REQUEST, Json(json!({"success": false, "error": error}))).into_response();
        }
    };

    let config = {
        let mut runtime = state.runtime.write().await;
        update.apply(&mut runtime);
        runtime.clone()
    };
    config.persist(&state.config.server.runtime_config_path).await;

    info!(
        threshold = config.deviation_threshold,
        filter = config.is_filter_enabled,
        risk = ?config.risk_appetite,
        "Runtime config updated"
    );

    let payload = state.dashboard_payload().await;
    state.publish(ServerEvent::Anomalies(payload));

    Json(json!({"success": true, "config": config})).into_response()
}

pub async fn anomalies_handler(State(state): State<AppState>, Query(query): Query<AnomalyQuery>) -> impl IntoResponse {
    let explicit = query.threshold.as_deref().and_then(parse_f64);
    let filter_enabled = query.filter_enabled.as_deref() == Some("true");

    let threshold = match (explicit, filter_enabled) {
        (Some(t), _) => Some(t),
        (None, true) => Some(state.runtime.read().await.deviation_threshold),
        (None, false) => None,
    };

    Json(state.anomalies_payload(threshold).await)
}

/// Always 200. Upstream failures come back as HOLD/LOW.
pub async fn decision_handler(State(state): State<AppState>, Query(query): Query<DecisionQuery>) -> impl IntoResponse {
    let (asset, fiat, default_risk) = {
        let runtime = state.runtime.read().await;
        (
            runtime.default_asset().to_string(),
            runtime.fiat_currency.clone(),
            runtime.risk_appetite,
        )
    };
    let appetite = query
        .risk
        .as_deref()
        .and_then(|r| r.parse::<RiskAppetite>().ok())
        .unwrap_or(default_risk);

    let eval = DecisionEngine::new(state.feed.as_ref(), state.locale())
        .evaluate(&asset, &fiat, appetite)
        .await;
    Json(eval.decision)
}

pub async fn btc_trend_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.spot.btc_trend().await)
}

pub async fn binance_data_handler(State(state): State<AppState>) -> Response {
    let (price, ticker, liquidity, usdt) = tokio::join!(
        state.spot.last_price(BTC_SYMBOL),
        state.spot.ticker_24h(BTC_SYMBOL),
        state.spot.liquidity_or_default(),
        state.coingecko.usdt_vnd(),
    );

    match price.and_then(|price| ticker.map(|ticker| (price, ticker))) {
        Ok((price, ticker)) => Json(json!({
            "btcPrice": price,
            "priceChangePercent": ticker.price_change_percent,
            "buyLiquidity": liquidity.buy,
            "sellLiquidity": liquidity.sell,
            "usdtToVndRate": usdt.price,
            "timestamp": Utc::now(),
        }))
        .into_response(),
        Err(e) => {
            warn!(error = %e, error_type = e.error_type(), "Binance market data unavailable");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Failed to fetch Binance data"})),
            )
                .into_response()
        }
    }
}

/// `?asset=BTC` quotes BTC/USD, anything else USDT/VND.
pub async fn spot_price_handler(State(state): State<AppState>, Query(query): Query<MarketQuery>) -> impl IntoResponse {
    let is_btc = query
        .asset
        .as_deref()
        .is_some_and(|a| a.eq_ignore_ascii_case("BTC"));

    let (asset, fiat, quote) = if is_btc {
        ("BTC", "USD", state.coingecko.btc_usd().await)
    } else {
        ("USDT", "VND", state.coingecko.usdt_vnd().await)
    };

    Json(json!({
        "asset": asset,
        "fiat": fiat,
        "price": quote.price,
        "source": quote.source,
        "timestamp": Utc::now(),
    }))
}

pub async fn p2p_all_handler(State(state): State<AppState>, Query(query): Query<MarketQuery>) -> impl IntoResponse {
    let (asset, fiat) = market_pair(&state, &query).await;
    // Unparseable limits mean "no limit"
    let min_limit = query
        .min_limit
        .as_deref()
        .and_then(parse_decimal)
        .filter(|d| *d > Decimal::ZERO)
        .unwrap_or(Decimal::ZERO);

    Json(state.p2p.top_lowest(&asset, &fiat, min_limit).await)
}

pub async fn buy_sell_top_handler(State(state): State<AppState>, Query(query): Query<MarketQuery>) -> impl IntoResponse {
    let (asset, fiat) = market_pair(&state, &query).await;
    let (countries, pay_types) = {
        let runtime = state.runtime.read().await;
        (runtime.countries.clone(), runtime.payment_methods.clone())
    };

    Json(state.p2p.buy_sell_top(&asset, &fiat, &countries, &pay_types).await)
}

pub async fn search_all_handler(State(state): State<AppState>, Query(query): Query<MarketQuery>) -> Response {
    let amount_query = match amount_query(&query) {
        Ok(q) => q,
        Err(error) => {
            return (StatusCode::BAD_REQUEST, Json(json!({"error": error}))).into_response();
        }
    };

    let (asset, fiat) = market_pair(&state, &query).await;
    Json(state.p2p.search_all(&asset, &fiat, amount_query).await).into_response()
}

pub async fn binance_probe_handler(State(state): State<AppState>, Query(query): Query<MarketQuery>) -> impl IntoResponse {
    let (asset, fiat) = market_pair(&state, &query).await;
    Json(state.p2p.probe(&asset, &fiat).await)
}

pub async fn alerts_test_handler(State(state): State<AppState>) -> Response {
    if !state.alerts.has_webhook() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"success": false, "error": "Discord webhook URL is not configured"})),
        )
            .into_response();
    }

    match state.alerts.send_test().await {
        Ok(()) => Json(json!({"success": true})).into_response(),
        Err(e) => {
            warn!(error = %e, "Discord test message failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({"success": false, "error": e.to_string()})),
            )
                .into_response()
        }
    }
}

async fn market_pair(state: &AppState, query: &MarketQuery) -> (String, String) {
    let runtime = state.runtime.read().await;
    let asset = query
        .asset
        .clone()
        .filter(|a| !a.trim().is_empty())
        .unwrap_or_else(|| runtime.default_asset().to_string());
    let fiat = query
        .fiat
        .clone()
        .filter(|f| !f.trim().is_empty())
        .unwrap_or_else(|| runtime.fiat_currency.clone());
    (asset, fiat)
}

/// `amount` wins over a range. A range may omit either bound.
pub fn amount_query(query: &MarketQuery) -> Result<AmountQuery, String> {
    if let Some(raw) = query.amount.as_deref().filter(|s| !s.trim().is_empty()) {
        return parse_decimal(raw)
            .filter(|d| *d > Decimal::ZERO)
            .map(AmountQuery::Exact)
            .ok_or_else(|| "Invalid amount value".to_string());
    }

    let from = query.from_amount.as_deref().filter(|s| !s.trim().is_empty());
    let to = query.to_amount.as_deref().filter(|s| !s.trim().is_empty());
    if from.is_none() && to.is_none() {
        return Err("Please provide amount or fromAmount/toAmount".to_string());
    }

    let from = match from {
        Some(raw) => parse_decimal(raw).ok_or_else(|| "Invalid fromAmount value".to_string())?,
        None => Decimal::ZERO,
    };
    let to = match to {
        Some(raw) => parse_decimal(raw).ok_or_else(|| "Invalid toAmount value".to_string())?,
        None => Decimal::MAX,
    };
    if from > to {
        return Err("fromAmount must not exceed toAmount".to_string());
    }

    Ok(AmountQuery::Range { from, to })
}

fn parse_decimal(raw: &str) -> Option<Decimal> {
    raw.trim().parse::<Decimal>().ok()
}

fn parse_f64(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite() && *v >= 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn query(amount: Option<&str>, from: Option<&str>, to: Option<&str>) -> MarketQuery {
        MarketQuery {
            amount: amount.map(String::from),
            from_amount: from.map(String::from),
            to_amount: to.map(String::from),
            ..Default::default()
        }
    }

    #[test]
    fn test_amount_query_exact() {
        assert_eq!(
            amount_query(&query(Some("5000000"), Some("1"), None)),
            Ok(AmountQuery::Exact(dec!(5000000)))
        );
        assert!(amount_query(&query(Some("abc"), None, None)).is_err());
        assert!(amount_query(&query(Some("0"), None, None)).is_err());
    }

    #[test]
    fn test_amount_query_range() {
        assert_eq!(
            amount_query(&query(None, Some("1000000"), None)),
            Ok(AmountQuery::Range {
                from: dec!(1000000),
                to: Decimal::MAX
            })
        );
        assert_eq!(
            amount_query(&query(None, None, Some("200"))),
            Ok(AmountQuery::Range {
                from: Decimal::ZERO,
                to: dec!(200)
            })
        );
        assert!(amount_query(&query(None, Some("10"), Some("5"))).is_err());
    }

    #[test]
    fn test_amount_query_missing() {
        assert!(amount_query(&query(None, None, None)).is_err());
        assert!(amount_query(&query(Some(" "), Some(""), None)).is_err());
    }
}
