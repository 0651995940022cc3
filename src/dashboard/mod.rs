//! Web dashboard: axum HTTP API, embedded HTML and the websocket channel.

pub mod routes;
pub mod socket;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, Method};
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::{AppConfig, RuntimeConfig, Secrets};
use crate::data::binance::BinanceSpotSource;
use crate::data::coingecko::CoinGeckoSource;
use crate::data::{LiveMarketFeed, MarketFeed};
use crate::market::p2p::P2pClient;
use crate::monitoring::alerts::{AlertClient, PriceAlertMonitor};
use crate::monitoring::health::HealthState;
use crate::strategy::anomaly::AnomalyFeed;
use crate::strategy::decision::{Locale, MarketDecision};

use self::socket::{AnomaliesPayload, ServerEvent};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Shared state handed to every handler and to the poller.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub runtime: Arc<RwLock<RuntimeConfig>>,
    pub p2p: Arc<P2pClient>,
    pub spot: Arc<BinanceSpotSource>,
    pub coingecko: Arc<CoinGeckoSource>,
    pub feed: Arc<dyn MarketFeed>,
    pub anomalies: Arc<RwLock<AnomalyFeed>>,
    pub latest_decision: Arc<RwLock<MarketDecision>>,
    pub alerts: Arc<AlertClient>,
    pub alert_monitor: Arc<Mutex<PriceAlertMonitor>>,
    pub health: HealthState,
    pub events: broadcast::Sender<ServerEvent>,
}

impl AppState {
    pub fn new(config: AppConfig, secrets: Secrets) -> Result<Self> {
        let p2p = Arc::new(P2pClient::new(&config.binance, &config.rate_limit)?);
        let spot = Arc::new(BinanceSpotSource::new(&config.binance, &config.rate_limit)?);
        let coingecko = Arc::new(CoinGeckoSource::new(
            &config.coingecko,
            &config.rate_limit,
            Duration::from_millis(config.binance.timeout_ms),
        )?);

        let feed: Arc<dyn MarketFeed> = Arc::new(LiveMarketFeed {
            p2p: p2p.clone(),
            spot: spot.clone(),
            coingecko: coingecko.clone(),
        });

        let runtime = RuntimeConfig::load_or_default(&config);
        let alerts = AlertClient::new(secrets.discord_webhook_url, config.alerts.discord_enabled);
        let alert_monitor = PriceAlertMonitor::new(&config.alerts);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        info!(
            discord = alerts.is_enabled(),
            risk = ?runtime.risk_appetite,
            threshold = runtime.deviation_threshold,
            "Dashboard state ready"
        );

        Ok(Self {
            latest_decision: Arc::new(RwLock::new(MarketDecision::analyzing(config.strategy.locale))),
            config: Arc::new(config),
            runtime: Arc::new(RwLock::new(runtime)),
            p2p,
            spot,
            coingecko,
            feed,
            anomalies: Arc::new(RwLock::new(AnomalyFeed::new())),
            alerts: Arc::new(alerts),
            alert_monitor: Arc::new(Mutex::new(alert_monitor)),
            health: HealthState::new(),
            events,
        })
    }

    pub fn locale(&self) -> Locale {
        self.config.strategy.locale
    }

    /// Current feed, filtered at `threshold` when given.
    pub async fn anomalies_payload(&self, threshold: Option<f64>) -> AnomaliesPayload {
        AnomaliesPayload {
            anomalies: self.anomalies.read().await.snapshot(threshold),
            timestamp: Utc::now(),
            config: None,
        }
    }

    /// Feed as pushed to every dashboard: filtered at the runtime threshold
    /// while the filter is on, with the runtime config attached.
    pub async fn dashboard_payload(&self) -> AnomaliesPayload {
        let runtime = self.runtime.read().await.clone();
        let threshold = runtime.is_filter_enabled.then_some(runtime.deviation_threshold);
        AnomaliesPayload {
            anomalies: self.anomalies.read().await.snapshot(threshold),
            timestamp: Utc::now(),
            config: Some(runtime),
        }
    }

    /// Broadcast to every connected socket. Having no listeners is fine.
    pub fn publish(&self, event: ServerEvent) {
        if self.events.send(event).is_err() {
            debug!("No socket clients connected");
        }
    }
}

pub fn router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.server.cors_origins);

    Router::new()
        .route("/", get(routes::index_handler))
        .route("/api/health", get(routes::health_handler))
        .route("/api/config", get(routes::get_config_handler).put(routes::put_config_handler))
        .route("/api/anomalies", get(routes::anomalies_handler))
        .route("/api/decision", get(routes::decision_handler))
        .route("/api/btc-trend", get(routes::btc_trend_handler))
        .route("/api/binance-data", get(routes::binance_data_handler))
        .route("/api/spot-price", get(routes::spot_price_handler))
        .route("/api/p2p/all", get(routes::p2p_all_handler))
        .route("/api/p2p/buy-sell-top50", get(routes::buy_sell_top_handler))
        .route("/api/p2p/search-all", get(routes::search_all_handler))
        .route("/api/test/binance", get(routes::binance_probe_handler))
        .route("/api/alerts/test", post(routes::alerts_test_handler))
        .route("/ws", get(socket::websocket_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match o.parse::<HeaderValue>() {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(origin = %o, error = %e, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::PUT, Method::POST])
        .allow_headers([header::CONTENT_TYPE])
}

/// Bind and serve until `stop` flips to true.
pub async fn serve(state: AppState, mut stop: watch::Receiver<bool>) -> Result<()> {
    let addr = format!("{}:{}", state.config.server.bind, state.config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind dashboard server on {addr}"))?;
    info!(addr = %addr, "Dashboard server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = stop.wait_for(|stopped| *stopped).await;
            info!("Dashboard server shutting down");
        })
        .await
        .context("Dashboard server error")
}

/// Spawn the dashboard HTTP server.
pub fn spawn_dashboard(state: AppState, stop: watch::Receiver<bool>) -> JoinHandle<Result<()>> {
    tokio::spawn(serve(state, stop))
}

#[cfg(test)]
pub(crate) fn test_state(name: &str) -> AppState {
    let dir = std::env::temp_dir().join(format!("p2p-dashboard-state-{name}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);

    let mut config = crate::config::test_config();
    config.server.runtime_config_path = dir.join("runtime.json");
    config.alerts.state_path = dir.join("alerts.json");
    AppState::new(config, Secrets { discord_webhook_url: None }).expect("test state should build")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::anomaly::sample_anomaly;

    fn merchants(payload: &AnomaliesPayload) -> Vec<&str> {
        payload.anomalies.iter().map(|a| a.merchant.as_str()).collect()
    }

    #[tokio::test]
    async fn test_dashboard_payload_follows_runtime_filter() {
        let state = test_state("payload");
        state
            .anomalies
            .write()
            .await
            .extend([sample_anomaly("small", 0.3), sample_anomaly("big", -1.2)]);

        // Filter is on at 0.5 by default
        let payload = state.dashboard_payload().await;
        assert_eq!(merchants(&payload), vec!["big"]);
        assert_eq!(payload.config.map(|c| c.deviation_threshold), Some(0.5));

        state.runtime.write().await.is_filter_enabled = false;
        assert_eq!(merchants(&state.dashboard_payload().await), vec!["small", "big"]);

        let explicit = state.anomalies_payload(Some(1.0)).await;
        assert_eq!(merchants(&explicit), vec!["big"]);
        assert!(explicit.config.is_none());
    }
}
