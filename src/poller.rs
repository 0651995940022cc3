//! Periodic market refresh.
//!
//! Each tick runs the decision engine, pushes anomalies and the decision to
//! socket clients, and feeds the buy side to the price alert monitor.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{info, instrument, warn};

use crate::dashboard::socket::ServerEvent;
use crate::dashboard::AppState;
use crate::strategy::anomaly::detect;
use crate::strategy::engine::DecisionEngine;

/// Run `poll_once` on the runtime update interval until `stop` flips to true.
pub fn spawn_poller(state: AppState, mut stop: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = {
            let runtime = state.runtime.read().await;
            Duration::from_millis(runtime.update_interval.max(1_000))
        };
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval_ms = period.as_millis() as u64, "Market poller started");

        loop {
            tokio::select! {
                _ = ticker.tick() => poll_once(&state).await,
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Market poller stopped");
    })
}

#[instrument(skip(state))]
pub async fn poll_once(state: &AppState) {
    let (asset, fiat, appetite, threshold) = {
        let runtime = state.runtime.read().await;
        (
            runtime.default_asset().to_string(),
            runtime.fiat_currency.clone(),
            runtime.risk_appetite,
            runtime.deviation_threshold,
        )
    };

    let eval = DecisionEngine::new(state.feed.as_ref(), state.locale())
        .evaluate(&asset, &fiat, appetite)
        .await;

    if let Some(spot) = eval.spot_price {
        let found = detect(&eval.buy, &eval.sell, spot, threshold);
        let added = state.anomalies.write().await.record_all(found);
        if added > 0 {
            info!(count = added, threshold, "New price anomalies");
        }
    }

    state.publish(ServerEvent::Anomalies(state.dashboard_payload().await));

    *state.latest_decision.write().await = eval.decision.clone();
    state.publish(ServerEvent::MarketDecision(eval.decision));

    if !eval.buy.is_empty() {
        let (saved, batch) = {
            let mut monitor = state.alert_monitor.lock().await;
            let saved = monitor.observe(&eval.buy);
            let batch = if state.alerts.is_enabled() {
                monitor.take_alert(&eval.buy, Instant::now())
            } else {
                None
            };
            (saved, batch)
        };
        if let Some(saved) = saved {
            saved.save().await;
        }
        if let Some(batch) = batch {
            state.alerts.price_alert(&batch).await;
        }
    }

    if let Some(input) = eval.failed_input {
        warn!(input, "Poll completed with missing input");
    }
    state.health.record_poll(eval.failed_input.map(String::from)).await;
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::dashboard::test_state;
    use crate::data::binance::Liquidity;
    use crate::data::MarketFeed;
    use crate::market::error::FetchError;
    use crate::market::models::{sample_ad, Advertisement, TradeType};
    use crate::strategy::decision::Decision;

    struct StubFeed {
        buy: Vec<Advertisement>,
        sell: Vec<Advertisement>,
        spot: Option<Decimal>,
    }

    #[async_trait]
    impl MarketFeed for StubFeed {
        async fn btc_change_24h(&self) -> Result<f64, FetchError> {
            Ok(0.5)
        }

        async fn p2p_ads(&self, _: &str, _: &str, trade_type: TradeType) -> Result<Vec<Advertisement>, FetchError> {
            Ok(match trade_type {
                TradeType::Buy => self.buy.clone(),
                TradeType::Sell => self.sell.clone(),
            })
        }

        async fn spot_price(&self) -> Option<Decimal> {
            self.spot
        }

        async fn liquidity(&self) -> Liquidity {
            Liquidity::default()
        }
    }

    fn state_with(name: &str, feed: StubFeed) -> AppState {
        let mut state = test_state(name);
        state.feed = Arc::new(feed);
        state
    }

    #[tokio::test]
    async fn test_repeated_polls_record_each_listing_once() {
        let state = state_with(
            "poll-repeat",
            StubFeed {
                buy: vec![sample_ad("b", "u1", "27000", "1", "2")],
                sell: vec![sample_ad("s", "u2", "24000", "1", "2")],
                spot: Some(dec!(25500)),
            },
        );

        for _ in 0..3 {
            poll_once(&state).await;
        }
        assert_eq!(state.anomalies.read().await.len(), 2);
    }

    #[tokio::test]
    async fn test_poll_records_only_anomalies_at_threshold() {
        let state = state_with(
            "poll-threshold",
            StubFeed {
                // +1.96% and +5.88% against 25 500
                buy: vec![
                    sample_ad("near", "u1", "26000", "1", "2"),
                    sample_ad("far", "u2", "27000", "1", "2"),
                ],
                sell: vec![],
                spot: Some(dec!(25500)),
            },
        );
        state.runtime.write().await.deviation_threshold = 3.0;

        poll_once(&state).await;

        let feed = state.anomalies.read().await.snapshot(None);
        let names: Vec<&str> = feed.iter().map(|a| a.merchant.as_str()).collect();
        assert_eq!(names, vec!["far"]);
    }

    #[tokio::test]
    async fn test_poll_skips_anomalies_without_spot() {
        let state = state_with(
            "poll-no-spot",
            StubFeed {
                buy: vec![sample_ad("far", "u2", "27000", "1", "2")],
                sell: vec![],
                spot: None,
            },
        );

        poll_once(&state).await;
        assert!(state.anomalies.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_poll_broadcasts_feed_then_decision() {
        let state = state_with(
            "poll-broadcast",
            StubFeed {
                buy: vec![sample_ad("b", "u1", "26000", "1", "2")],
                sell: vec![sample_ad("s", "u2", "26100", "1", "2")],
                spot: Some(dec!(26050)),
            },
        );
        let mut rx = state.events.subscribe();

        poll_once(&state).await;

        match rx.try_recv() {
            Ok(ServerEvent::Anomalies(payload)) => assert!(payload.config.is_some()),
            other => panic!("expected anomalies first, got {other:?}"),
        }
        match rx.try_recv() {
            Ok(ServerEvent::MarketDecision(d)) => assert_ne!(d.decision, Decision::Analyzing),
            other => panic!("expected a decision, got {other:?}"),
        }

        assert_ne!(state.latest_decision.read().await.decision, Decision::Analyzing);
        let health = state.health.snapshot().await;
        assert_eq!(health.poll_count, 1);
        assert!(health.last_error.is_none());
    }

    #[tokio::test]
    async fn test_alerts_not_taken_while_discord_disabled() {
        let reference = vec![sample_ad("ref", "u0", "26200", "1", "2")];
        let drop = vec![
            sample_ad("ref", "u0", "26200", "1", "2"),
            sample_ad("cheap", "u1", "26000", "1", "2"),
        ];

        let mut state = state_with(
            "poll-alerts",
            StubFeed {
                buy: reference,
                sell: vec![],
                spot: None,
            },
        );
        assert!(!state.alerts.is_enabled());
        poll_once(&state).await;

        state.feed = Arc::new(StubFeed {
            buy: drop.clone(),
            sell: vec![],
            spot: None,
        });
        poll_once(&state).await;

        let monitor = state.alert_monitor.lock().await;
        assert_eq!(monitor.previous().map(|t| t.price), Some(dec!(26200)));
        // Still pending: nothing was marked as notified
        let pending = monitor.pending(&drop);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].merchant, "cheap");
    }
}
