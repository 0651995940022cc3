use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::data::MarketFeed;
use crate::market::error::FetchError;
use crate::market::models::{Advertisement, BestPrices, TradeType};
use crate::strategy::decision::{score, Locale, MarketDecision, MarketSignals, RiskAppetite};
use crate::strategy::session::vietnam_hour;

/// Everything one decision run gathered, kept so the poller can reuse the
/// ads for anomalies and alerts without fetching twice.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub decision: MarketDecision,
    pub buy: Vec<Advertisement>,
    pub sell: Vec<Advertisement>,
    pub spot_price: Option<Decimal>,
    /// The input that forced a HOLD/LOW, if any.
    pub failed_input: Option<&'static str>,
}

pub struct DecisionEngine<'a> {
    feed: &'a dyn MarketFeed,
    locale: Locale,
}

impl<'a> DecisionEngine<'a> {
    pub fn new(feed: &'a dyn MarketFeed, locale: Locale) -> Self {
        Self { feed, locale }
    }

    /// Gather inputs and score them. Never fails: missing BTC stats or P2P
    /// ads yield HOLD/LOW.
    pub async fn evaluate(&self, asset: &str, fiat: &str, appetite: RiskAppetite) -> Evaluation {
        let (btc, buy, sell, spot, liquidity) = tokio::join!(
            self.feed.btc_change_24h(),
            self.feed.p2p_ads(asset, fiat, TradeType::Buy),
            self.feed.p2p_ads(asset, fiat, TradeType::Sell),
            self.feed.spot_price(),
            self.feed.liquidity(),
        );

        let (btc_change, buy, sell) = match (btc, buy, sell) {
            (Ok(change), Ok(buy), Ok(sell)) => (change, buy, sell),
            (btc, buy, sell) => {
                let what = if btc.is_err() {
                    "BTC 24h stats"
                } else if buy.is_err() {
                    "P2P BUY ads"
                } else {
                    "P2P SELL ads"
                };
                let error = [btc.as_ref().err(), buy.as_ref().err(), sell.as_ref().err()]
                    .into_iter()
                    .flatten()
                    .next();
                warn!(
                    input = what,
                    error = ?error,
                    error_type = error.map(FetchError::error_type).unwrap_or("unknown_error"),
                    "Decision input unavailable, holding"
                );
                return Evaluation {
                    decision: MarketDecision::unavailable(self.locale, what),
                    buy: buy.unwrap_or_default(),
                    sell: sell.unwrap_or_default(),
                    spot_price: spot,
                    failed_input: Some(what),
                };
            }
        };

        let best = BestPrices::from_ads(&buy, &sell);
        let signals = MarketSignals {
            btc_change_24h: btc_change,
            best_buy: best.best_buy,
            best_sell: best.best_sell,
            spot_price: spot,
            hour: vietnam_hour(Utc::now()),
            buy_ad_count: buy.len(),
            sell_ad_count: sell.len(),
            buy_volume: total_volume(&buy),
            sell_volume: total_volume(&sell),
            buy_liquidity: liquidity.buy,
            sell_liquidity: liquidity.sell,
        };

        let decision = score(&signals, appetite, self.locale);
        info!(
            decision = %decision.decision,
            confidence = ?decision.confidence,
            risk = ?appetite,
            "Market decision computed"
        );

        Evaluation {
            decision,
            buy,
            sell,
            spot_price: spot,
            failed_input: None,
        }
    }
}

fn total_volume(ads: &[Advertisement]) -> Decimal {
    ads.iter().map(Advertisement::available_volume).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::binance::Liquidity;
    use crate::market::models::sample_ad;
    use crate::strategy::decision::{Confidence, Decision};
    use async_trait::async_trait;

    struct StubFeed {
        btc: Result<f64, ()>,
        fail_sell: bool,
    }

    #[async_trait]
    impl MarketFeed for StubFeed {
        async fn btc_change_24h(&self) -> Result<f64, FetchError> {
            self.btc.map_err(|_| FetchError::Timeout("stub".to_string()))
        }

        async fn p2p_ads(&self, _: &str, _: &str, trade_type: TradeType) -> Result<Vec<Advertisement>, FetchError> {
            match trade_type {
                TradeType::Sell if self.fail_sell => Err(FetchError::RateLimited),
                TradeType::Buy => Ok(vec![sample_ad("b", "u1", "26000", "1", "2")]),
                TradeType::Sell => Ok(vec![sample_ad("s", "u2", "26100", "1", "2")]),
            }
        }

        async fn spot_price(&self) -> Option<Decimal> {
            None
        }

        async fn liquidity(&self) -> Liquidity {
            Liquidity::default()
        }
    }

    #[tokio::test]
    async fn test_btc_failure_holds_low() {
        let feed = StubFeed { btc: Err(()), fail_sell: false };
        let eval = DecisionEngine::new(&feed, Locale::En)
            .evaluate("USDT", "VND", RiskAppetite::Balanced)
            .await;
        assert_eq!(eval.decision.decision, Decision::Hold);
        assert_eq!(eval.decision.confidence, Confidence::Low);
        assert!(eval.decision.reason.contains("BTC"));
        // The successful sides are still handed back
        assert_eq!(eval.buy.len(), 1);
    }

    #[tokio::test]
    async fn test_p2p_failure_holds_low() {
        let feed = StubFeed { btc: Ok(0.2), fail_sell: true };
        let eval = DecisionEngine::new(&feed, Locale::Vi)
            .evaluate("USDT", "VND", RiskAppetite::Aggressive)
            .await;
        assert_eq!(eval.decision.decision, Decision::Hold);
        assert_eq!(eval.decision.confidence, Confidence::Low);
        assert_eq!(eval.failed_input, Some("P2P SELL ads"));
    }

    #[tokio::test]
    async fn test_full_inputs_are_scored() {
        let feed = StubFeed { btc: Ok(-3.0), fail_sell: false };
        let eval = DecisionEngine::new(&feed, Locale::En)
            .evaluate("USDT", "VND", RiskAppetite::Balanced)
            .await;
        let metrics = eval.decision.metrics.expect("scored decision carries metrics");
        assert!(metrics.btc.favors_buying);
        assert_eq!(metrics.competition.buy_ads_count, 1);
        assert_eq!(metrics.liquidity.ratio, 50.0);
        assert_ne!(eval.decision.decision, Decision::Analyzing);
    }
}
