pub mod backoff;
pub mod binance;
pub mod coingecko;

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::data::binance::{BinanceSpotSource, Liquidity, BTC_SYMBOL};
use crate::data::coingecko::CoinGeckoSource;
use crate::market::error::FetchError;
use crate::market::models::{Advertisement, TradeType};
use crate::market::p2p::P2pClient;

/// Market inputs the decision engine reads.
/// The live implementation talks to Binance and CoinGecko; tests use stubs.
#[async_trait]
pub trait MarketFeed: Send + Sync {
    /// BTCUSDT 24h change in percent.
    async fn btc_change_24h(&self) -> Result<f64, FetchError>;

    /// Best `top_n` ads for one direction, best price first.
    async fn p2p_ads(
        &self,
        asset: &str,
        fiat: &str,
        trade_type: TradeType,
    ) -> Result<Vec<Advertisement>, FetchError>;

    /// Reference spot price in fiat, `None` when no real quote is available.
    async fn spot_price(&self) -> Option<Decimal>;

    /// Order-book liquidity. Never fails.
    async fn liquidity(&self) -> Liquidity;
}

/// `MarketFeed` backed by the live HTTP sources.
pub struct LiveMarketFeed {
    pub p2p: Arc<P2pClient>,
    pub spot: Arc<BinanceSpotSource>,
    pub coingecko: Arc<CoinGeckoSource>,
}

#[async_trait]
impl MarketFeed for LiveMarketFeed {
    async fn btc_change_24h(&self) -> Result<f64, FetchError> {
        Ok(self.spot.ticker_24h(BTC_SYMBOL).await?.price_change_percent)
    }

    async fn p2p_ads(
        &self,
        asset: &str,
        fiat: &str,
        trade_type: TradeType,
    ) -> Result<Vec<Advertisement>, FetchError> {
        self.p2p.fetch_side(asset, fiat, trade_type).await
    }

    async fn spot_price(&self) -> Option<Decimal> {
        let quote = self.coingecko.usdt_vnd().await;
        quote.is_real().then_some(quote.price)
    }

    async fn liquidity(&self) -> Liquidity {
        self.spot.liquidity_or_default().await
    }
}
