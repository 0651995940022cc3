//! Market-decision scorer.
//!
//! Five independent factors each vote for buying or selling. The vote count
//! is compared against the thresholds of the configured risk appetite to
//! produce BUY, SELL or HOLD with a confidence level. Everything here is
//! pure: inputs arrive as a `MarketSignals` snapshot.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::strategy::session::Session;

/// BTC 24h change above/below which the trend is UP/DOWN.
pub const TREND_BAND_PCT: f64 = 1.5;
/// BTC 24h change below which the BTC factor favours buying.
pub const BTC_BUY_BELOW_PCT: f64 = -0.1;
/// Spread above which it counts as wide.
pub const WIDE_SPREAD_PCT: f64 = 1.5;
/// Liquidity ratio below which the factor favours buying.
pub const LIQUIDITY_BUY_BELOW: f64 = 45.0;

const FACTOR_COUNT: u8 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskAppetite {
    Safe,
    #[default]
    Balanced,
    Aggressive,
}

impl RiskAppetite {
    pub fn thresholds(self) -> RiskThresholds {
        match self {
            Self::Safe => RiskThresholds { buy: 4, sell: 4 },
            Self::Balanced => RiskThresholds { buy: 3, sell: 4 },
            Self::Aggressive => RiskThresholds { buy: 3, sell: 3 },
        }
    }
}

impl FromStr for RiskAppetite {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "safe" => Ok(Self::Safe),
            "balanced" => Ok(Self::Balanced),
            "aggressive" => Ok(Self::Aggressive),
            other => Err(format!("unknown risk appetite: {other}")),
        }
    }
}

/// Language of reason strings and session labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Locale {
    #[default]
    Vi,
    En,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RiskThresholds {
    pub buy: u8,
    pub sell: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Trend {
    Up,
    Down,
    Neutral,
}

pub fn classify_trend(change24h: f64) -> Trend {
    if change24h > TREND_BAND_PCT {
        Trend::Up
    } else if change24h < -TREND_BAND_PCT {
        Trend::Down
    } else {
        Trend::Neutral
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Decision {
    Buy,
    Sell,
    Hold,
    Analyzing,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
            Self::Hold => "HOLD",
            Self::Analyzing => "ANALYZING",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

/// Inputs to one scoring run.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketSignals {
    pub btc_change_24h: f64,
    pub best_buy: Option<Decimal>,
    pub best_sell: Option<Decimal>,
    pub spot_price: Option<Decimal>,
    /// Hour of day in UTC+7.
    pub hour: u32,
    pub buy_ad_count: usize,
    pub sell_ad_count: usize,
    pub buy_volume: Decimal,
    pub sell_volume: Decimal,
    pub buy_liquidity: Decimal,
    pub sell_liquidity: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BtcFactor {
    pub change24h: f64,
    pub trend: Trend,
    pub favors_buying: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpreadFactor {
    pub best_buy: Option<Decimal>,
    pub best_sell: Option<Decimal>,
    pub percent: f64,
    pub wide: bool,
    pub favors_buying: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionFactor {
    pub session: Session,
    pub name: &'static str,
    pub hour: u32,
    pub favors_buying: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompetitionFactor {
    pub buy_ads_count: usize,
    pub sell_ads_count: usize,
    pub buy_volume: Decimal,
    pub sell_volume: Decimal,
    pub favors_buying: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiquidityFactor {
    pub buy: Decimal,
    pub sell: Decimal,
    pub ratio: f64,
    pub favors_buying: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionMetrics {
    pub btc: BtcFactor,
    pub spread: SpreadFactor,
    pub session: SessionFactor,
    pub competition: CompetitionFactor,
    pub liquidity: LiquidityFactor,
    pub buy_factors: u8,
    pub sell_factors: u8,
    pub risk_appetite: RiskAppetite,
    pub thresholds: RiskThresholds,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketDecision {
    pub decision: Decision,
    pub confidence: Confidence,
    pub reason: String,
    pub metrics: Option<DecisionMetrics>,
    pub timestamp: DateTime<Utc>,
}

impl MarketDecision {
    /// Placeholder before the first poll completes.
    pub fn analyzing(locale: Locale) -> Self {
        let reason = match locale {
            Locale::Vi => "Đang phân tích thị trường...",
            Locale::En => "Analyzing market...",
        };
        Self {
            decision: Decision::Analyzing,
            confidence: Confidence::Low,
            reason: reason.to_string(),
            metrics: None,
            timestamp: Utc::now(),
        }
    }

    /// HOLD/LOW when the inputs could not be gathered.
    pub fn unavailable(locale: Locale, detail: &str) -> Self {
        let reason = match locale {
            Locale::Vi => format!("Không đủ dữ liệu thị trường để phân tích ({detail}). Tạm thời GIỮ."),
            Locale::En => format!("Not enough market data to decide ({detail}). Holding for now."),
        };
        Self {
            decision: Decision::Hold,
            confidence: Confidence::Low,
            reason,
            metrics: None,
            timestamp: Utc::now(),
        }
    }
}

/// `|sell - buy| / reference * 100`, where the reference is spot when known
/// and the midpoint of the two prices otherwise.
pub fn spread_percent(best_buy: Option<Decimal>, best_sell: Option<Decimal>, spot: Option<Decimal>) -> f64 {
    let (Some(buy), Some(sell)) = (best_buy, best_sell) else {
        return 0.0;
    };
    let reference = spot
        .filter(|s| *s > Decimal::ZERO)
        .unwrap_or((buy + sell) / Decimal::TWO);
    if reference <= Decimal::ZERO {
        return 0.0;
    }
    ((sell - buy).abs() * Decimal::ONE_HUNDRED / reference)
        .to_f64()
        .unwrap_or(0.0)
}

pub fn is_wide_spread(percent: f64) -> bool {
    percent > WIDE_SPREAD_PCT
}

/// Buy share of total liquidity, in percent. 50 when both sides are empty.
pub fn liquidity_ratio(buy: Decimal, sell: Decimal) -> f64 {
    let total = buy + sell;
    if total <= Decimal::ZERO {
        50.0
    } else {
        (buy * Decimal::ONE_HUNDRED / total).to_f64().unwrap_or(50.0)
    }
}

/// Map a buy-factor count to a decision and confidence.
pub fn aggregate(buy_factors: u8, appetite: RiskAppetite) -> (Decision, Confidence) {
    let buy = buy_factors.min(FACTOR_COUNT);
    let sell = FACTOR_COUNT - buy;
    let t = appetite.thresholds();

    let decision = match (buy >= t.buy, sell >= t.sell) {
        (true, false) => Decision::Buy,
        (false, true) => Decision::Sell,
        (true, true) if buy > sell => Decision::Buy,
        (true, true) if sell > buy => Decision::Sell,
        _ => Decision::Hold,
    };

    let confidence = match decision {
        Decision::Buy => confidence_for(buy),
        Decision::Sell => confidence_for(sell),
        _ => Confidence::Medium,
    };

    (decision, confidence)
}

fn confidence_for(agreeing: u8) -> Confidence {
    match agreeing {
        n if n >= 4 => Confidence::High,
        3 => Confidence::Medium,
        _ => Confidence::Low,
    }
}

/// Score one snapshot.
pub fn score(signals: &MarketSignals, appetite: RiskAppetite, locale: Locale) -> MarketDecision {
    let change = signals.btc_change_24h;
    let btc = BtcFactor {
        change24h: change,
        trend: classify_trend(change),
        favors_buying: change < BTC_BUY_BELOW_PCT,
    };

    let percent = spread_percent(signals.best_buy, signals.best_sell, signals.spot_price);
    let wide = is_wide_spread(percent);
    let spread = SpreadFactor {
        best_buy: signals.best_buy,
        best_sell: signals.best_sell,
        percent,
        wide,
        favors_buying: wide,
    };

    let current = Session::at_hour(signals.hour);
    let session = SessionFactor {
        session: current,
        name: current.label(locale),
        hour: signals.hour,
        favors_buying: current.favors_buying(btc.favors_buying),
    };

    let competition = CompetitionFactor {
        buy_ads_count: signals.buy_ad_count,
        sell_ads_count: signals.sell_ad_count,
        buy_volume: signals.buy_volume,
        sell_volume: signals.sell_volume,
        favors_buying: signals.sell_volume > signals.buy_volume,
    };

    let ratio = liquidity_ratio(signals.buy_liquidity, signals.sell_liquidity);
    let liquidity = LiquidityFactor {
        buy: signals.buy_liquidity,
        sell: signals.sell_liquidity,
        ratio,
        favors_buying: ratio < LIQUIDITY_BUY_BELOW,
    };

    let votes = [
        (btc.favors_buying, factor_name(FactorKind::Btc, locale)),
        (spread.favors_buying, factor_name(FactorKind::Spread, locale)),
        (session.favors_buying, session.name),
        (competition.favors_buying, factor_name(FactorKind::Competition, locale)),
        (liquidity.favors_buying, factor_name(FactorKind::Liquidity, locale)),
    ];

    let buy_factors = votes.iter().filter(|(b, _)| *b).count() as u8;
    let sell_factors = FACTOR_COUNT - buy_factors;
    let (decision, confidence) = aggregate(buy_factors, appetite);

    let supporting: Vec<&str> = votes
        .iter()
        .filter(|(b, _)| match decision {
            Decision::Buy => *b,
            Decision::Sell => !*b,
            _ => false,
        })
        .map(|(_, name)| *name)
        .collect();

    let reason = build_reason(decision, buy_factors, sell_factors, &supporting, locale);

    MarketDecision {
        decision,
        confidence,
        reason,
        metrics: Some(DecisionMetrics {
            btc,
            spread,
            session,
            competition,
            liquidity,
            buy_factors,
            sell_factors,
            risk_appetite: appetite,
            thresholds: appetite.thresholds(),
        }),
        timestamp: Utc::now(),
    }
}

enum FactorKind {
    Btc,
    Spread,
    Competition,
    Liquidity,
}

fn factor_name(kind: FactorKind, locale: Locale) -> &'static str {
    match (kind, locale) {
        (FactorKind::Btc, Locale::Vi) => "xu hướng BTC",
        (FactorKind::Spread, Locale::Vi) => "chênh lệch giá",
        (FactorKind::Competition, Locale::Vi) => "mức độ cạnh tranh",
        (FactorKind::Liquidity, Locale::Vi) => "thanh khoản",
        (FactorKind::Btc, Locale::En) => "BTC trend",
        (FactorKind::Spread, Locale::En) => "spread",
        (FactorKind::Competition, Locale::En) => "competition",
        (FactorKind::Liquidity, Locale::En) => "liquidity",
    }
}

fn build_reason(decision: Decision, buy: u8, sell: u8, supporting: &[&str], locale: Locale) -> String {
    let list = supporting.join(", ");
    match (decision, locale) {
        (Decision::Buy, Locale::Vi) => {
            format!("Thuận lợi cho đăng quảng cáo MUA: {buy}/{FACTOR_COUNT} yếu tố ủng hộ ({list}).")
        }
        (Decision::Sell, Locale::Vi) => {
            format!("Thuận lợi cho đăng quảng cáo BÁN: {sell}/{FACTOR_COUNT} yếu tố ủng hộ ({list}).")
        }
        (_, Locale::Vi) => {
            format!("Tín hiệu chưa rõ ràng: {buy} yếu tố MUA, {sell} yếu tố BÁN. Nên chờ thêm.")
        }
        (Decision::Buy, Locale::En) => {
            format!("Favourable for BUY ads: {buy}/{FACTOR_COUNT} factors agree ({list}).")
        }
        (Decision::Sell, Locale::En) => {
            format!("Favourable for SELL ads: {sell}/{FACTOR_COUNT} factors agree ({list}).")
        }
        (_, Locale::En) => {
            format!("Mixed signals: {buy} buy factors, {sell} sell factors. Wait for a clearer setup.")
        }
    }
}
