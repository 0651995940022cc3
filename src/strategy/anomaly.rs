//! Price-deviation anomalies and the bounded feed pushed to dashboards.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::market::models::{lenient_decimal, Advertisement, TradeType};

pub const FEED_CAPACITY: usize = 200;

/// An ad whose price deviates from spot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Anomaly {
    #[serde(default)]
    pub adv_no: Option<String>,
    pub merchant: String,
    #[serde(default)]
    pub user_no: Option<String>,
    pub trade_type: TradeType,
    #[serde(deserialize_with = "lenient_decimal")]
    pub price: Decimal,
    #[serde(deserialize_with = "lenient_decimal")]
    pub spot_price: Decimal,
    /// `(price - spot) / spot * 100`
    pub deviation: f64,
    pub timestamp: DateTime<Utc>,
}

impl Anomaly {
    pub fn from_ad(ad: &Advertisement, trade_type: TradeType, spot: Decimal, now: DateTime<Utc>) -> Option<Self> {
        let deviation = deviation_percent(ad.adv.price, spot)?;
        Some(Self {
            adv_no: ad.adv.adv_no.clone(),
            merchant: ad.advertiser.nick_name.clone(),
            user_no: Some(ad.advertiser.user_no.clone()),
            trade_type,
            price: ad.adv.price,
            spot_price: spot,
            deviation,
            timestamp: now,
        })
    }

    pub fn exceeds(&self, threshold: f64) -> bool {
        self.deviation.abs() >= threshold
    }

    /// Same ad on the same side at the same price. Ads without an `advNo`
    /// fall back to the advertiser.
    pub fn same_listing(&self, other: &Anomaly) -> bool {
        let key = |a: &Anomaly| {
            a.adv_no
                .clone()
                .or_else(|| a.user_no.clone())
                .unwrap_or_else(|| a.merchant.clone())
        };
        self.trade_type == other.trade_type && self.price == other.price && key(self) == key(other)
    }
}

pub fn deviation_percent(price: Decimal, spot: Decimal) -> Option<f64> {
    if spot <= Decimal::ZERO {
        return None;
    }
    ((price - spot) * Decimal::ONE_HUNDRED / spot).to_f64()
}

/// Ads from both sides whose deviation reaches `threshold`.
pub fn detect(
    buy: &[Advertisement],
    sell: &[Advertisement],
    spot: Decimal,
    threshold: f64,
) -> Vec<Anomaly> {
    let now = Utc::now();
    buy.iter()
        .map(|ad| (ad, TradeType::Buy))
        .chain(sell.iter().map(|ad| (ad, TradeType::Sell)))
        .filter_map(|(ad, side)| Anomaly::from_ad(ad, side, spot, now))
        .filter(|a| a.exceeds(threshold))
        .collect()
}

/// FIFO of recent anomalies. The oldest entry is dropped once full.
#[derive(Debug, Default)]
pub struct AnomalyFeed {
    entries: VecDeque<Anomaly>,
}

impl AnomalyFeed {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::with_capacity(FEED_CAPACITY),
        }
    }

    pub fn push(&mut self, anomaly: Anomaly) {
        if self.entries.len() == FEED_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back(anomaly);
    }

    pub fn extend(&mut self, anomalies: impl IntoIterator<Item = Anomaly>) {
        for a in anomalies {
            self.push(a);
        }
    }

    /// Push unless the same listing is already in the feed.
    pub fn record(&mut self, anomaly: Anomaly) -> bool {
        if self.entries.iter().any(|a| a.same_listing(&anomaly)) {
            return false;
        }
        self.push(anomaly);
        true
    }

    /// `record` each entry, returning how many were new.
    pub fn record_all(&mut self, anomalies: impl IntoIterator<Item = Anomaly>) -> usize {
        anomalies.into_iter().map(|a| self.record(a)).filter(|added| *added).count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries at or above `threshold`, or the whole feed when `None`.
    pub fn snapshot(&self, threshold: Option<f64>) -> Vec<Anomaly> {
        match threshold {
            Some(t) => self.entries.iter().filter(|a| a.exceeds(t)).cloned().collect(),
            None => self.entries.iter().cloned().collect(),
        }
    }
}

#[cfg(test)]
pub(crate) fn sample_anomaly(merchant: &str, deviation: f64) -> Anomaly {
    use rust_decimal_macros::dec;

    Anomaly {
        adv_no: None,
        merchant: merchant.to_string(),
        user_no: None,
        trade_type: TradeType::Buy,
        price: dec!(26000),
        spot_price: dec!(25900),
        deviation,
        timestamp: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::models::sample_ad;
    use rust_decimal_macros::dec;

    #[test]
    fn test_feed_caps_and_drops_oldest() {
        let mut feed = AnomalyFeed::new();
        for i in 0..(FEED_CAPACITY + 5) {
            feed.push(sample_anomaly(&format!("m{i}"), 1.0));
        }
        assert_eq!(feed.len(), FEED_CAPACITY);

        let all = feed.snapshot(None);
        assert_eq!(all.first().unwrap().merchant, "m5");
        assert_eq!(all.last().unwrap().merchant, format!("m{}", FEED_CAPACITY + 4));
    }

    #[test]
    fn test_snapshot_threshold_inclusive() {
        let mut feed = AnomalyFeed::new();
        feed.extend([sample_anomaly("a", 0.4), sample_anomaly("b", -0.5), sample_anomaly("c", 2.0)]);

        let filtered = feed.snapshot(Some(0.5));
        let names: Vec<&str> = filtered.iter().map(|a| a.merchant.as_str()).collect();
        assert_eq!(names, vec!["b", "c"]);
    }

    #[test]
    fn test_detect_both_sides() {
        let buy = vec![
            sample_ad("cheap", "u1", "25000", "1", "2"),
            sample_ad("close", "u2", "25010", "1", "2"),
        ];
        let sell = vec![sample_ad("rich", "u3", "26000", "1", "2")];

        let found = detect(&buy, &sell, dec!(25000), 2.0);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].merchant, "rich");
        assert_eq!(found[0].trade_type, TradeType::Sell);
        assert_eq!(found[0].deviation, 4.0);
        assert_eq!(found[0].price, dec!(26000));
    }

    #[test]
    fn test_deviation_requires_positive_spot() {
        assert!(deviation_percent(dec!(100), Decimal::ZERO).is_none());
        assert_eq!(deviation_percent(dec!(110), dec!(100)), Some(10.0));
        assert_eq!(deviation_percent(dec!(24000), dec!(25500)).map(|d| d < 0.0), Some(true));
    }

    #[test]
    fn test_client_anomaly_deserializes() {
        let raw = serde_json::json!({
            "merchant": "x",
            "tradeType": "SELL",
            "price": 26100,
            "spotPrice": 25900,
            "deviation": 0.77,
            "timestamp": "2024-05-01T03:00:00Z"
        });
        let a: Anomaly = serde_json::from_value(raw).unwrap();
        assert_eq!(a.trade_type, TradeType::Sell);
        assert_eq!(a.price, dec!(26100));
        assert!(a.adv_no.is_none());

        // Money goes back out as strings
        let out = serde_json::to_value(&a).unwrap();
        assert_eq!(out["price"], "26100");
    }

    #[test]
    fn test_record_skips_repeated_listing() {
        let buy = vec![sample_ad("cheap", "u1", "27000", "1", "2")];
        let sell = vec![sample_ad("rich", "u2", "24000", "1", "2")];

        let mut feed = AnomalyFeed::new();
        for _ in 0..3 {
            feed.record_all(detect(&buy, &sell, dec!(25500), 0.5));
        }
        assert_eq!(feed.len(), 2);

        // Repricing makes a new listing
        let repriced = vec![sample_ad("cheap", "u1", "27100", "1", "2")];
        assert_eq!(feed.record_all(detect(&repriced, &[], dec!(25500), 0.5)), 1);
        assert_eq!(feed.len(), 3);
    }
}
