use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};

/// A single Binance P2P advertisement, as returned by the ad-search API.
///
/// Fields the dashboard reads are typed; everything else is carried in
/// `extra` so the ad can be passed through to clients unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Advertisement {
    pub adv: Adv,
    pub advertiser: Advertiser,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Adv {
    #[serde(default)]
    pub adv_no: Option<String>,
    pub price: Decimal,
    #[serde(default)]
    pub min_single_trans_amount: Option<Decimal>,
    #[serde(default)]
    pub max_single_trans_amount: Option<Decimal>,
    #[serde(default)]
    pub surplus_amount: Option<Decimal>,
    #[serde(default)]
    pub trade_methods: Vec<TradeMethod>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Advertiser {
    pub nick_name: String,
    pub user_no: String,
    #[serde(default)]
    pub user_type: Option<String>,
    #[serde(default)]
    pub month_order_count: Option<u64>,
    #[serde(default)]
    pub month_finish_rate: Option<f64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeMethod {
    #[serde(default)]
    pub identifier: String,
    #[serde(default)]
    pub trade_method_name: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Advertisement {
    pub fn is_merchant(&self) -> bool {
        self.advertiser
            .user_type
            .as_deref()
            .is_some_and(|t| t.eq_ignore_ascii_case("merchant"))
    }

    /// Whether a single order of `amount` fits inside this ad's limits.
    /// Missing bounds are treated as open.
    pub fn accepts_amount(&self, amount: Decimal) -> bool {
        let above_min = self
            .adv
            .min_single_trans_amount
            .map_or(true, |min| min <= amount);
        let below_max = self
            .adv
            .max_single_trans_amount
            .map_or(true, |max| amount <= max);
        above_min && below_max
    }

    /// Whether this ad's limits overlap the `[from, to]` amount range.
    pub fn overlaps_range(&self, from: Decimal, to: Decimal) -> bool {
        let min_ok = self.adv.min_single_trans_amount.map_or(true, |min| min <= to);
        let max_ok = self.adv.max_single_trans_amount.map_or(true, |max| max >= from);
        min_ok && max_ok
    }

    pub fn available_volume(&self) -> Decimal {
        self.adv.surplus_amount.unwrap_or(Decimal::ZERO)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeType {
    Buy,
    Sell,
}

impl TradeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for TradeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lowest-priced merchant buy ad of a poll, kept to compare consecutive polls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Top1Merchant {
    pub name: String,
    pub price: Decimal,
    pub user_no: String,
}

impl Top1Merchant {
    /// Cheapest merchant of a buy-side list. Non-merchant ads are ignored and
    /// the list need not be sorted.
    pub fn from_buy_ads(ads: &[Advertisement]) -> Option<Self> {
        ads.iter()
            .filter(|ad| ad.is_merchant())
            .min_by_key(|ad| ad.adv.price)
            .map(|ad| Self {
                name: ad.advertiser.nick_name.clone(),
                price: ad.adv.price,
                user_no: ad.advertiser.user_no.clone(),
            })
    }
}

/// Best prices from a pair of BUY/SELL ad lists.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BestPrices {
    pub best_buy: Option<Decimal>,
    pub best_sell: Option<Decimal>,
}

impl BestPrices {
    pub fn from_ads(buy: &[Advertisement], sell: &[Advertisement]) -> Self {
        Self {
            best_buy: buy.iter().map(|ad| ad.adv.price).min(),
            best_sell: sell.iter().map(|ad| ad.adv.price).max(),
        }
    }
}

/// Decimal from a JSON number, including exponent forms like `2.6e4`.
pub fn decimal_from_number(n: &serde_json::Number) -> Option<Decimal> {
    let text = n.to_string();
    text.parse::<Decimal>()
        .ok()
        .or_else(|| Decimal::from_scientific(&text).ok())
}

/// `deserialize_with` for money that may arrive as a JSON number or a string.
pub fn lenient_decimal<'de, D>(deserializer: D) -> Result<Decimal, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(serde_json::Number),
        Text(String),
    }

    let parsed = match Raw::deserialize(deserializer)? {
        Raw::Number(n) => decimal_from_number(&n),
        Raw::Text(s) => s.trim().parse::<Decimal>().ok(),
    };
    parsed.ok_or_else(|| serde::de::Error::custom("expected a decimal number"))
}

#[cfg(test)]
pub(crate) fn sample_ad(nick: &str, user_no: &str, price: &str, min: &str, max: &str) -> Advertisement {
    serde_json::from_value(serde_json::json!({
        "adv": {
            "advNo": format!("adv-{user_no}-{price}"),
            "price": price,
            "minSingleTransAmount": min,
            "maxSingleTransAmount": max,
            "surplusAmount": "1000.00",
            "tradeMethods": [
                {"identifier": "BankTransferVietnam", "tradeMethodName": "Bank Transfer (Vietnam)"}
            ]
        },
        "advertiser": {
            "nickName": nick,
            "userNo": user_no,
            "userType": "merchant",
            "monthOrderCount": 120,
            "monthFinishRate": 0.98
        }
    }))
    .expect("sample ad should deserialize")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_ad_keeps_unknown_fields() {
        let raw = serde_json::json!({
            "adv": {
                "price": "26150.00",
                "tradableQuantity": "500.00",
                "tradeMethods": [{"identifier": "Momo", "tradeMethodName": null, "payType": "Momo"}]
            },
            "advertiser": {
                "nickName": "alice",
                "userNo": "u1",
                "userGrade": 2
            },
            "privilegeDesc": null
        });

        let ad: Advertisement = serde_json::from_value(raw).unwrap();
        assert_eq!(ad.adv.price, dec!(26150.00));
        assert!(ad.adv.min_single_trans_amount.is_none());
        assert!(!ad.is_merchant());

        let out = serde_json::to_value(&ad).unwrap();
        assert_eq!(out["adv"]["tradableQuantity"], "500.00");
        assert_eq!(out["adv"]["price"], "26150.00");
        assert_eq!(out["advertiser"]["userGrade"], 2);
        assert_eq!(out["adv"]["tradeMethods"][0]["payType"], "Momo");
        assert!(out.as_object().unwrap().contains_key("privilegeDesc"));
    }

    #[test]
    fn test_accepts_amount_bounds_inclusive() {
        let ad = sample_ad("m", "u", "26000", "500000", "2000000");
        assert!(ad.accepts_amount(dec!(500000)));
        assert!(ad.accepts_amount(dec!(2000000)));
        assert!(!ad.accepts_amount(dec!(499999)));
        assert!(!ad.accepts_amount(dec!(2000001)));
    }

    #[test]
    fn test_overlaps_range() {
        let ad = sample_ad("m", "u", "26000", "500000", "2000000");
        assert!(ad.overlaps_range(dec!(100000), dec!(600000)));
        assert!(ad.overlaps_range(dec!(1900000), dec!(9000000)));
        assert!(!ad.overlaps_range(dec!(100), dec!(1000)));
        assert!(!ad.overlaps_range(dec!(3000000), dec!(4000000)));
    }

    #[test]
    fn test_top1_from_unsorted() {
        let ads = vec![
            sample_ad("b", "u2", "26100", "1", "2"),
            sample_ad("a", "u1", "26050", "1", "2"),
            sample_ad("c", "u3", "26200", "1", "2"),
        ];
        let top = Top1Merchant::from_buy_ads(&ads).unwrap();
        assert_eq!(top.name, "a");
        assert_eq!(top.price, dec!(26050));
        assert!(Top1Merchant::from_buy_ads(&[]).is_none());
    }

    #[test]
    fn test_top1_skips_non_merchants() {
        let mut user = sample_ad("user", "u9", "25000", "1", "2");
        user.advertiser.user_type = Some("user".to_string());
        let ads = vec![user, sample_ad("shop", "u1", "26000", "1", "2")];
        assert_eq!(Top1Merchant::from_buy_ads(&ads).unwrap().name, "shop");
    }

    #[test]
    fn test_trade_type_wire_format() {
        assert_eq!(serde_json::to_value(TradeType::Buy).unwrap(), "BUY");
        let t: TradeType = serde_json::from_str("\"SELL\"").unwrap();
        assert_eq!(t, TradeType::Sell);
    }

    #[test]
    fn test_lenient_decimal_accepts_numbers_and_strings() {
        #[derive(Deserialize)]
        struct Quote {
            #[serde(deserialize_with = "lenient_decimal")]
            price: Decimal,
        }

        let from_number: Quote = serde_json::from_str(r#"{"price": 26010.5}"#).unwrap();
        assert_eq!(from_number.price, dec!(26010.5));
        let from_text: Quote = serde_json::from_str(r#"{"price": " 25900 "}"#).unwrap();
        assert_eq!(from_text.price, dec!(25900));
        assert!(serde_json::from_str::<Quote>(r#"{"price": "abc"}"#).is_err());

        let exp: serde_json::Number = serde_json::from_str("2.6e4").unwrap();
        assert_eq!(decimal_from_number(&exp), Some(dec!(26000)));
    }
}
