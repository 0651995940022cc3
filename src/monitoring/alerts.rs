//! Discord price alerts.
//!
//! `PriceAlertMonitor` tracks the cheapest merchant between polls and picks
//! out buy ads priced below `previous top-1 - spread`. `AlertClient` posts
//! them to a Discord webhook.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::{FixedOffset, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{write_json_file, AlertsConfig};
use crate::market::models::{Advertisement, Top1Merchant};

const ALERT_USERNAME: &str = "Giám Sát Giá P2P";
const TEST_USERNAME: &str = "P2P Test Bot";
const PROFILE_URL: &str = "https://p2p.binance.com/en/advertiserDetail?advertiserNo=";
const NOTIFIED_MAX: usize = 100;
const NOTIFIED_KEEP: usize = 20;

/// Discord webhook client.
pub struct AlertClient {
    webhook_url: Option<SecretString>,
    http: reqwest::Client,
    enabled: bool,
}

#[derive(Debug, Serialize)]
struct DiscordMessage {
    content: String,
    username: String,
}

#[derive(Debug, Serialize)]
struct DiscordEmbedMessage {
    username: String,
    embeds: Vec<Embed>,
}

#[derive(Debug, Serialize)]
struct Embed {
    title: String,
    description: String,
    color: u32,
    timestamp: String,
    footer: EmbedFooter,
    fields: Vec<EmbedField>,
}

#[derive(Debug, Serialize)]
struct EmbedFooter {
    text: String,
}

#[derive(Debug, Serialize)]
struct EmbedField {
    name: String,
    value: String,
    inline: bool,
}

impl AlertClient {
    pub fn new(webhook_url: Option<SecretString>, enabled: bool) -> Self {
        Self {
            enabled: enabled && webhook_url.is_some(),
            webhook_url,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn has_webhook(&self) -> bool {
        self.webhook_url.is_some()
    }

    /// Send a plain message. Failures are logged, not returned.
    async fn send(&self, message: &str) {
        if !self.enabled {
            return;
        }

        let Some(ref url) = self.webhook_url else {
            return;
        };

        let payload = DiscordMessage {
            content: message.to_string(),
            username: ALERT_USERNAME.to_string(),
        };

        match self.http.post(url.expose_secret()).json(&payload).send().await {
            Ok(response) if !response.status().is_success() => {
                warn!(status = %response.status(), "Discord webhook returned non-success status");
            }
            Ok(_) => debug!("Discord alert delivered"),
            Err(e) => warn!(error = %e, "Failed to send Discord alert"),
        }
    }

    pub async fn price_alert(&self, batch: &AlertBatch) {
        self.send(&batch.render()).await;
    }

    /// Post a test embed. Unlike alerts, failures are returned to the caller.
    pub async fn send_test(&self) -> Result<()> {
        let Some(ref url) = self.webhook_url else {
            bail!("Discord webhook URL is not configured");
        };

        let now = Utc::now();
        let payload = DiscordEmbedMessage {
            username: TEST_USERNAME.to_string(),
            embeds: vec![Embed {
                title: "🧪 Test Discord Webhook".to_string(),
                description: "This is a test message from the P2P Dashboard".to_string(),
                color: 0x00ff00,
                timestamp: now.to_rfc3339(),
                footer: EmbedFooter {
                    text: "Test Message".to_string(),
                },
                fields: vec![EmbedField {
                    name: "📊 Test Status".to_string(),
                    value: format!(
                        "Discord webhook is working correctly!\nTime: {}",
                        vietnam_time(now, "%H:%M:%S")
                    ),
                    inline: false,
                }],
            }],
        };

        let response = self.http.post(url.expose_secret()).json(&payload).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Discord test failed: {} - {}", status.as_u16(), body);
        }

        info!("Discord test webhook sent");
        Ok(())
    }
}

/// A buy ad priced below the alert threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct HighlightedAd {
    pub merchant: String,
    pub user_no: String,
    pub price: Decimal,
    pub is_merchant: bool,
    pub min_limit: Option<Decimal>,
    pub max_limit: Option<Decimal>,
}

impl HighlightedAd {
    fn from_ad(ad: &Advertisement) -> Self {
        Self {
            merchant: ad.advertiser.nick_name.clone(),
            user_no: ad.advertiser.user_no.clone(),
            price: ad.adv.price,
            is_merchant: ad.is_merchant(),
            min_limit: ad.adv.min_single_trans_amount,
            max_limit: ad.adv.max_single_trans_amount,
        }
    }

    fn key(&self) -> String {
        format!("BUY-{}-{}", self.user_no, self.price.normalize())
    }
}

/// One alert's worth of highlighted ads.
#[derive(Debug, Clone)]
pub struct AlertBatch {
    pub reference: Top1Merchant,
    pub spread: Decimal,
    pub items: Vec<HighlightedAd>,
}

impl AlertBatch {
    pub fn threshold(&self) -> Decimal {
        self.reference.price - self.spread
    }

    fn render(&self) -> String {
        let mut msg = String::from("🚨 CẢNH BÁO GIÁ 🚨\n\n");
        msg.push_str(&format!(
            "Tham chiếu: {} - {}\n",
            self.reference.name,
            format_vnd(self.reference.price)
        ));
        msg.push_str(&format!(
            "Ngưỡng cảnh báo: {} (chênh lệch: {})\n\n",
            format_vnd(self.threshold()),
            format_vnd(self.spread)
        ));

        let (merchants, users): (Vec<&HighlightedAd>, Vec<&HighlightedAd>) =
            self.items.iter().partition(|i| i.is_merchant);

        for (heading, group) in [("🏪 MERCHANTS", merchants), ("👤 USERS", users)] {
            if group.is_empty() {
                continue;
            }
            msg.push_str(&format!("{heading} ({}):\n", group.len()));
            for (i, item) in group.iter().enumerate() {
                msg.push_str(&format!(
                    "{}. {} - {}\nLimit: {} - {}\n{PROFILE_URL}{}\n",
                    i + 1,
                    item.merchant,
                    format_vnd(item.price),
                    item.min_limit.map(format_vnd).unwrap_or_else(|| "-".to_string()),
                    item.max_limit.map(format_vnd).unwrap_or_else(|| "-".to_string()),
                    item.user_no
                ));
            }
            msg.push('\n');
        }

        msg.push_str(&format!("⏰ Thời gian: {}", vietnam_time(Utc::now(), "%H:%M:%S %d/%m/%Y")));
        msg
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedTop1 {
    previous: Option<Top1Merchant>,
    current: Option<Top1Merchant>,
}

/// Owned copy of the top-1 pair, saved after the monitor lock is released.
#[derive(Debug, Clone)]
pub struct AlertStateSnapshot {
    path: PathBuf,
    state: PersistedTop1,
}

impl AlertStateSnapshot {
    /// Best-effort write. Failure is logged.
    pub async fn save(self) {
        if let Err(e) = write_json_file(&self.path, &self.state).await {
            warn!(path = %self.path.display(), error = %e, "Could not save alert state");
        }
    }
}

/// Tracks top-1 merchants across polls and decides when to alert.
pub struct PriceAlertMonitor {
    spread: Decimal,
    throttle: Duration,
    state_path: PathBuf,
    previous: Option<Top1Merchant>,
    current: Option<Top1Merchant>,
    notified: Vec<String>,
    last_sent: Option<Instant>,
}

impl PriceAlertMonitor {
    pub fn new(config: &AlertsConfig) -> Self {
        let persisted = load_state(&config.state_path);
        Self {
            spread: Decimal::from_f64(config.spread_buy).unwrap_or(Decimal::ONE_HUNDRED),
            throttle: Duration::from_secs(config.throttle_seconds),
            state_path: config.state_path.clone(),
            previous: persisted.previous,
            current: persisted.current,
            notified: Vec::new(),
            last_sent: None,
        }
    }

    pub fn previous(&self) -> Option<&Top1Merchant> {
        self.previous.as_ref()
    }

    pub fn current(&self) -> Option<&Top1Merchant> {
        self.current.as_ref()
    }

    /// Shift current to previous and record this poll's top-1 merchant.
    /// A poll with no merchant ads leaves both untouched and returns `None`;
    /// otherwise the new state to save is returned.
    pub fn observe(&mut self, buy: &[Advertisement]) -> Option<AlertStateSnapshot> {
        let top = Top1Merchant::from_buy_ads(buy)?;
        if let Some(current) = self.current.take() {
            self.previous = Some(current);
        }
        debug!(merchant = %top.name, price = %top.price, "Top-1 merchant updated");
        self.current = Some(top);
        Some(self.snapshot())
    }

    pub fn snapshot(&self) -> AlertStateSnapshot {
        AlertStateSnapshot {
            path: self.state_path.clone(),
            state: PersistedTop1 {
                previous: self.previous.clone(),
                current: self.current.clone(),
            },
        }
    }

    /// Ads below `previous - spread` that have not been alerted yet.
    pub fn pending(&self, buy: &[Advertisement]) -> Vec<HighlightedAd> {
        let Some(ref previous) = self.previous else {
            return Vec::new();
        };
        let threshold = previous.price - self.spread;

        buy.iter()
            .filter(|ad| ad.adv.price < threshold)
            .map(HighlightedAd::from_ad)
            .filter(|item| !self.notified.contains(&item.key()))
            .collect()
    }

    /// Build the next alert if there is something new and the throttle
    /// window has passed. Marks the returned ads as notified.
    pub fn take_alert(&mut self, buy: &[Advertisement], now: Instant) -> Option<AlertBatch> {
        let reference = self.previous.clone()?;
        let items = self.pending(buy);
        if items.is_empty() {
            return None;
        }

        if let Some(last) = self.last_sent {
            let since = now.saturating_duration_since(last);
            if since <= self.throttle {
                info!(
                    pending = items.len(),
                    wait_secs = (self.throttle - since).as_secs(),
                    "Price alert throttled"
                );
                return None;
            }
        }

        self.last_sent = Some(now);
        self.notified.extend(items.iter().map(HighlightedAd::key));
        if self.notified.len() > NOTIFIED_MAX {
            let drop = self.notified.len() - NOTIFIED_KEEP;
            self.notified.drain(..drop);
        }

        info!(count = items.len(), reference = %reference.name, "Price alert ready");
        Some(AlertBatch {
            reference,
            spread: self.spread,
            items,
        })
    }
}

fn load_state(path: &Path) -> PersistedTop1 {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

/// `26150` -> `26.150 ₫`
pub fn format_vnd(value: Decimal) -> String {
    let rounded = value.round();
    let negative = rounded.is_sign_negative() && !rounded.is_zero();
    let digits = rounded.abs().trunc().to_string();

    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push('.');
        }
        grouped.push(ch);
    }

    if negative {
        format!("-{grouped} ₫")
    } else {
        format!("{grouped} ₫")
    }
}

fn vietnam_time(now: chrono::DateTime<Utc>, fmt: &str) -> String {
    match FixedOffset::east_opt(7 * 3600) {
        Some(offset) => now.with_timezone(&offset).format(fmt).to_string(),
        None => now.format(fmt).to_string(),
    }
}
