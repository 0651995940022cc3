//! Poller health, served at `/api/health`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

/// Shared health state updated by the poller.
#[derive(Clone)]
pub struct HealthState {
    inner: Arc<RwLock<HealthData>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthData {
    pub status: &'static str,
    pub poll_count: u64,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub uptime_seconds: i64,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HealthData {
                status: "starting",
                poll_count: 0,
                last_poll_at: None,
                last_error: None,
                started_at: Utc::now(),
                uptime_seconds: 0,
            })),
        }
    }

    /// Record a finished poll. `error` names the first input that failed.
    pub async fn record_poll(&self, error: Option<String>) {
        let mut data = self.inner.write().await;
        data.poll_count += 1;
        data.last_poll_at = Some(Utc::now());
        data.status = if error.is_some() { "degraded" } else { "ok" };
        data.last_error = error;
    }

    pub async fn snapshot(&self) -> HealthData {
        let mut data = self.inner.read().await.clone();
        data.uptime_seconds = (Utc::now() - data.started_at).num_seconds();
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_starts() {
        let state = HealthState::new();
        let data = state.snapshot().await;
        assert_eq!(data.status, "starting");
        assert_eq!(data.poll_count, 0);
    }

    #[tokio::test]
    async fn test_health_poll_updates() {
        let state = HealthState::new();
        state.record_poll(None).await;
        state.record_poll(Some("P2P SELL ads".to_string())).await;

        let data = state.snapshot().await;
        assert_eq!(data.poll_count, 2);
        assert_eq!(data.status, "degraded");
        assert_eq!(data.last_error.as_deref(), Some("P2P SELL ads"));

        state.record_poll(None).await;
        let data = state.snapshot().await;
        assert_eq!(data.status, "ok");
        assert!(data.last_error.is_none());
    }

    #[test]
    fn test_health_serializes_camel_case() {
        let data = HealthData {
            status: "ok",
            poll_count: 3,
            last_poll_at: None,
            last_error: None,
            started_at: Utc::now(),
            uptime_seconds: 5,
        };
        let json = serde_json::to_value(&data).unwrap();
        assert_eq!(json["pollCount"], 3);
        assert_eq!(json["uptimeSeconds"], 5);
    }
}
