//! Websocket push channel.
//!
//! Frames are JSON text shaped `{"event": <name>, "data": <payload>}`.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::dashboard::AppState;
use crate::strategy::anomaly::Anomaly;
use crate::strategy::decision::MarketDecision;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnomaliesPayload {
    pub anomalies: Vec<Anomaly>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<RuntimeConfig>,
}

/// Server to client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    Anomalies(AnomaliesPayload),
    MarketDecision(MarketDecision),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnomalyRequest {
    #[serde(default)]
    pub is_filter_enabled: bool,
    #[serde(default)]
    pub deviation_threshold: Option<f64>,
}

/// Client to server.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    RequestAnomalies(AnomalyRequest),
    NewAnomaly(Anomaly),
}

pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let mut rx = state.events.subscribe();
    info!("Dashboard client connected");

    for event in &greeting(&state).await {
        if send_event(&mut socket, event).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(event) => {
                    if send_event(&mut socket, &event).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Socket client lagging, events dropped");
                }
                Err(RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if handle_client_text(&mut socket, &state, text.as_str()).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    info!("Dashboard client disconnected");
}

/// Sent to each client right after it connects.
pub(crate) async fn greeting(state: &AppState) -> [ServerEvent; 2] {
    [
        ServerEvent::Anomalies(state.dashboard_payload().await),
        ServerEvent::MarketDecision(state.latest_decision.read().await.clone()),
    ]
}

/// Apply one client event and return the reply owed to that client, if any.
pub(crate) async fn apply_client_event(state: &AppState, event: ClientEvent) -> Option<ServerEvent> {
    match event {
        ClientEvent::RequestAnomalies(req) => {
            let threshold = if req.is_filter_enabled {
                Some(match req.deviation_threshold {
                    Some(t) => t,
                    None => state.runtime.read().await.deviation_threshold,
                })
            } else {
                None
            };
            Some(ServerEvent::Anomalies(state.anomalies_payload(threshold).await))
        }
        ClientEvent::NewAnomaly(anomaly) => {
            state.anomalies.write().await.push(anomaly);
            state.publish(ServerEvent::Anomalies(state.dashboard_payload().await));
            None
        }
    }
}

async fn handle_client_text(socket: &mut WebSocket, state: &AppState, text: &str) -> Result<(), axum::Error> {
    let event = match serde_json::from_str::<ClientEvent>(text) {
        Ok(event) => event,
        Err(e) => {
            debug!(error = %e, "Ignoring unrecognised socket message");
            return Ok(());
        }
    };

    match apply_client_event(state, event).await {
        Some(reply) => send_event(socket, &reply).await,
        None => Ok(()),
    }
}

async fn send_event(socket: &mut WebSocket, event: &ServerEvent) -> Result<(), axum::Error> {
    let text = match serde_json::to_string(event) {
        Ok(t) => t,
        Err(e) => {
            warn!(error = %e, "Failed to serialize socket event");
            return Ok(());
        }
    };
    socket.send(Message::Text(text.into())).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dashboard::test_state;
    use crate::strategy::anomaly::{sample_anomaly, FEED_CAPACITY};
    use crate::strategy::decision::{Decision, Locale};

    fn request(filter: bool, threshold: Option<f64>) -> ClientEvent {
        ClientEvent::RequestAnomalies(AnomalyRequest {
            is_filter_enabled: filter,
            deviation_threshold: threshold,
        })
    }

    fn merchants(event: Option<ServerEvent>) -> Vec<String> {
        match event {
            Some(ServerEvent::Anomalies(p)) => p.anomalies.into_iter().map(|a| a.merchant).collect(),
            other => panic!("expected anomalies, got {other:?}"),
        }
    }

    #[test]
    fn test_server_event_envelope() {
        let event = ServerEvent::MarketDecision(MarketDecision::analyzing(Locale::En));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "market_decision");
        assert_eq!(json["data"]["decision"], "ANALYZING");

        let event = ServerEvent::Anomalies(AnomaliesPayload {
            anomalies: vec![],
            timestamp: Utc::now(),
            config: None,
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "anomalies");
        assert!(json["data"].get("config").is_none());
    }

    #[test]
    fn test_client_events_parse() {
        let req: ClientEvent = serde_json::from_str(
            r#"{"event":"request_anomalies","data":{"isFilterEnabled":true,"deviationThreshold":1.2}}"#,
        )
        .unwrap();
        match req {
            ClientEvent::RequestAnomalies(r) => {
                assert!(r.is_filter_enabled);
                assert_eq!(r.deviation_threshold, Some(1.2));
            }
            other => panic!("unexpected {other:?}"),
        }

        let bad = serde_json::from_str::<ClientEvent>(r#"{"event":"nope","data":{}}"#);
        assert!(bad.is_err());
    }

    #[tokio::test]
    async fn test_request_anomalies_uses_client_threshold() {
        let state = test_state("socket-request");
        state.anomalies.write().await.extend([
            sample_anomaly("low", 0.3),
            sample_anomaly("mid", -1.0),
            sample_anomaly("high", 2.5),
        ]);

        let reply = apply_client_event(&state, request(true, Some(1.0))).await;
        assert_eq!(merchants(reply), vec!["mid", "high"]);

        // No client threshold falls back to the runtime one (0.5)
        let reply = apply_client_event(&state, request(true, None)).await;
        assert_eq!(merchants(reply), vec!["mid", "high"]);

        let reply = apply_client_event(&state, request(false, Some(2.0))).await;
        assert_eq!(merchants(reply), vec!["low", "mid", "high"]);
    }

    #[tokio::test]
    async fn test_new_anomaly_appends_and_broadcasts() {
        let state = test_state("socket-new");
        let mut rx = state.events.subscribe();

        let reply = apply_client_event(&state, ClientEvent::NewAnomaly(sample_anomaly("m0", 1.0))).await;
        assert!(reply.is_none());

        match rx.try_recv() {
            Ok(ServerEvent::Anomalies(payload)) => {
                assert_eq!(payload.anomalies.len(), 1);
                assert!(payload.config.is_some());
            }
            other => panic!("expected an anomalies broadcast, got {other:?}"),
        }

        for i in 1..(FEED_CAPACITY + 5) {
            apply_client_event(&state, ClientEvent::NewAnomaly(sample_anomaly(&format!("m{i}"), 1.0))).await;
        }
        let feed = state.anomalies.read().await.snapshot(None);
        assert_eq!(feed.len(), FEED_CAPACITY);
        assert_eq!(feed[0].merchant, "m5");
    }

    #[tokio::test]
    async fn test_greeting_sends_filtered_feed_and_decision() {
        let state = test_state("socket-greeting");
        state
            .anomalies
            .write()
            .await
            .extend([sample_anomaly("quiet", 0.1), sample_anomaly("loud", 3.0)]);

        let [anomalies, decision] = greeting(&state).await;
        assert_eq!(merchants(Some(anomalies)), vec!["loud"]);
        match decision {
            ServerEvent::MarketDecision(d) => assert_eq!(d.decision, Decision::Analyzing),
            other => panic!("expected a decision, got {other:?}"),
        }
    }
}
