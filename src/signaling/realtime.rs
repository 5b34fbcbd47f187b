//! WebSocket Client für einen Realtime-Broadcast-Relay
//!
//! Spricht das Phoenix-Channel-Protokoll:
//! - `phx_join` pro Topic (`realtime:{topic}`), Broadcast an sich selbst aktiviert
//! - `broadcast` Events mit `{ event, payload }`
//! - Heartbeat auf dem `phoenix` Topic, damit der Relay die Verbindung hält
//!
//! Senden ist non-blocking (`try_send`), Nachrichten werden nicht wiederholt.

use super::channel::{PubSub, SignalingError};
use super::messages::Broadcast;
use crate::config::CallConfig;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

const TOPIC_PREFIX: &str = "realtime:";
const HEARTBEAT_TOPIC: &str = "phoenix";
const TOPIC_CAPACITY: usize = 256;
const OUTBOX_CAPACITY: usize = 256;

type TopicMap = Arc<RwLock<HashMap<String, broadcast::Sender<Broadcast>>>>;

// ============================================================================
// WIRE FRAMES
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PhoenixFrame {
    topic: String,
    event: String,
    payload: serde_json::Value,
    #[serde(rename = "ref", default)]
    msg_ref: Option<String>,
}

impl PhoenixFrame {
    fn join(topic: &str, msg_ref: String) -> Self {
        Self {
            topic: format!("{}{}", TOPIC_PREFIX, topic),
            event: "phx_join".to_string(),
            payload: json!({
                "config": {
                    "broadcast": { "self": true, "ack": false },
                    "presence": { "key": "" }
                }
            }),
            msg_ref: Some(msg_ref),
        }
    }

    fn broadcast(topic: &str, message: Broadcast, msg_ref: String) -> Self {
        Self {
            topic: format!("{}{}", TOPIC_PREFIX, topic),
            event: "broadcast".to_string(),
            payload: json!({
                "type": "broadcast",
                "event": message.event,
                "payload": message.payload,
            }),
            msg_ref: Some(msg_ref),
        }
    }

    fn heartbeat(msg_ref: String) -> Self {
        Self {
            topic: HEARTBEAT_TOPIC.to_string(),
            event: "heartbeat".to_string(),
            payload: json!({}),
            msg_ref: Some(msg_ref),
        }
    }

    fn encode(&self) -> Result<String, SignalingError> {
        serde_json::to_string(self).map_err(|e| SignalingError::Serialization(e.to_string()))
    }
}

/// Baut die WebSocket-URL aus der Konfiguration
fn websocket_url(config: &CallConfig) -> Result<Url, SignalingError> {
    let mut url = Url::parse(&config.signaling_url)
        .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(SignalingError::ConnectionFailed(format!(
                "Unsupported URL scheme: {}",
                other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| SignalingError::ConnectionFailed("Invalid URL scheme".to_string()))?;

    if !url.path().ends_with("/websocket") {
        let path = format!("{}/realtime/v1/websocket", url.path().trim_end_matches('/'));
        url.set_path(&path);
    }

    {
        let mut query = url.query_pairs_mut();
        if let Some(api_key) = &config.api_key {
            query.append_pair("apikey", api_key);
        }
        query.append_pair("vsn", "1.0.0");
    }

    Ok(url)
}

// ============================================================================
// CLIENT STATE
// ============================================================================

#[derive(Debug, Clone, Default)]
struct ClientState {
    is_connected: bool,
}

// ============================================================================
// REALTIME CLIENT
// ============================================================================

/// PubSub über eine WebSocket-Verbindung zum Relay
pub struct RealtimeClient {
    endpoint: String,
    state: Arc<RwLock<ClientState>>,
    tx: mpsc::Sender<String>,
    topics: TopicMap,
    next_ref: Arc<AtomicU64>,
}

impl RealtimeClient {
    /// Verbindet mit dem Relay und startet Read-, Write- und Heartbeat-Task
    pub async fn connect(config: &CallConfig) -> Result<Self, SignalingError> {
        let url = websocket_url(config)?;
        let endpoint = format!(
            "{}://{}{}",
            url.scheme(),
            url.host_str().unwrap_or_default(),
            url.path()
        );

        tracing::info!("Connecting to realtime relay: {}", endpoint);

        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();
        let (tx, mut rx) = mpsc::channel::<String>(OUTBOX_CAPACITY);

        let state = Arc::new(RwLock::new(ClientState { is_connected: true }));
        let topics: TopicMap = Arc::new(RwLock::new(HashMap::new()));
        let next_ref = Arc::new(AtomicU64::new(1));

        // Read-Task starten
        let state_clone = Arc::clone(&state);
        let topics_clone = Arc::clone(&topics);
        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => dispatch_incoming(&topics_clone, &text),
                    Ok(Message::Close(_)) => {
                        tracing::info!("Realtime relay closed the connection");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            state_clone.write().is_connected = false;
            // Abonnenten sehen ein geschlossenes Topic
            topics_clone.write().clear();
        });

        // Write-Task starten
        let state_clone = Arc::clone(&state);
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(Message::Text(msg)).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
            state_clone.write().is_connected = false;
            let _ = write.close().await;
        });

        // Heartbeat-Task starten (endet, sobald der Client gedroppt wurde)
        let weak_tx = tx.downgrade();
        let state_clone = Arc::clone(&state);
        let ref_counter = Arc::clone(&next_ref);
        let period = tokio::time::Duration::from_secs(config.heartbeat_interval_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;

                let Some(tx) = weak_tx.upgrade() else {
                    tracing::debug!("Heartbeat: client dropped, stopping heartbeat task");
                    break;
                };
                if !state_clone.read().is_connected {
                    tracing::info!("Heartbeat: relay disconnected, stopping heartbeat task");
                    break;
                }

                let msg_ref = ref_counter.fetch_add(1, Ordering::Relaxed).to_string();
                match PhoenixFrame::heartbeat(msg_ref).encode() {
                    Ok(frame) => {
                        if let Err(e) = tx.try_send(frame) {
                            tracing::warn!("Failed to send heartbeat: {}", e);
                        }
                    }
                    Err(e) => tracing::warn!("Failed to encode heartbeat: {}", e),
                }
            }
        });

        Ok(Self {
            endpoint,
            state,
            tx,
            topics,
            next_ref,
        })
    }

    /// Prüft ob verbunden
    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }

    fn next_ref(&self) -> String {
        self.next_ref.fetch_add(1, Ordering::Relaxed).to_string()
    }

    /// Sendet einen Frame non-blocking
    fn send_frame(&self, frame: PhoenixFrame) -> Result<(), SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::NotConnected);
        }

        let text = frame.encode()?;
        self.tx
            .try_send(text)
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }
}

impl PubSub for RealtimeClient {
    fn publish(&self, topic: &str, message: Broadcast) -> Result<(), SignalingError> {
        let msg_ref = self.next_ref();
        self.send_frame(PhoenixFrame::broadcast(topic, message, msg_ref))
    }

    fn subscribe(&self, topic: &str) -> Result<broadcast::Receiver<Broadcast>, SignalingError> {
        if let Some(tx) = self.topics.read().get(topic) {
            return Ok(tx.subscribe());
        }

        let rx = {
            let mut topics = self.topics.write();
            let tx = topics
                .entry(topic.to_string())
                .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0);
            tx.subscribe()
        };

        let msg_ref = self.next_ref();
        if let Err(e) = self.send_frame(PhoenixFrame::join(topic, msg_ref)) {
            self.topics.write().remove(topic);
            return Err(SignalingError::JoinFailed {
                topic: topic.to_string(),
                reason: e.to_string(),
            });
        }

        tracing::info!("Joining realtime topic {}", topic);
        Ok(rx)
    }
}

impl std::fmt::Debug for RealtimeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeClient")
            .field("endpoint", &self.endpoint)
            .field("state", &*self.state.read())
            .finish()
    }
}

/// Verarbeitet einen eingehenden Frame vom Relay
fn dispatch_incoming(topics: &TopicMap, text: &str) {
    let frame: PhoenixFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::debug!("Ignoring malformed relay frame: {}", e);
            return;
        }
    };

    let topic = frame
        .topic
        .strip_prefix(TOPIC_PREFIX)
        .unwrap_or(&frame.topic)
        .to_string();

    match frame.event.as_str() {
        "broadcast" => {
            let event = frame.payload.get("event").and_then(|e| e.as_str());
            let payload = frame.payload.get("payload").cloned();

            if let (Some(event), Some(payload)) = (event, payload) {
                if let Some(tx) = topics.read().get(&topic) {
                    let _ = tx.send(Broadcast {
                        event: event.to_string(),
                        payload,
                    });
                }
            }
        }

        "phx_reply" => {
            let status = frame
                .payload
                .get("status")
                .and_then(|s| s.as_str())
                .unwrap_or("unknown");
            if status != "ok" {
                tracing::warn!("Relay replied {} on {}: {}", status, frame.topic, frame.payload);
            }
        }

        "phx_error" => {
            tracing::error!("Relay reported an error on {}", frame.topic);
        }

        "phx_close" => {
            tracing::info!("Relay closed topic {}", frame.topic);
            topics.write().remove(&topic);
        }

        _ => {
            // Presence/System-Events sind hier nicht relevant
            tracing::trace!("Ignoring relay event {} on {}", frame.event, frame.topic);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_websocket_url_from_https() {
        let config = CallConfig {
            signaling_url: "https://relay.example.org".to_string(),
            api_key: Some("key123".to_string()),
            ..Default::default()
        };

        let url = websocket_url(&config).unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.path(), "/realtime/v1/websocket");
        assert_eq!(url.query(), Some("apikey=key123&vsn=1.0.0"));
    }

    #[test]
    fn test_websocket_url_keeps_explicit_path() {
        let config = CallConfig {
            signaling_url: "ws://localhost:4000/socket/websocket".to_string(),
            ..Default::default()
        };

        let url = websocket_url(&config).unwrap();
        assert_eq!(url.scheme(), "ws");
        assert_eq!(url.path(), "/socket/websocket");
        assert_eq!(url.query(), Some("vsn=1.0.0"));
    }

    #[test]
    fn test_websocket_url_rejects_unknown_scheme() {
        let config = CallConfig {
            signaling_url: "ftp://relay.example.org".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            websocket_url(&config),
            Err(SignalingError::ConnectionFailed(_))
        ));
    }

    #[test]
    fn test_broadcast_frame_shape() {
        let frame = PhoenixFrame::broadcast(
            "debate-room-1",
            Broadcast {
                event: "camera-on".to_string(),
                payload: json!({"userId": "alice"}),
            },
            "7".to_string(),
        );

        let value: serde_json::Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(value["topic"], "realtime:debate-room-1");
        assert_eq!(value["event"], "broadcast");
        assert_eq!(value["payload"]["event"], "camera-on");
        assert_eq!(value["payload"]["payload"]["userId"], "alice");
        assert_eq!(value["ref"], "7");
    }

    #[test]
    fn test_join_frame_enables_self_broadcast() {
        let frame = PhoenixFrame::join("debate-room-1", "1".to_string());
        assert_eq!(frame.event, "phx_join");
        assert_eq!(frame.payload["config"]["broadcast"]["self"], true);
    }

    #[test]
    fn test_dispatch_incoming_broadcast() {
        let topics: TopicMap = Arc::new(RwLock::new(HashMap::new()));
        let (tx, mut rx) = broadcast::channel(4);
        topics.write().insert("debate-room-1".to_string(), tx);

        let text = json!({
            "topic": "realtime:debate-room-1",
            "event": "broadcast",
            "payload": {"type": "broadcast", "event": "camera-off", "payload": {"userId": "bob"}},
            "ref": null
        })
        .to_string();
        dispatch_incoming(&topics, &text);

        let received = rx.try_recv().unwrap();
        assert_eq!(received.event, "camera-off");
        assert_eq!(received.payload["userId"], "bob");
    }

    #[test]
    fn test_dispatch_phx_close_drops_topic() {
        let topics: TopicMap = Arc::new(RwLock::new(HashMap::new()));
        let (tx, _rx) = broadcast::channel(4);
        topics.write().insert("debate-room-1".to_string(), tx);

        let text = json!({
            "topic": "realtime:debate-room-1",
            "event": "phx_close",
            "payload": {},
            "ref": "3"
        })
        .to_string();
        dispatch_incoming(&topics, &text);

        assert!(topics.read().is_empty());
    }
}
