//! Signaling Channel - typisierte Raum-Events über generisches Pub/Sub
//!
//! Jeder Raum ist ein Topic (`debate-room-{roomId}`). Alles, was auf dem
//! Topic veröffentlicht wird, geht an alle Abonnenten, auch an den Absender.

use super::messages::{Broadcast, SignalingMessage};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to signaling relay")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Invalid signaling message: {0}")]
    Serialization(String),

    #[error("Failed to join topic {topic}: {reason}")]
    JoinFailed { topic: String, reason: String },
}

// ============================================================================
// PUB/SUB
// ============================================================================

/// Generischer Broadcast-Transport (Best-Effort, ohne Zustellgarantie)
pub trait PubSub: Send + Sync {
    /// Veröffentlicht eine Nachricht, ohne zu blockieren
    fn publish(&self, topic: &str, message: Broadcast) -> Result<(), SignalingError>;

    /// Abonniert ein Topic
    fn subscribe(&self, topic: &str) -> Result<broadcast::Receiver<Broadcast>, SignalingError>;
}

/// Aktives Abonnement; beim Drop wird der Empfangs-Task beendet
pub struct Subscription {
    topic: String,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Beendet das Abonnement explizit
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
        tracing::debug!("Unsubscribed from {}", self.topic);
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .finish()
    }
}

// ============================================================================
// SIGNALING CHANNEL
// ============================================================================

/// Typisierte Hülle um einen PubSub-Transport
#[derive(Clone)]
pub struct SignalingChannel {
    pubsub: Arc<dyn PubSub>,
    topic_prefix: String,
}

impl SignalingChannel {
    pub fn new(pubsub: Arc<dyn PubSub>, topic_prefix: impl Into<String>) -> Self {
        Self {
            pubsub,
            topic_prefix: topic_prefix.into(),
        }
    }

    /// Topic-Name eines Raums
    pub fn topic(&self, room_id: &str) -> String {
        format!("{}{}", self.topic_prefix, room_id)
    }

    /// Veröffentlicht ein Signaling-Event im Raum
    pub fn publish(&self, room_id: &str, message: &SignalingMessage) -> Result<(), SignalingError> {
        let payload = serde_json::to_value(message)
            .map_err(|e| SignalingError::Serialization(e.to_string()))?;

        let topic = self.topic(room_id);
        tracing::debug!("Publishing {} to {}", message.event_name(), topic);

        self.pubsub.publish(
            &topic,
            Broadcast {
                event: message.event_name().to_string(),
                payload,
            },
        )
    }

    /// Abonniert einen Raum; `handler` bekommt jede gültige Nachricht
    pub fn subscribe<F>(&self, room_id: &str, handler: F) -> Result<Subscription, SignalingError>
    where
        F: Fn(SignalingMessage) + Send + Sync + 'static,
    {
        let topic = self.topic(room_id);
        let mut rx = self.pubsub.subscribe(&topic)?;

        tracing::info!("Subscribed to {}", topic);

        let task_topic = topic.clone();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(broadcast) => match decode(broadcast) {
                        Ok(message) => handler(message),
                        Err(e) => tracing::debug!("Ignoring message on {}: {}", task_topic, e),
                    },
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Subscriber on {} lagged, {} message(s) lost", task_topic, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::info!("Topic {} closed", task_topic);
                        break;
                    }
                }
            }
        });

        Ok(Subscription { topic, task })
    }
}

impl std::fmt::Debug for SignalingChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingChannel")
            .field("topic_prefix", &self.topic_prefix)
            .finish()
    }
}

/// Wandelt eine Broadcast-Nachricht in ein Signaling-Event
///
/// Fehlt `type` im Payload, gilt der Event-Name.
pub fn decode(broadcast: Broadcast) -> Result<SignalingMessage, SignalingError> {
    let Broadcast { event, mut payload } = broadcast;

    if let Some(obj) = payload.as_object_mut() {
        obj.entry("type")
            .or_insert_with(|| serde_json::Value::String(event));
    }

    serde_json::from_value(payload).map_err(|e| SignalingError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::memory::InMemoryPubSub;
    use crate::signaling::messages::SignalingPayload;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[test]
    fn test_topic_name() {
        let channel = SignalingChannel::new(Arc::new(InMemoryPubSub::new()), "debate-room-");
        assert_eq!(channel.topic("42"), "debate-room-42");
    }

    #[test]
    fn test_decode_takes_type_from_event() {
        let message = decode(Broadcast {
            event: "camera-off".to_string(),
            payload: json!({"userId": "alice", "timestamp": 5}),
        })
        .unwrap();

        assert_eq!(message.payload, SignalingPayload::CameraOff);
        assert_eq!(message.sender_id, "alice");
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let result = decode(Broadcast {
            event: "webrtc-offer".to_string(),
            payload: json!({"userId": "alice"}),
        });
        assert!(matches!(result, Err(SignalingError::Serialization(_))));
    }

    #[tokio::test]
    async fn test_publisher_receives_own_message() {
        let channel = SignalingChannel::new(Arc::new(InMemoryPubSub::new()), "debate-room-");
        let (tx, mut rx) = mpsc::unbounded_channel();

        let _sub = channel
            .subscribe("r1", move |msg| {
                let _ = tx.send(msg);
            })
            .unwrap();

        let sent = SignalingMessage::new("alice", SignalingPayload::CameraOn { is_observer: false });
        channel.publish("r1", &sent).unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, sent);
    }

    #[tokio::test]
    async fn test_rooms_are_isolated() {
        let channel = SignalingChannel::new(Arc::new(InMemoryPubSub::new()), "debate-room-");
        let (tx, mut rx) = mpsc::unbounded_channel();

        let _sub = channel
            .subscribe("r1", move |msg| {
                let _ = tx.send(msg);
            })
            .unwrap();

        channel
            .publish("r2", &SignalingMessage::new("bob", SignalingPayload::CameraOff))
            .unwrap();
        channel
            .publish("r1", &SignalingMessage::new("carol", SignalingPayload::CameraOff))
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.sender_id, "carol");
    }
}
