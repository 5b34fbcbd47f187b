//! Prozess-lokaler Broadcast-Bus
//!
//! Für Tests und für Sessions, die im selben Prozess laufen. Jede
//! Nachricht geht an alle aktuellen Abonnenten des Topics, auch an den
//! Absender. Wer noch nicht abonniert hat, verpasst sie.

use super::channel::{PubSub, SignalingError};
use super::messages::Broadcast;
use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::broadcast;

/// Kapazität pro Topic
const TOPIC_CAPACITY: usize = 256;

#[derive(Default)]
pub struct InMemoryPubSub {
    topics: RwLock<HashMap<String, broadcast::Sender<Broadcast>>>,
}

impl InMemoryPubSub {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Broadcast> {
        if let Some(tx) = self.topics.read().get(topic) {
            return tx.clone();
        }

        self.topics
            .write()
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }

    /// Anzahl aktiver Abonnenten eines Topics
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .get(topic)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

impl PubSub for InMemoryPubSub {
    fn publish(&self, topic: &str, message: Broadcast) -> Result<(), SignalingError> {
        // Ohne Abonnenten geht die Nachricht verloren (kein Retry)
        if self.sender(topic).send(message).is_err() {
            tracing::trace!("No subscribers on {}, message dropped", topic);
        }
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> Result<broadcast::Receiver<Broadcast>, SignalingError> {
        Ok(self.sender(topic).subscribe())
    }
}

impl std::fmt::Debug for InMemoryPubSub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryPubSub")
            .field("topics", &self.topics.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(event: &str) -> Broadcast {
        Broadcast {
            event: event.to_string(),
            payload: json!({}),
        }
    }

    #[test]
    fn test_all_subscribers_receive() {
        let bus = InMemoryPubSub::new();
        let mut a = bus.subscribe("t").unwrap();
        let mut b = bus.subscribe("t").unwrap();

        bus.publish("t", message("camera-on")).unwrap();

        assert_eq!(a.try_recv().unwrap().event, "camera-on");
        assert_eq!(b.try_recv().unwrap().event, "camera-on");
        assert_eq!(bus.subscriber_count("t"), 2);
    }

    #[test]
    fn test_publish_without_subscribers_is_dropped() {
        let bus = InMemoryPubSub::new();
        bus.publish("t", message("camera-on")).unwrap();

        let mut late = bus.subscribe("t").unwrap();
        assert!(late.try_recv().is_err());
    }

    #[test]
    fn test_publisher_order_is_kept() {
        let bus = InMemoryPubSub::new();
        let mut rx = bus.subscribe("t").unwrap();

        for event in ["webrtc-offer", "webrtc-ice", "webrtc-ice"] {
            bus.publish("t", message(event)).unwrap();
        }

        let events: Vec<String> = (0..3).map(|_| rx.try_recv().unwrap().event).collect();
        assert_eq!(events, vec!["webrtc-offer", "webrtc-ice", "webrtc-ice"]);
    }
}
