//! Signaling Module - Raum-Events über einen Broadcast-Kanal
//!
//! Dieses Modul verwaltet die Vermittlung der Verbindungsaushandlung:
//! - Typisierte Signaling-Nachrichten (camera-on/off, Offer, Answer, ICE)
//! - Adapter über einen generischen Pub/Sub-Transport (Topic = Raum)
//! - In-Memory Bus und WebSocket Client für einen Realtime-Relay
//!

mod channel;
mod memory;
mod messages;
mod realtime;

pub use channel::{decode, PubSub, SignalingChannel, SignalingError, Subscription};
pub use memory::InMemoryPubSub;
pub use messages::*;
pub use realtime::RealtimeClient;
