//! Call Engine Module - Peer Connection und WebRTC
//!
//! Dieses Modul verwaltet:
//! - die Transport-Schnittstelle (simple-peer Stil)
//! - den Peer Connection Supervisor (Verhandlung, Lifecycle)
//! - den webrtc-rs Transport

mod rtc;
mod supervisor;
mod transport;

pub use rtc::{RtcTransport, RtcTransportFactory};
pub use supervisor::{
    CallEngineError, CallEvent, CallEventListener, ConnectionState, PeerConnectionSupervisor,
};
pub use transport::{
    Transport, TransportError, TransportEvent, TransportEventSink, TransportFactory,
    TransportOptions,
};
