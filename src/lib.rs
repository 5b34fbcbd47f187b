//! Debate Call - P2P Audio/Video Call Coordinator
//!
//! Koordiniert eine direkte Media-Verbindung zwischen zwei Teilnehmern
//! eines Debattenraums:
//! - Realtime-Relay (Broadcast-Topic pro Raum) als Signaling-Kanal
//! - WebRTC für P2P Audio/Video
//! - Observer-Modus (Video ohne Audio)
//!
//! Einstiegspunkt für die UI ist [`CallSession`].

pub mod call_engine;
pub mod config;
pub mod media;
pub mod session;
pub mod signaling;

#[cfg(test)]
pub(crate) mod testing;

pub use call_engine::{
    CallEngineError, ConnectionState, PeerConnectionSupervisor, RtcTransportFactory, Transport,
    TransportError, TransportEvent, TransportFactory, TransportOptions,
};
pub use config::{CallConfig, IceServerConfig};
pub use media::{
    CaptureError, CaptureProvider, MediaCaptureManager, MediaHandle, MediaSample, MediaTrack,
    TrackKind,
};
pub use session::{CallError, CallSession, SessionEvent, SessionOptions};
pub use signaling::{
    InMemoryPubSub, PubSub, RealtimeClient, SignalingChannel, SignalingError, SignalingMessage,
    SignalingPayload,
};

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;

// ============================================================================
// LOGGING
// ============================================================================

static TRACING: OnceCell<()> = OnceCell::new();

/// Initialisiert Logging (`RUST_LOG` plus Standard-Direktiven)
///
/// Mehrfacher Aufruf ist erlaubt. Hat der Host bereits einen Subscriber
/// installiert, bleibt dieser aktiv.
pub fn init_tracing() {
    TRACING.get_or_init(|| {
        let mut filter = EnvFilter::from_default_env();
        for directive in ["debate_call=debug", "webrtc=warn"] {
            match directive.parse() {
                Ok(d) => filter = filter.add_directive(d),
                Err(e) => eprintln!("Invalid log directive {}: {}", directive, e),
            }
        }

        if tracing_subscriber::fmt().with_env_filter(filter).try_init().is_ok() {
            tracing::info!("Initializing Debate Call...");
        }
    });
}
