//! Media-Transport Schnittstelle
//!
//! Abstraktion über eine Peer Connection im Stil von simple-peer:
//! konstruiert mit `{ initiator, stream }`, liefert Events `signal`,
//! `connect`, `stream`, `close`, `error` und nimmt Remote-Daten über
//! `signal()` entgegen.

use crate::media::MediaHandle;
use crate::signaling::SignalData;
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("WebRTC error: {0}")]
    WebRTC(String),

    #[error("Invalid signal: {0}")]
    InvalidSignal(String),

    #[error("No async runtime available for the transport")]
    NoRuntime,

    #[error("Transport was destroyed")]
    Destroyed,
}

// ============================================================================
// EVENTS / OPTIONS
// ============================================================================

/// Events eines Transports
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Lokale Verhandlungsdaten (Offer, Answer oder ICE Candidate) sind bereit
    Signal(SignalData),
    /// Verbindung steht
    Connect,
    /// Remote-Stream ist angekommen
    Stream(MediaHandle),
    /// Verbindung wurde geschlossen
    Close,
    /// Verhandlung oder Verbindung ist fehlgeschlagen
    Error(TransportError),
}

/// Callback, über den ein Transport seine Events meldet
pub type TransportEventSink = Arc<dyn Fn(TransportEvent) + Send + Sync>;

/// Parameter für eine neue Transport-Instanz
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub initiator: bool,
    pub stream: MediaHandle,
}

impl TransportOptions {
    pub fn new(initiator: bool, stream: MediaHandle) -> Self {
        Self { initiator, stream }
    }
}

// ============================================================================
// TRAITS
// ============================================================================

/// Eine einzelne Peer-Connection-Instanz
///
/// Events werden immer asynchron gemeldet, nie aus `signal()` oder
/// `destroy()` heraus. Der Supervisor ruft beide unter seinem Lock auf.
pub trait Transport: Send + Sync {
    /// Übergibt Remote-Daten (Offer, Answer, Candidate)
    fn signal(&self, data: SignalData) -> Result<(), TransportError>;

    /// Schließt die Instanz; mehrfacher Aufruf ist erlaubt
    fn destroy(&self);
}

/// Erzeugt Transport-Instanzen
///
/// `create` darf `events` nicht synchron aufrufen.
pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        options: TransportOptions,
        events: TransportEventSink,
    ) -> Result<Arc<dyn Transport>, TransportError>;
}
