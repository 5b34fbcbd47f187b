//! Peer Connection Supervisor
//!
//! Hält höchstens eine lebende Transport-Instanz und treibt sie durch die
//! Verhandlung:
//!
//! ```text
//! Idle -> Connecting -> Connected
//! Connecting -> Failed          (Transport-Fehler)
//! * -> Closed                   (destroy / close)
//! ```
//!
//! Jede Instanz bekommt eine eigene Generation. Events einer abgelösten
//! Generation werden verworfen, bevor sie den State berühren.
//!
//! Ein Answer erreicht nur einen Initiator, dessen Offer schon veröffentlicht
//! ist. Ein bereits beantwortetes Offer wird kein zweites Mal beantwortet.

use super::transport::{
    Transport, TransportError, TransportEvent, TransportEventSink, TransportFactory,
    TransportOptions,
};
use crate::media::MediaHandle;
use crate::signaling::{
    IceCandidate, SdpType, SessionDescription, SignalData, SignalingChannel, SignalingError,
    SignalingMessage, SignalingPayload,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::{Arc, Weak};
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallEngineError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("No local stream, turn the camera on first")]
    NoLocalStream,
}

// ============================================================================
// CONNECTION STATE
// ============================================================================

/// Status der Peer-Verbindung
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Noch keine Verhandlung gestartet
    Idle,
    /// Verhandlung läuft
    Connecting,
    /// Media-Verbindung steht
    Connected,
    /// Verbindung beendet
    Closed,
    /// Transport hat einen Fehler gemeldet
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closed => "closed",
            Self::Failed => "failed",
        }
    }

    /// `true` solange eine Verhandlung läuft oder steht
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events die vom Supervisor ausgelöst werden
#[derive(Debug, Clone)]
pub enum CallEvent {
    StateChanged(ConnectionState),
    RemoteStream(MediaHandle),
    RemoteStreamEnded,
    Error(CallEngineError),
}

pub type CallEventListener = Arc<dyn Fn(CallEvent) + Send + Sync>;

// ============================================================================
// SUPERVISOR
// ============================================================================

struct LivePeer {
    generation: u64,
    is_initiator: bool,
    transport: Arc<dyn Transport>,
    /// Veröffentlichtes Offer samt Candidates (nur Initiator)
    sent_offer: Option<SessionDescription>,
    sent_candidates: Vec<IceCandidate>,
    /// Beantwortetes Remote-Offer (nur Answerer)
    answered_offer: Option<String>,
}

impl LivePeer {
    /// Merkt sich, was der Initiator veröffentlicht hat
    fn record_sent(&mut self, data: &SignalData) {
        if !self.is_initiator {
            return;
        }
        match data {
            SignalData::Description(desc) if desc.sdp_type == SdpType::Offer => {
                self.sent_offer = Some(desc.clone());
                self.sent_candidates.clear();
            }
            SignalData::Candidate(candidate) if self.sent_offer.is_some() => {
                self.sent_candidates.push(candidate.clone());
            }
            _ => {}
        }
    }
}

struct SupervisorInner {
    state: ConnectionState,
    live: Option<LivePeer>,
    remote: Option<MediaHandle>,
    next_generation: u64,
}

impl SupervisorInner {
    fn set_state(&mut self, new_state: ConnectionState, events: &mut Vec<CallEvent>) {
        if self.state != new_state {
            tracing::info!("Peer connection state: {} -> {}", self.state, new_state);
            self.state = new_state;
            events.push(CallEvent::StateChanged(new_state));
        }
    }

    fn clear_remote(&mut self, events: &mut Vec<CallEvent>) {
        if let Some(remote) = self.remote.take() {
            remote.stop();
            events.push(CallEvent::RemoteStreamEnded);
        }
    }

    /// Löst die aktuelle Instanz ab und schließt sie
    fn retire_live(&mut self) -> bool {
        match self.live.take() {
            Some(peer) => {
                tracing::debug!("Destroying transport #{}", peer.generation);
                peer.transport.destroy();
                true
            }
            None => false,
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.live.as_ref().map(|p| p.generation) == Some(generation)
    }
}

struct Shared {
    room_id: String,
    local_user_id: String,
    factory: Arc<dyn TransportFactory>,
    channel: SignalingChannel,
    listener: CallEventListener,
    inner: Mutex<SupervisorInner>,
}

/// Besitzt die (einzige) Peer Connection einer Call Session
pub struct PeerConnectionSupervisor {
    shared: Arc<Shared>,
}

impl PeerConnectionSupervisor {
    pub fn new(
        room_id: impl Into<String>,
        local_user_id: impl Into<String>,
        factory: Arc<dyn TransportFactory>,
        channel: SignalingChannel,
        listener: CallEventListener,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                room_id: room_id.into(),
                local_user_id: local_user_id.into(),
                factory,
                channel,
                listener,
                inner: Mutex::new(SupervisorInner {
                    state: ConnectionState::Idle,
                    live: None,
                    remote: None,
                    next_generation: 1,
                }),
            }),
        }
    }

    /// Aktueller Verbindungsstatus
    pub fn state(&self) -> ConnectionState {
        self.shared.inner.lock().state
    }

    /// `Some(true)` wenn die lebende Instanz das Offer erzeugt hat
    pub fn is_initiator(&self) -> Option<bool> {
        self.shared.inner.lock().live.as_ref().map(|p| p.is_initiator)
    }

    pub fn has_transport(&self) -> bool {
        self.shared.inner.lock().live.is_some()
    }

    pub fn remote_stream(&self) -> Option<MediaHandle> {
        self.shared.inner.lock().remote.clone()
    }

    /// Startet eine neue Verhandlung als Initiator
    pub fn initiate(&self, local_stream: &MediaHandle) -> Result<(), CallEngineError> {
        tracing::info!("Initiating peer connection in room {}", self.shared.room_id);
        self.start(true, local_stream, None)
    }

    /// Beantwortet ein Remote-Offer mit einer neuen Instanz
    pub fn handle_offer(
        &self,
        offer: SessionDescription,
        local_stream: Option<&MediaHandle>,
    ) -> Result<(), CallEngineError> {
        let local_stream = local_stream.ok_or(CallEngineError::NoLocalStream)?;

        if offer.sdp_type != SdpType::Offer {
            return Err(TransportError::InvalidSignal("expected an offer".to_string()).into());
        }

        let already_answered = self
            .shared
            .inner
            .lock()
            .live
            .as_ref()
            .and_then(|p| p.answered_offer.as_deref())
            .map_or(false, |sdp| sdp == offer.sdp);
        if already_answered {
            tracing::debug!("Offer already answered by live transport, ignoring");
            return Ok(());
        }

        tracing::info!("Answering offer in room {}", self.shared.room_id);
        self.start(false, local_stream, Some(offer))
    }

    /// Übergibt ein Answer an die lebende Instanz
    pub fn handle_answer(&self, answer: SessionDescription) -> Result<(), CallEngineError> {
        if answer.sdp_type != SdpType::Answer {
            return Err(TransportError::InvalidSignal("expected an answer".to_string()).into());
        }

        let inner = self.shared.inner.lock();
        match inner.live.as_ref() {
            None => {
                tracing::debug!("Answer received without active transport, ignoring");
                Ok(())
            }
            Some(peer) if !peer.is_initiator => {
                tracing::debug!("Answer received by answering transport, ignoring");
                Ok(())
            }
            Some(peer) if peer.sent_offer.is_none() => {
                tracing::debug!("Answer received before own offer was sent, ignoring");
                Ok(())
            }
            Some(peer) => {
                peer.transport.signal(SignalData::Description(answer))?;
                Ok(())
            }
        }
    }

    /// Veröffentlicht Offer und Candidates der laufenden Verhandlung erneut
    ///
    /// Für einen Teilnehmer, der das erste Offer verpasst hat. Es entsteht
    /// keine neue Instanz. Gibt `false` zurück, wenn es nichts zu wiederholen
    /// gibt (kein Initiator, Offer noch nicht raus, schon verbunden).
    pub fn resend_offer(&self) -> Result<bool, CallEngineError> {
        let inner = self.shared.inner.lock();
        if inner.state != ConnectionState::Connecting {
            return Ok(false);
        }
        let Some(peer) = inner.live.as_ref().filter(|p| p.is_initiator) else {
            return Ok(false);
        };
        let Some(offer) = peer.sent_offer.clone() else {
            return Ok(false);
        };

        tracing::info!(
            "Resending offer of transport #{} with {} candidates",
            peer.generation,
            peer.sent_candidates.len()
        );
        self.shared.publish(SignalData::Description(offer))?;
        for candidate in &peer.sent_candidates {
            self.shared.publish(SignalData::Candidate(candidate.clone()))?;
        }
        Ok(true)
    }

    /// Übergibt einen ICE Candidate; ohne Instanz wird er verworfen
    pub fn handle_ice_candidate(&self, candidate: IceCandidate) -> Result<(), CallEngineError> {
        let inner = self.shared.inner.lock();
        match inner.live.as_ref() {
            Some(peer) => {
                peer.transport.signal(SignalData::Candidate(candidate))?;
                Ok(())
            }
            None => {
                tracing::trace!("ICE candidate without active transport, discarded");
                Ok(())
            }
        }
    }

    /// Schließt die lebende Instanz (falls vorhanden); immer sicher aufrufbar
    pub fn destroy(&self) {
        let mut events = Vec::new();
        {
            let mut inner = self.shared.inner.lock();
            let had_transport = inner.retire_live();
            inner.clear_remote(&mut events);
            if had_transport || inner.state != ConnectionState::Idle {
                inner.set_state(ConnectionState::Closed, &mut events);
            }
        }
        self.shared.emit(events);
    }

    fn start(
        &self,
        initiator: bool,
        local_stream: &MediaHandle,
        offer: Option<SessionDescription>,
    ) -> Result<(), CallEngineError> {
        let mut events = Vec::new();
        let result = {
            let mut inner = self.shared.inner.lock();
            inner.retire_live();
            inner.clear_remote(&mut events);

            let generation = inner.next_generation;
            inner.next_generation += 1;

            let options = TransportOptions::new(initiator, local_stream.clone());
            let sink = Shared::event_sink(&self.shared, generation);

            match self.shared.factory.create(options, sink) {
                Ok(transport) => {
                    let answered_offer = offer.as_ref().map(|o| o.sdp.clone());
                    let fed = match offer {
                        Some(offer) => transport.signal(SignalData::Description(offer)),
                        None => Ok(()),
                    };

                    match fed {
                        Ok(()) => {
                            tracing::debug!(
                                "Transport #{} created (initiator: {})",
                                generation,
                                initiator
                            );
                            inner.live = Some(LivePeer {
                                generation,
                                is_initiator: initiator,
                                transport,
                                sent_offer: None,
                                sent_candidates: Vec::new(),
                                answered_offer,
                            });
                            inner.set_state(ConnectionState::Connecting, &mut events);
                            Ok(())
                        }
                        Err(e) => {
                            transport.destroy();
                            inner.set_state(ConnectionState::Failed, &mut events);
                            Err(e.into())
                        }
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to create transport: {}", e);
                    inner.set_state(ConnectionState::Failed, &mut events);
                    Err(e.into())
                }
            }
        };

        self.shared.emit(events);
        result
    }
}

impl Shared {
    /// Callback für genau eine Transport-Generation
    fn event_sink(shared: &Arc<Shared>, generation: u64) -> TransportEventSink {
        let weak: Weak<Shared> = Arc::downgrade(shared);
        Arc::new(move |event| {
            if let Some(shared) = weak.upgrade() {
                shared.on_transport_event(generation, event);
            }
        })
    }

    fn on_transport_event(&self, generation: u64, event: TransportEvent) {
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock();
            if !inner.is_current(generation) {
                tracing::trace!("Dropping event from stale transport #{}", generation);
                return;
            }

            match event {
                TransportEvent::Signal(data) => {
                    if let Some(peer) = inner.live.as_mut() {
                        peer.record_sent(&data);
                    }
                    // Kein Retry: eine verlorene Nachricht lässt die Verhandlung hängen
                    if let Err(e) = self.publish(data) {
                        tracing::warn!("Failed to publish signal: {}", e);
                    }
                }

                TransportEvent::Connect => {
                    inner.set_state(ConnectionState::Connected, &mut events);
                }

                TransportEvent::Stream(handle) => {
                    let is_new = inner
                        .remote
                        .as_ref()
                        .map(|current| !current.same_as(&handle))
                        .unwrap_or(true);

                    if is_new {
                        tracing::info!("Remote stream received: {}", handle.id());
                        if let Some(previous) = inner.remote.replace(handle.clone()) {
                            previous.stop();
                        }
                        events.push(CallEvent::RemoteStream(handle));
                    }
                }

                TransportEvent::Close => {
                    inner.retire_live();
                    inner.clear_remote(&mut events);
                    inner.set_state(ConnectionState::Closed, &mut events);
                }

                TransportEvent::Error(err) => {
                    tracing::error!("Transport #{} failed: {}", generation, err);
                    // Abgelöst, damit ein nachfolgendes close den Fehler nicht überschreibt
                    inner.retire_live();
                    inner.clear_remote(&mut events);
                    inner.set_state(ConnectionState::Failed, &mut events);
                    events.push(CallEvent::Error(err.into()));
                }
            }
        }
        self.emit(events);
    }

    fn publish(&self, data: SignalData) -> Result<(), SignalingError> {
        let message =
            SignalingMessage::new(&self.local_user_id, SignalingPayload::from_signal(data));
        self.channel.publish(&self.room_id, &message)
    }

    fn emit(&self, events: Vec<CallEvent>) {
        for event in events {
            (self.listener)(event);
        }
    }
}

impl std::fmt::Debug for PeerConnectionSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnectionSupervisor")
            .field("room_id", &self.shared.room_id)
            .field("state", &self.state())
            .field("is_initiator", &self.is_initiator())
            .finish()
    }
}
