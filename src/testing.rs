//! Test-Doubles für Capture und Transport

use crate::call_engine::{
    Transport, TransportError, TransportEvent, TransportEventSink, TransportFactory,
    TransportOptions,
};
use crate::media::{CaptureError, CaptureProvider, MediaConstraints, MediaHandle, MediaTrack, TrackKind};
use crate::signaling::{IceCandidate, SdpType, SessionDescription, SignalData};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;

/// Stream mit je einem Video- und Audio-Track
pub fn test_stream() -> MediaHandle {
    MediaHandle::new(vec![
        MediaTrack::new(TrackKind::Video, "test camera"),
        MediaTrack::new(TrackKind::Audio, "test microphone"),
    ])
}

// ============================================================================
// CAPTURE
// ============================================================================

/// Capture-Provider, der Fake-Tracks ausgibt und alle Anfragen protokolliert
#[derive(Default)]
pub struct FakeCapture {
    failure: Mutex<Option<CaptureError>>,
    audio_only: bool,
    gate: Option<Arc<Notify>>,
    requests: Mutex<Vec<MediaConstraints>>,
    issued: Mutex<Vec<MediaTrack>>,
}

impl FakeCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(error: CaptureError) -> Self {
        Self {
            failure: Mutex::new(Some(error)),
            ..Self::default()
        }
    }

    /// Liefert immer nur einen Audio-Track
    pub fn audio_only() -> Self {
        Self {
            audio_only: true,
            ..Self::default()
        }
    }

    /// Jede Anfrage wartet, bis `gate` benachrichtigt wird
    pub fn gated(gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    pub fn set_failure(&self, error: Option<CaptureError>) {
        *self.failure.lock() = error;
    }

    pub fn requests(&self) -> Vec<MediaConstraints> {
        self.requests.lock().clone()
    }

    /// Anzahl ausgegebener Tracks, die noch laufen
    pub fn live_tracks(&self) -> usize {
        self.issued.lock().iter().filter(|t| t.is_live()).count()
    }
}

#[async_trait]
impl CaptureProvider for FakeCapture {
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<MediaHandle, CaptureError> {
        self.requests.lock().push(constraints);

        if let Some(gate) = &self.gate {
            gate.notified().await;
        }

        if let Some(error) = self.failure.lock().clone() {
            return Err(error);
        }

        let mut tracks = Vec::new();
        if self.audio_only {
            tracks.push(MediaTrack::new(TrackKind::Audio, "fake microphone"));
        } else {
            if constraints.video {
                tracks.push(MediaTrack::new(TrackKind::Video, "fake camera"));
            }
            if constraints.audio {
                tracks.push(MediaTrack::new(TrackKind::Audio, "fake microphone"));
            }
        }

        self.issued.lock().extend(tracks.iter().cloned());
        Ok(MediaHandle::new(tracks))
    }
}

// ============================================================================
// TRANSPORT
// ============================================================================

/// Gemeinsames "Netz" für mehrere Sessions in einem Test
///
/// Transports darauf verhandeln selbstständig: ein Initiator sendet ein
/// eindeutiges Offer, ein Answerer beantwortet es, und nur ein Answer auf
/// genau dieses Offer verbindet beide Seiten. Alle Events laufen über
/// `tokio::spawn`, nie synchron.
#[derive(Default)]
pub struct LoopbackNetwork {
    next_offer: AtomicUsize,
    /// Offer-SDP -> Transport, der es beantwortet hat
    answered: Mutex<HashMap<String, Weak<FakeTransport>>>,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn answer_for(offer: &str) -> String {
        format!("answer:{}", offer)
    }
}

/// Transport, der Signale aufzeichnet; Events werden per `fire` ausgelöst
pub struct FakeTransport {
    pub options: TransportOptions,
    sink: TransportEventSink,
    signals: Mutex<Vec<SignalData>>,
    destroyed: AtomicBool,
    network: Option<Arc<LoopbackNetwork>>,
    local_offer: Option<String>,
    me: Weak<FakeTransport>,
}

impl FakeTransport {
    pub fn fire(&self, event: TransportEvent) {
        (self.sink)(event);
    }

    pub fn fire_signal(&self, data: SignalData) {
        self.fire(TransportEvent::Signal(data));
    }

    pub fn signals(&self) -> Vec<SignalData> {
        self.signals.lock().clone()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn spawn_events(&self, events: Vec<TransportEvent>) {
        let sink = Arc::clone(&self.sink);
        tokio::spawn(async move {
            for event in events {
                sink(event);
            }
        });
    }

    fn connected_events() -> Vec<TransportEvent> {
        vec![
            TransportEvent::Connect,
            TransportEvent::Stream(MediaHandle::new(vec![MediaTrack::new(
                TrackKind::Video,
                "remote camera",
            )])),
        ]
    }

    /// Automatische Verhandlung auf dem `LoopbackNetwork`
    fn negotiate(&self, network: &LoopbackNetwork, data: &SignalData) {
        let SignalData::Description(desc) = data else {
            return;
        };

        match desc.sdp_type {
            SdpType::Offer if !self.options.initiator => {
                network
                    .answered
                    .lock()
                    .insert(desc.sdp.clone(), self.me.clone());
                let answer = SessionDescription::answer(LoopbackNetwork::answer_for(&desc.sdp));
                self.spawn_events(vec![TransportEvent::Signal(SignalData::Description(answer))]);
            }
            SdpType::Answer if self.options.initiator => {
                let Some(offer) = self.local_offer.as_deref() else {
                    return;
                };
                if desc.sdp != LoopbackNetwork::answer_for(offer) {
                    self.spawn_events(vec![TransportEvent::Error(TransportError::WebRTC(
                        format!("answer does not match {}", offer),
                    ))]);
                    return;
                }

                let answerer = network.answered.lock().get(offer).and_then(Weak::upgrade);
                if let Some(answerer) = answerer.filter(|t| !t.is_destroyed()) {
                    answerer.spawn_events(Self::connected_events());
                    self.spawn_events(Self::connected_events());
                }
            }
            _ => {}
        }
    }
}

impl Transport for FakeTransport {
    fn signal(&self, data: SignalData) -> Result<(), TransportError> {
        if self.is_destroyed() {
            return Err(TransportError::Destroyed);
        }
        if let Some(network) = &self.network {
            self.negotiate(network, &data);
        }
        self.signals.lock().push(data);
        Ok(())
    }

    fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeTransportFactory {
    transports: Mutex<Vec<Arc<FakeTransport>>>,
    max_live: Mutex<usize>,
    next_error: Mutex<Option<TransportError>>,
    network: Option<Arc<LoopbackNetwork>>,
}

impl FakeTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory, deren Transports auf `network` selbst verhandeln
    pub fn negotiating(network: &Arc<LoopbackNetwork>) -> Self {
        Self {
            network: Some(Arc::clone(network)),
            ..Self::default()
        }
    }

    pub fn fail_next_create(&self, error: TransportError) {
        *self.next_error.lock() = Some(error);
    }

    pub fn transport(&self, index: usize) -> Arc<FakeTransport> {
        Arc::clone(&self.transports.lock()[index])
    }

    pub fn last(&self) -> Option<Arc<FakeTransport>> {
        self.transports.lock().last().cloned()
    }

    pub fn created(&self) -> usize {
        self.transports.lock().len()
    }

    pub fn live_count(&self) -> usize {
        self.transports
            .lock()
            .iter()
            .filter(|t| !t.is_destroyed())
            .count()
    }

    /// Höchste Anzahl gleichzeitig lebender Instanzen
    pub fn max_live(&self) -> usize {
        *self.max_live.lock()
    }
}

impl TransportFactory for FakeTransportFactory {
    fn create(
        &self,
        options: TransportOptions,
        events: TransportEventSink,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        if let Some(error) = self.next_error.lock().take() {
            return Err(error);
        }

        let local_offer = match &self.network {
            Some(network) if options.initiator => Some(format!(
                "offer#{}",
                network.next_offer.fetch_add(1, Ordering::SeqCst)
            )),
            _ => None,
        };

        let transport = Arc::new_cyclic(|me| FakeTransport {
            options,
            sink: events,
            signals: Mutex::new(Vec::new()),
            destroyed: AtomicBool::new(false),
            network: self.network.clone(),
            local_offer,
            me: me.clone(),
        });

        if let Some(offer) = &transport.local_offer {
            let description = SessionDescription::offer(offer.clone());
            let candidate = IceCandidate::new(format!("candidate:{} 1 udp 1 10.0.0.1 5000", offer));
            transport.spawn_events(vec![
                TransportEvent::Signal(SignalData::Description(description)),
                TransportEvent::Signal(SignalData::Candidate(candidate)),
            ]);
        }

        self.transports.lock().push(Arc::clone(&transport));

        let live = self.live_count();
        let mut max_live = self.max_live.lock();
        *max_live = (*max_live).max(live);

        Ok(transport)
    }
}
