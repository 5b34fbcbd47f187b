//! WebRTC Transport (webrtc-rs)
//!
//! Jede Instanz besitzt eine `RTCPeerConnection` und einen eigenen Task,
//! der Remote-Signale der Reihe nach abarbeitet. Events gehen über den
//! Sink des Supervisors raus, immer aus dem Task, nie synchron.
//!
//! Lokale Tracks werden als `TrackLocalStaticSample` angemeldet. Die
//! Capture-Seite schreibt kodierte Samples über [`MediaTrack::write_sample`],
//! ein Pump-Task pro Track reicht sie an webrtc-rs weiter.

use super::transport::{
    Transport, TransportError, TransportEvent, TransportEventSink, TransportFactory,
    TransportOptions,
};
use crate::config::{CallConfig, IceServerConfig};
use crate::media::{MediaHandle, MediaTrack, TrackKind};
use crate::signaling::{IceCandidate, SdpType, SessionDescription, SignalData};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

fn webrtc_err(e: impl std::fmt::Display) -> TransportError {
    TransportError::WebRTC(e.to_string())
}

// ============================================================================
// FACTORY
// ============================================================================

/// Erzeugt webrtc-rs Peer Connections
#[derive(Debug, Clone)]
pub struct RtcTransportFactory {
    ice_servers: Vec<RTCIceServer>,
}

impl RtcTransportFactory {
    pub fn new(config: &CallConfig) -> Self {
        Self {
            ice_servers: config.ice_servers.iter().map(to_rtc_ice_server).collect(),
        }
    }

    pub fn ice_servers(&self) -> &[RTCIceServer] {
        &self.ice_servers
    }
}

fn to_rtc_ice_server(server: &IceServerConfig) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

impl TransportFactory for RtcTransportFactory {
    fn create(
        &self,
        options: TransportOptions,
        events: TransportEventSink,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| TransportError::NoRuntime)?;

        let (tx, rx) = mpsc::unbounded_channel();
        runtime.spawn(run_peer(self.ice_servers.clone(), options, events, rx));

        Ok(Arc::new(RtcTransport {
            commands: tx,
            destroyed: AtomicBool::new(false),
        }))
    }
}

// ============================================================================
// TRANSPORT HANDLE
// ============================================================================

enum Command {
    Signal(SignalData),
    Destroy,
}

/// Handle auf den Peer-Task
pub struct RtcTransport {
    commands: mpsc::UnboundedSender<Command>,
    destroyed: AtomicBool,
}

impl Transport for RtcTransport {
    fn signal(&self, data: SignalData) -> Result<(), TransportError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(TransportError::Destroyed);
        }
        self.commands
            .send(Command::Signal(data))
            .map_err(|_| TransportError::Destroyed)
    }

    fn destroy(&self) {
        if !self.destroyed.swap(true, Ordering::SeqCst) {
            let _ = self.commands.send(Command::Destroy);
        }
    }
}

impl std::fmt::Debug for RtcTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtcTransport")
            .field("destroyed", &self.destroyed.load(Ordering::SeqCst))
            .finish()
    }
}

// ============================================================================
// PEER TASK
// ============================================================================

async fn run_peer(
    ice_servers: Vec<RTCIceServer>,
    options: TransportOptions,
    events: TransportEventSink,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let (pc, pumps) = match create_peer_connection(ice_servers, &options.stream, &events).await {
        Ok(created) => created,
        Err(e) => {
            events(TransportEvent::Error(e));
            return;
        }
    };

    let mut negotiation = Negotiation {
        pc: Arc::clone(&pc),
        events: Arc::clone(&events),
        pending_candidates: Vec::new(),
        applied_answer: None,
    };

    let mut failed = false;
    if options.initiator {
        if let Err(e) = negotiation.create_offer().await {
            events(TransportEvent::Error(e));
            failed = true;
        }
    }

    while !failed {
        match commands.recv().await {
            Some(Command::Signal(data)) => {
                if let Err(e) = negotiation.apply(data).await {
                    events(TransportEvent::Error(e));
                    failed = true;
                }
            }
            Some(Command::Destroy) | None => break,
        }
    }

    for pump in pumps {
        pump.abort();
    }
    if let Err(e) = pc.close().await {
        tracing::debug!("Peer connection close failed: {}", e);
    }
}

/// Erstellt eine neue Peer Connection mit lokalen Tracks und Handlern
///
/// Gibt zusätzlich die Sample-Pumps der lokalen Tracks zurück.
async fn create_peer_connection(
    ice_servers: Vec<RTCIceServer>,
    local_stream: &MediaHandle,
    events: &TransportEventSink,
) -> Result<(Arc<RTCPeerConnection>, Vec<JoinHandle<()>>), TransportError> {
    // Media Engine mit Standard-Codecs (Opus, VP8, ...)
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs().map_err(webrtc_err)?;

    // Interceptors für RTCP, NACK etc.
    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine).map_err(webrtc_err)?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let config = RTCConfiguration {
        ice_servers,
        ..Default::default()
    };

    let pc = Arc::new(api.new_peer_connection(config).await.map_err(webrtc_err)?);

    let mut pumps = Vec::new();
    for track in local_stream.tracks().iter().filter(|t| t.is_live()) {
        match add_local_track(&pc, track, local_stream.id()).await {
            Ok(pump) => pumps.push(pump),
            Err(e) => {
                pumps.iter().for_each(JoinHandle::abort);
                return Err(e);
            }
        }
    }

    register_handlers(&pc, events);

    Ok((pc, pumps))
}

async fn add_local_track(
    pc: &Arc<RTCPeerConnection>,
    track: &MediaTrack,
    stream_id: &str,
) -> Result<JoinHandle<()>, TransportError> {
    let mime_type = match track.kind() {
        TrackKind::Audio => MIME_TYPE_OPUS,
        TrackKind::Video => MIME_TYPE_VP8,
    };

    let local = Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: mime_type.to_string(),
            ..Default::default()
        },
        track.id().to_string(),
        stream_id.to_string(),
    ));

    let sender = pc
        .add_track(Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>)
        .await
        .map_err(webrtc_err)?;

    // RTCP lesen, sonst laufen die Interceptor-Puffer voll
    tokio::spawn(async move {
        let mut buf = vec![0u8; 1500];
        while sender.read(&mut buf).await.is_ok() {}
    });

    let mut samples = track.attach_sink();
    let kind = track.kind();
    let pump = tokio::spawn(async move {
        while let Some(sample) = samples.recv().await {
            let sample = Sample {
                data: sample.data.into(),
                duration: sample.duration,
                ..Default::default()
            };
            // webrtc-rs übernimmt die RTP-Paketierung
            if let Err(e) = local.write_sample(&sample).await {
                tracing::debug!("Failed to write {:?} sample: {}", kind, e);
            }
        }
    });

    tracing::debug!("Added local {:?} track {}", track.kind(), track.id());
    Ok(pump)
}

/// Registriert Event Handler für die Peer Connection
fn register_handlers(pc: &Arc<RTCPeerConnection>, events: &TransportEventSink) {
    // Connection State Handler
    let sink = Arc::clone(events);
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        tracing::info!("Peer connection state: {:?}", s);

        if let Some(event) = state_event(s) {
            sink(event);
        }

        Box::pin(async {})
    }));

    // ICE Candidate Handler (Trickle)
    let sink = Arc::clone(events);
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        if let Some(c) = candidate {
            match c.to_json() {
                Ok(init) => sink(TransportEvent::Signal(SignalData::Candidate(
                    from_candidate_init(init),
                ))),
                Err(e) => tracing::warn!("Failed to serialize ICE candidate: {}", e),
            }
        }
        Box::pin(async {})
    }));

    // Track Handler: alle Remote-Tracks landen in einem Stream
    let sink = Arc::clone(events);
    let remote = MediaHandle::new(Vec::new());
    pc.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
        let kind = match track.kind() {
            RTPCodecType::Audio => Some(TrackKind::Audio),
            RTPCodecType::Video => Some(TrackKind::Video),
            _ => None,
        };

        if let Some(kind) = kind {
            tracing::info!("Received remote {:?} track: {}", kind, track.id());
            remote.add_track(MediaTrack::with_id(track.id(), kind, track.stream_id()));
            sink(TransportEvent::Stream(remote.clone()));
        }

        Box::pin(async {})
    }));
}

/// Übersetzt den Verbindungszustand in ein Transport-Event
///
/// Ein Abbruch durch die Gegenseite ist ein Fehler. `Closed` sieht nur,
/// wer selbst `close()` aufgerufen hat.
fn state_event(state: RTCPeerConnectionState) -> Option<TransportEvent> {
    match state {
        RTCPeerConnectionState::Connected => Some(TransportEvent::Connect),
        RTCPeerConnectionState::Disconnected => Some(TransportEvent::Error(
            TransportError::WebRTC("peer connection disconnected".to_string()),
        )),
        RTCPeerConnectionState::Failed => Some(TransportEvent::Error(TransportError::WebRTC(
            "peer connection failed".to_string(),
        ))),
        RTCPeerConnectionState::Closed => Some(TransportEvent::Close),
        _ => None,
    }
}

fn from_candidate_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_m_line_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn to_candidate_init(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_m_line_index,
        username_fragment: candidate.username_fragment,
    }
}

// ============================================================================
// NEGOTIATION
// ============================================================================

struct Negotiation {
    pc: Arc<RTCPeerConnection>,
    events: TransportEventSink,
    /// Candidates, die vor der Remote Description ankamen
    pending_candidates: Vec<IceCandidate>,
    applied_answer: Option<String>,
}

impl Negotiation {
    /// Initiator: Offer erzeugen und melden, bevor das Gathering startet
    async fn create_offer(&mut self) -> Result<(), TransportError> {
        let offer = self.pc.create_offer(None).await.map_err(webrtc_err)?;

        (self.events)(TransportEvent::Signal(SignalData::Description(
            SessionDescription::offer(offer.sdp.clone()),
        )));

        self.pc
            .set_local_description(offer)
            .await
            .map_err(webrtc_err)
    }

    async fn apply(&mut self, data: SignalData) -> Result<(), TransportError> {
        match data {
            SignalData::Description(desc) => match desc.sdp_type {
                SdpType::Offer => self.accept_offer(desc.sdp).await,
                SdpType::Answer => self.accept_answer(desc.sdp).await,
            },
            SignalData::Candidate(candidate) => self.add_candidate(candidate).await,
        }
    }

    async fn accept_offer(&mut self, sdp: String) -> Result<(), TransportError> {
        if self.pc.remote_description().await.is_some() {
            tracing::debug!("Renegotiation offer ignored");
            return Ok(());
        }

        let offer = RTCSessionDescription::offer(sdp)
            .map_err(|e| TransportError::InvalidSignal(e.to_string()))?;
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(webrtc_err)?;
        self.flush_candidates().await?;

        let answer = self.pc.create_answer(None).await.map_err(webrtc_err)?;

        (self.events)(TransportEvent::Signal(SignalData::Description(
            SessionDescription::answer(answer.sdp.clone()),
        )));

        self.pc
            .set_local_description(answer)
            .await
            .map_err(webrtc_err)
    }

    async fn accept_answer(&mut self, sdp: String) -> Result<(), TransportError> {
        if self.applied_answer.as_deref() == Some(sdp.as_str()) {
            tracing::debug!("Duplicate answer ignored");
            return Ok(());
        }
        if self.applied_answer.is_some() {
            tracing::warn!("Second answer with different SDP ignored");
            return Ok(());
        }

        let answer = RTCSessionDescription::answer(sdp.clone())
            .map_err(|e| TransportError::InvalidSignal(e.to_string()))?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(webrtc_err)?;
        self.applied_answer = Some(sdp);

        self.flush_candidates().await
    }

    async fn add_candidate(&mut self, candidate: IceCandidate) -> Result<(), TransportError> {
        // Leerer Candidate = End-of-Candidates
        if candidate.candidate.is_empty() {
            return Ok(());
        }

        if self.pc.remote_description().await.is_none() {
            self.pending_candidates.push(candidate);
            return Ok(());
        }

        self.pc
            .add_ice_candidate(to_candidate_init(candidate))
            .await
            .map_err(webrtc_err)
    }

    async fn flush_candidates(&mut self) -> Result<(), TransportError> {
        for candidate in std::mem::take(&mut self.pending_candidates) {
            self.pc
                .add_ice_candidate(to_candidate_init(candidate))
                .await
                .map_err(webrtc_err)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaSample;
    use crate::testing::test_stream;
    use std::time::Duration;

    #[test]
    fn test_ice_servers_from_config() {
        let config = CallConfig::default().with_turn_server(
            "turn:turn.example.com:3478".to_string(),
            "u".to_string(),
            "p".to_string(),
        );
        let factory = RtcTransportFactory::new(&config);

        let servers = factory.ice_servers();
        assert_eq!(servers.len(), config.ice_servers.len());

        let turn = servers.last().unwrap();
        assert_eq!(turn.urls, vec!["turn:turn.example.com:3478".to_string()]);
        assert_eq!(turn.username, "u");
        assert_eq!(turn.credential, "p");
    }

    #[test]
    fn test_create_without_runtime() {
        let factory = RtcTransportFactory::new(&CallConfig::default());
        let result = factory.create(
            TransportOptions::new(true, test_stream()),
            Arc::new(|_| {}),
        );
        assert!(matches!(result, Err(TransportError::NoRuntime)));
    }

    #[test]
    fn test_candidate_conversion_keeps_fields() {
        let mut candidate = IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 5000 typ host");
        candidate.sdp_mid = Some("0".to_string());
        candidate.sdp_m_line_index = Some(0);

        let back = from_candidate_init(to_candidate_init(candidate.clone()));
        assert_eq!(back, candidate);
    }

    #[test]
    fn test_remote_disconnect_is_an_error() {
        assert!(matches!(
            state_event(RTCPeerConnectionState::Disconnected),
            Some(TransportEvent::Error(TransportError::WebRTC(_)))
        ));
        assert!(matches!(
            state_event(RTCPeerConnectionState::Failed),
            Some(TransportEvent::Error(TransportError::WebRTC(_)))
        ));
        assert!(matches!(
            state_event(RTCPeerConnectionState::Closed),
            Some(TransportEvent::Close)
        ));
        assert!(matches!(
            state_event(RTCPeerConnectionState::Connected),
            Some(TransportEvent::Connect)
        ));
        assert!(state_event(RTCPeerConnectionState::Connecting).is_none());
        assert!(state_event(RTCPeerConnectionState::New).is_none());
    }

    #[tokio::test]
    async fn test_initiator_emits_offer_first() {
        let mut config = CallConfig::default();
        config.ice_servers.clear();
        let factory = RtcTransportFactory::new(&config);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = factory
            .create(
                TransportOptions::new(true, test_stream()),
                Arc::new(move |e| {
                    let _ = tx.send(e);
                }),
            )
            .unwrap();

        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();

        match first {
            TransportEvent::Signal(SignalData::Description(desc)) => {
                assert_eq!(desc.sdp_type, SdpType::Offer);
                assert!(desc.sdp.contains("m=video"));
            }
            other => panic!("unexpected first event: {:?}", other),
        }

        transport.destroy();
        assert_eq!(
            transport.signal(SignalData::Candidate(IceCandidate::new("candidate:1"))),
            Err(TransportError::Destroyed)
        );
    }

    #[tokio::test]
    async fn test_local_tracks_feed_the_peer_connection() {
        let mut config = CallConfig::default();
        config.ice_servers.clear();
        let factory = RtcTransportFactory::new(&config);
        let stream = test_stream();
        let video = stream.tracks_of(TrackKind::Video).remove(0);
        let frame = MediaSample::new(vec![0x90, 0x90, 0x90], Duration::from_millis(33));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = factory
            .create(
                TransportOptions::new(true, stream.clone()),
                Arc::new(move |e| {
                    let _ = tx.send(e);
                }),
            )
            .unwrap();

        // Das Offer kommt erst, wenn alle lokalen Tracks angemeldet sind
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(video.write_sample(frame.clone()), 1);

        transport.destroy();
        let detached = async {
            while video.write_sample(frame.clone()) > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), detached)
            .await
            .unwrap();
    }
}
