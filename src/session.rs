//! Call Session - einziger Einstiegspunkt für die UI
//!
//! Verbindet Capture, Signaling und den Peer Connection Supervisor:
//!
//! - Kamera an: lokalen Stream holen, `camera-on` senden, Verhandlung starten
//!   (oder ein wartendes Offer beantworten)
//! - Kamera aus: Stream freigeben, `camera-off` senden, Transport schließen
//! - Eingehende Raum-Nachrichten an den Supervisor weiterreichen
//! - Remote-Kamera an: ein laufendes Offer wiederholen, eine stehende
//!   Verbindung nie abbauen
//!
//! Fehler gehen nie als `Err` an den Aufrufer, sondern an `on_error` und
//! den Event-Stream.

use crate::call_engine::{
    CallEngineError, CallEvent, ConnectionState, PeerConnectionSupervisor, RtcTransportFactory,
    TransportError, TransportFactory,
};
use crate::config::CallConfig;
use crate::media::{
    CaptureError, CaptureEvent, CaptureProvider, MediaCaptureManager, MediaHandle, TrackKind,
};
use crate::signaling::{
    PubSub, RealtimeClient, SessionDescription, SignalingChannel, SignalingError,
    SignalingMessage, SignalingPayload, Subscription,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::broadcast;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Einheitlicher Fehler für `on_error`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("Call engine error: {0}")]
    Engine(CallEngineError),
}

impl From<CallEngineError> for CallError {
    fn from(err: CallEngineError) -> Self {
        match err {
            CallEngineError::Transport(e) => Self::Transport(e),
            CallEngineError::Signaling(e) => Self::Signaling(e),
            other => Self::Engine(other),
        }
    }
}

// ============================================================================
// OPTIONS / EVENTS
// ============================================================================

/// Identität einer Session im Raum
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOptions {
    pub room_id: String,
    pub user_id: String,
    #[serde(default)]
    pub is_observer: bool,
}

impl SessionOptions {
    pub fn new(room_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            user_id: user_id.into(),
            is_observer: false,
        }
    }

    pub fn observer(mut self, is_observer: bool) -> Self {
        self.is_observer = is_observer;
        self
    }
}

/// Events die von der CallSession ausgelöst werden
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(ConnectionState),
    CameraChanged(bool),
    RemoteStream(MediaHandle),
    RemoteStreamEnded,
    RemoteCameraOn { user_id: String, is_observer: bool },
    RemoteCameraOff { user_id: String },
    /// Ein Offer wartet darauf, dass die lokale Kamera eingeschaltet wird
    OfferPending { user_id: String },
    Error(CallError),
}

type RemoteStreamCallback = Arc<dyn Fn(MediaHandle) + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(CallError) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    on_remote_stream: Option<RemoteStreamCallback>,
    on_error: Option<ErrorCallback>,
}

#[derive(Default)]
struct LocalState {
    camera_on: bool,
    local: Option<MediaHandle>,
    pending_offer: Option<SessionDescription>,
    muted: bool,
    closed: bool,
}

// ============================================================================
// CALL SESSION
// ============================================================================

struct SessionInner {
    options: SessionOptions,
    capture: MediaCaptureManager,
    supervisor: PeerConnectionSupervisor,
    /// Lock-Reihenfolge: `state` vor dem Supervisor
    state: Mutex<LocalState>,
    toggle_lock: tokio::sync::Mutex<()>,
    callbacks: RwLock<Callbacks>,
    event_tx: broadcast::Sender<SessionEvent>,
    subscription: Mutex<Option<Subscription>>,
}

/// Eine Call-Session (ein Raum, ein lokaler Teilnehmer)
#[derive(Clone)]
pub struct CallSession {
    inner: Arc<SessionInner>,
}

impl CallSession {
    /// Erstellt eine Session und abonniert den Raum
    ///
    /// Muss innerhalb einer Tokio Runtime aufgerufen werden.
    pub fn new(
        options: SessionOptions,
        config: &CallConfig,
        capture: Arc<dyn CaptureProvider>,
        transports: Arc<dyn TransportFactory>,
        pubsub: Arc<dyn PubSub>,
    ) -> Result<Self, CallError> {
        let channel = SignalingChannel::new(pubsub, config.topic_prefix.clone());
        let (event_tx, _) = broadcast::channel(100);

        let inner = Arc::new_cyclic(|weak: &Weak<SessionInner>| {
            let capture = MediaCaptureManager::new(capture)
                .with_listener(presence_publisher(&options, channel.clone()));

            let events = weak.clone();
            let supervisor = PeerConnectionSupervisor::new(
                options.room_id.clone(),
                options.user_id.clone(),
                transports,
                channel.clone(),
                Arc::new(move |event| {
                    if let Some(inner) = events.upgrade() {
                        inner.on_call_event(event);
                    }
                }),
            );

            SessionInner {
                options: options.clone(),
                capture,
                supervisor,
                state: Mutex::new(LocalState::default()),
                toggle_lock: tokio::sync::Mutex::new(()),
                callbacks: RwLock::new(Callbacks::default()),
                event_tx,
                subscription: Mutex::new(None),
            }
        });

        let weak = Arc::downgrade(&inner);
        let subscription = channel.subscribe(&options.room_id, move |message| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_message(message);
            }
        })?;
        *inner.subscription.lock() = Some(subscription);

        tracing::info!(
            "Call session created: room={} user={} observer={}",
            options.room_id,
            options.user_id,
            options.is_observer
        );

        Ok(Self { inner })
    }

    /// Verbindet sich mit dem Realtime-Relay und nutzt webrtc-rs als Transport
    pub async fn connect(
        options: SessionOptions,
        config: &CallConfig,
        capture: Arc<dyn CaptureProvider>,
    ) -> Result<Self, CallError> {
        let relay = RealtimeClient::connect(config).await?;
        let transports = RtcTransportFactory::new(config);
        Self::new(options, config, capture, Arc::new(transports), Arc::new(relay))
    }

    /// Schaltet die Kamera um und gibt den neuen Zustand zurück
    ///
    /// Aufrufe werden serialisiert; ein Toggle wartet auf ein laufendes.
    pub async fn toggle_camera(&self) -> bool {
        let _serial = self.inner.toggle_lock.lock().await;

        let camera_on = self.inner.state.lock().camera_on;
        if camera_on {
            self.inner.turn_camera_off();
            false
        } else {
            self.inner.turn_camera_on().await
        }
    }

    /// Registriert den Callback für neue Remote-Streams
    pub fn on_remote_stream_received<F>(&self, callback: F)
    where
        F: Fn(MediaHandle) + Send + Sync + 'static,
    {
        self.inner.callbacks.write().on_remote_stream = Some(Arc::new(callback));
    }

    /// Registriert den Callback für Capture- und Transport-Fehler
    pub fn on_error<F>(&self, callback: F)
    where
        F: Fn(CallError) + Send + Sync + 'static,
    {
        self.inner.callbacks.write().on_error = Some(Arc::new(callback));
    }

    /// Räumt alles ab; mehrfacher Aufruf ist erlaubt
    pub fn cleanup(&self) {
        self.inner.cleanup();
    }

    /// Verarbeitet eine einzelne Raum-Nachricht
    pub fn handle_signaling_message(&self, message: SignalingMessage) {
        self.inner.handle_message(message);
    }

    /// Schaltet die lokalen Audio-Tracks stumm, ohne sie freizugeben
    pub fn set_muted(&self, muted: bool) {
        let mut state = self.inner.state.lock();
        state.muted = muted;
        if let Some(local) = &state.local {
            apply_mute(local, muted);
        }
        tracing::debug!("Local audio muted: {}", muted);
    }

    pub fn is_muted(&self) -> bool {
        self.inner.state.lock().muted
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.event_tx.subscribe()
    }

    pub fn camera_on(&self) -> bool {
        self.inner.state.lock().camera_on
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.supervisor.state()
    }

    pub fn is_initiator(&self) -> bool {
        self.inner.supervisor.is_initiator().unwrap_or(false)
    }

    pub fn local_stream(&self) -> Option<MediaHandle> {
        self.inner.state.lock().local.clone()
    }

    pub fn remote_stream(&self) -> Option<MediaHandle> {
        self.inner.supervisor.remote_stream()
    }

    pub fn options(&self) -> &SessionOptions {
        &self.inner.options
    }
}

impl std::fmt::Debug for CallSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSession")
            .field("room_id", &self.inner.options.room_id)
            .field("user_id", &self.inner.options.user_id)
            .field("camera_on", &self.camera_on())
            .field("connection_state", &self.connection_state())
            .finish()
    }
}

/// Veröffentlicht camera-on/off, sobald Capture einen Stream öffnet/freigibt
fn presence_publisher(
    options: &SessionOptions,
    channel: SignalingChannel,
) -> Arc<dyn Fn(CaptureEvent) + Send + Sync> {
    let room_id = options.room_id.clone();
    let user_id = options.user_id.clone();
    let is_observer = options.is_observer;

    Arc::new(move |event| {
        let payload = match event {
            CaptureEvent::Acquired { .. } => SignalingPayload::CameraOn { is_observer },
            CaptureEvent::Released { .. } => SignalingPayload::CameraOff,
        };

        let message = SignalingMessage::new(user_id.clone(), payload);
        if let Err(e) = channel.publish(&room_id, &message) {
            tracing::warn!("Failed to publish {}: {}", message.event_name(), e);
        }
    })
}

fn apply_mute(stream: &MediaHandle, muted: bool) {
    for track in stream.tracks_of(TrackKind::Audio) {
        track.set_enabled(!muted);
    }
}

impl SessionInner {
    async fn turn_camera_on(&self) -> bool {
        if self.state.lock().closed {
            tracing::debug!("Session closed, camera stays off");
            return false;
        }

        let want_audio = !self.options.is_observer;
        let handle = match self.capture.acquire(want_audio).await {
            Ok(handle) => handle,
            Err(e) => {
                self.report_error(e.into());
                return false;
            }
        };

        let result = {
            let mut state = self.state.lock();

            if state.closed {
                drop(state);
                tracing::debug!("Session closed while acquiring, releasing late stream");
                self.capture.release(&handle);
                return false;
            }

            apply_mute(&handle, state.muted);
            state.camera_on = true;
            state.local = Some(handle.clone());
            self.emit(SessionEvent::CameraChanged(true));

            match state.pending_offer.take() {
                Some(offer) => {
                    tracing::info!("Answering pending offer");
                    self.supervisor.handle_offer(offer, Some(&handle))
                }
                None if self.options.is_observer => Ok(()),
                None if self.supervisor.state().is_active() => Ok(()),
                None => self.supervisor.initiate(&handle),
            }
        };

        if let Err(e) = result {
            self.report_error(e.into());
        }
        true
    }

    fn turn_camera_off(&self) {
        {
            let mut state = self.state.lock();
            state.camera_on = false;
            if let Some(local) = state.local.take() {
                self.capture.release(&local);
            }
            self.supervisor.destroy();
        }
        self.emit(SessionEvent::CameraChanged(false));
    }

    fn cleanup(&self) {
        let was_on = {
            let mut state = self.state.lock();
            if state.closed && state.local.is_none() {
                tracing::trace!("Session already cleaned up");
                return;
            }
            state.closed = true;
            state.pending_offer = None;

            let was_on = std::mem::replace(&mut state.camera_on, false);
            // release() sendet camera-off, falls die Kamera an war
            if let Some(local) = state.local.take() {
                self.capture.release(&local);
            }
            self.supervisor.destroy();
            was_on
        };

        self.subscription.lock().take();
        if was_on {
            self.emit(SessionEvent::CameraChanged(false));
        }

        tracing::info!("Call session cleaned up: room={}", self.options.room_id);
    }

    fn handle_message(&self, message: SignalingMessage) {
        if message.sender_id == self.options.user_id {
            tracing::trace!("Ignoring own {}", message.event_name());
            return;
        }

        tracing::debug!("Received {} from {}", message.event_name(), message.sender_id);
        let sender = message.sender_id;

        let result = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }

            match message.payload {
                SignalingPayload::CameraOn { is_observer } => {
                    self.emit(SessionEvent::RemoteCameraOn {
                        user_id: sender,
                        is_observer,
                    });

                    match state.local.as_ref() {
                        Some(local) if state.camera_on && !self.options.is_observer => {
                            self.on_remote_camera_on(local, is_observer)
                        }
                        _ => Ok(()),
                    }
                }

                SignalingPayload::CameraOff => {
                    state.pending_offer = None;
                    self.supervisor.destroy();
                    self.emit(SessionEvent::RemoteCameraOff { user_id: sender });
                    Ok(())
                }

                SignalingPayload::Offer { offer } => {
                    if !state.camera_on {
                        tracing::info!("Offer from {} stored until camera is on", sender);
                        state.pending_offer = Some(offer);
                        self.emit(SessionEvent::OfferPending { user_id: sender });
                        Ok(())
                    } else if self.loses_glare(&sender) {
                        tracing::debug!("Glare with {}, keeping own offer", sender);
                        Ok(())
                    } else {
                        self.supervisor.handle_offer(offer, state.local.as_ref())
                    }
                }

                SignalingPayload::Answer { answer } => self.supervisor.handle_answer(answer),

                SignalingPayload::IceCandidate { candidate } => {
                    self.supervisor.handle_ice_candidate(candidate)
                }
            }
        };

        if let Err(e) = result {
            self.report_error(e.into());
        }
    }

    /// Remote-Kamera ist an, die eigene auch
    ///
    /// - verbunden: nichts, der Call bleibt stehen
    /// - eigenes Offer läuft: dasselbe Offer erneut senden, die Gegenseite
    ///   hat es womöglich verpasst
    /// - keine Verhandlung: neu anbieten
    ///
    /// Observer lösen nie einen Neuaufbau aus, bekommen aber ein Offer, wenn
    /// noch gar keine Verhandlung läuft.
    fn on_remote_camera_on(
        &self,
        local: &MediaHandle,
        remote_is_observer: bool,
    ) -> Result<(), CallEngineError> {
        match self.supervisor.state() {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Connecting if remote_is_observer => Ok(()),
            ConnectionState::Connecting => self.supervisor.resend_offer().map(|_| ()),
            ConnectionState::Idle | ConnectionState::Closed | ConnectionState::Failed => {
                self.supervisor.initiate(local)
            }
        }
    }

    /// Beide Seiten haben ein Offer geschickt: die größere User-ID behält ihres
    fn loses_glare(&self, sender: &str) -> bool {
        self.supervisor.is_initiator() == Some(true)
            && self.supervisor.state() == ConnectionState::Connecting
            && self.options.user_id.as_str() > sender
    }

    fn on_call_event(&self, event: CallEvent) {
        match event {
            CallEvent::StateChanged(state) => self.emit(SessionEvent::StateChanged(state)),
            CallEvent::RemoteStream(stream) => {
                let callback = self.callbacks.read().on_remote_stream.clone();
                if let Some(callback) = callback {
                    callback(stream.clone());
                }
                self.emit(SessionEvent::RemoteStream(stream));
            }
            CallEvent::RemoteStreamEnded => self.emit(SessionEvent::RemoteStreamEnded),
            CallEvent::Error(e) => self.report_error(e.into()),
        }
    }

    fn report_error(&self, error: CallError) {
        tracing::warn!("Call error in room {}: {}", self.options.room_id, error);

        let callback = self.callbacks.read().on_error.clone();
        if let Some(callback) = callback {
            callback(error.clone());
        }
        self.emit(SessionEvent::Error(error));
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event);
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let local = self.state.get_mut().local.take();
        if let Some(local) = local {
            self.capture.release(&local);
        }
        self.supervisor.destroy();
    }
}
