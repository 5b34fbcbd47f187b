//! Media Handles - Besitz über Audio/Video-Tracks
//!
//! Ein `MediaHandle` ist billig zu klonen; alle Klone teilen sich dieselben
//! Tracks. Ein gestoppter Track bleibt gestoppt, egal über welchen Klon.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Puffer pro angehängtem Transport; ältere Samples werden nicht nachgeholt
const SAMPLE_BUFFER: usize = 64;

// ============================================================================
// TRACK
// ============================================================================

/// Art eines Tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// Kodiertes Sample eines lokalen Tracks (Opus-Paket, VP8-Frame)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSample {
    pub data: Vec<u8>,
    pub duration: Duration,
}

impl MediaSample {
    pub fn new(data: Vec<u8>, duration: Duration) -> Self {
        Self { data, duration }
    }
}

type StopHook = Box<dyn FnOnce() + Send>;

struct TrackInner {
    id: String,
    kind: TrackKind,
    label: String,
    stopped: AtomicBool,
    enabled: AtomicBool,
    on_stop: Mutex<Option<StopHook>>,
    sinks: Mutex<Vec<mpsc::Sender<MediaSample>>>,
}

/// Einzelner, unabhängig stoppbarer Track
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    /// Erstellt einen neuen Track mit zufälliger ID
    pub fn new(kind: TrackKind, label: impl Into<String>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), kind, label)
    }

    /// Erstellt einen Track mit vorgegebener ID (z.B. vom Remote-Peer)
    pub fn with_id(id: impl Into<String>, kind: TrackKind, label: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(TrackInner {
                id: id.into(),
                kind,
                label: label.into(),
                stopped: AtomicBool::new(false),
                enabled: AtomicBool::new(true),
                on_stop: Mutex::new(None),
                sinks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Registriert einen Hook, der beim ersten `stop()` läuft
    ///
    /// Capture Provider geben hierüber das Gerät frei.
    pub fn with_stop_hook<F>(self, hook: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        *self.inner.on_stop.lock() = Some(Box::new(hook));
        self
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// `true` solange der Track nicht gestoppt wurde
    pub fn is_live(&self) -> bool {
        !self.inner.stopped.load(Ordering::Acquire)
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    /// Aktiviert/deaktiviert den Track ohne ihn freizugeben (Mute)
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::Release);
    }

    /// Stoppt den Track. Gibt `true` zurück, wenn er vorher lief.
    pub fn stop(&self) -> bool {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return false;
        }

        self.inner.sinks.lock().clear();
        if let Some(hook) = self.inner.on_stop.lock().take() {
            hook();
        }
        tracing::trace!("Track {} ({:?}) stopped", self.inner.id, self.inner.kind);
        true
    }

    /// Hängt einen Empfänger für die Samples dieses Tracks an
    ///
    /// Transports lesen daraus und schreiben in ihren RTP-Track. Wird der
    /// Receiver gedroppt, fällt der Empfänger beim nächsten Sample weg. Auf
    /// einem gestoppten Track endet der Receiver sofort.
    pub fn attach_sink(&self) -> mpsc::Receiver<MediaSample> {
        let (tx, rx) = mpsc::channel(SAMPLE_BUFFER);
        let mut sinks = self.inner.sinks.lock();
        if self.is_live() {
            sinks.push(tx);
        }
        rx
    }

    /// Verteilt ein Sample an alle angehängten Transports
    ///
    /// Gestoppte und stummgeschaltete Tracks verwerfen das Sample. Gibt die
    /// Anzahl der Empfänger zurück.
    pub fn write_sample(&self, sample: MediaSample) -> usize {
        if !self.is_live() || !self.is_enabled() {
            return 0;
        }

        let mut sinks = self.inner.sinks.lock();
        sinks.retain(|tx| !tx.is_closed());

        let mut delivered = 0;
        for tx in sinks.iter() {
            match tx.try_send(sample.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::trace!("Sink full, sample dropped on track {}", self.inner.id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        delivered
    }
}

impl std::fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("live", &self.is_live())
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

// ============================================================================
// MEDIA HANDLE
// ============================================================================

/// Besitz-Wrapper um ein Capture-Ergebnis oder einen Remote-Stream
#[derive(Clone)]
pub struct MediaHandle {
    id: String,
    tracks: Arc<RwLock<Vec<MediaTrack>>>,
}

impl MediaHandle {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), tracks)
    }

    pub fn with_id(id: impl Into<String>, tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: id.into(),
            tracks: Arc::new(RwLock::new(tracks)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Snapshot aller Tracks
    pub fn tracks(&self) -> Vec<MediaTrack> {
        self.tracks.read().clone()
    }

    pub fn tracks_of(&self, kind: TrackKind) -> Vec<MediaTrack> {
        self.tracks
            .read()
            .iter()
            .filter(|t| t.kind() == kind)
            .cloned()
            .collect()
    }

    pub fn has_kind(&self, kind: TrackKind) -> bool {
        self.tracks.read().iter().any(|t| t.kind() == kind)
    }

    /// Fügt einen Track hinzu (Remote-Tracks kommen einzeln an)
    pub fn add_track(&self, track: MediaTrack) {
        let mut tracks = self.tracks.write();
        if tracks.iter().all(|t| t.id() != track.id()) {
            tracks.push(track);
        }
    }

    /// Entfernt und stoppt alle Tracks einer Art
    pub fn remove_kind(&self, kind: TrackKind) {
        let mut tracks = self.tracks.write();
        tracks.retain(|t| {
            if t.kind() == kind {
                t.stop();
                false
            } else {
                true
            }
        });
    }

    /// Anzahl noch laufender Tracks
    pub fn live_track_count(&self) -> usize {
        self.tracks.read().iter().filter(|t| t.is_live()).count()
    }

    pub fn is_live(&self) -> bool {
        self.live_track_count() > 0
    }

    /// Stoppt alle Tracks. Gibt die Anzahl der tatsächlich gestoppten zurück.
    pub fn stop(&self) -> usize {
        self.tracks.read().iter().filter(|t| t.stop()).count()
    }

    /// `true` wenn beide Handles dieselben Tracks teilen
    pub fn same_as(&self, other: &MediaHandle) -> bool {
        Arc::ptr_eq(&self.tracks, &other.tracks)
    }
}

impl std::fmt::Debug for MediaHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaHandle")
            .field("id", &self.id)
            .field("tracks", &*self.tracks.read())
            .finish()
    }
}
