//! Media Capture Manager - Kamera/Mikrofon-Zugriff
//!
//! Der eigentliche Gerätezugriff läuft über einen `CaptureProvider`
//! (Browser, natives Capture-Backend oder Test-Fake).

use super::handle::{MediaHandle, TrackKind};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("Permission to access camera or microphone was denied")]
    PermissionDenied,

    #[error("Capture device is busy")]
    DeviceBusy,

    #[error("No capture device found: {0}")]
    NoDevice(String),

    #[error("Capture failed: {0}")]
    Platform(String),
}

// ============================================================================
// PROVIDER
// ============================================================================

/// Welche Geräte angefordert werden
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub video: bool,
    pub audio: bool,
}

/// Plattform-Schnittstelle für `getUserMedia`
#[async_trait]
pub trait CaptureProvider: Send + Sync {
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<MediaHandle, CaptureError>;
}

/// Events die vom MediaCaptureManager ausgelöst werden
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    /// Kamera (und ggf. Mikrofon) wurde erfolgreich geöffnet
    Acquired { stream_id: String, audio: bool },
    /// Alle Tracks eines Streams wurden gestoppt
    Released { stream_id: String },
}

pub type CaptureListener = Arc<dyn Fn(CaptureEvent) + Send + Sync>;

// ============================================================================
// CAPTURE MANAGER
// ============================================================================

/// Öffnet und schließt lokale Media-Streams
pub struct MediaCaptureManager {
    provider: Arc<dyn CaptureProvider>,
    listener: Option<CaptureListener>,
}

impl MediaCaptureManager {
    pub fn new(provider: Arc<dyn CaptureProvider>) -> Self {
        Self {
            provider,
            listener: None,
        }
    }

    /// Setzt den Listener für Capture-Events
    pub fn with_listener(mut self, listener: CaptureListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Öffnet die Kamera, mit Mikrofon falls `want_audio`
    ///
    /// Bei einem Fehler bleibt nichts geöffnet: ein unvollständiges
    /// Ergebnis des Providers wird hier wieder gestoppt.
    pub async fn acquire(&self, want_audio: bool) -> Result<MediaHandle, CaptureError> {
        let constraints = MediaConstraints {
            video: true,
            audio: want_audio,
        };

        tracing::debug!("Requesting user media: {:?}", constraints);

        let handle = match self.provider.get_user_media(constraints).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!("Capture request failed: {}", e);
                return Err(e);
            }
        };

        if !handle.has_kind(TrackKind::Video) {
            handle.stop();
            tracing::warn!("Capture returned no video track");
            return Err(CaptureError::NoDevice("camera".to_string()));
        }

        if want_audio && !handle.has_kind(TrackKind::Audio) {
            handle.stop();
            tracing::warn!("Capture returned no audio track");
            return Err(CaptureError::NoDevice("microphone".to_string()));
        }

        if !want_audio && handle.has_kind(TrackKind::Audio) {
            // Observer senden nie Audio
            handle.remove_kind(TrackKind::Audio);
        }

        tracing::info!(
            "Local media acquired: {} ({} track(s))",
            handle.id(),
            handle.live_track_count()
        );

        self.emit(CaptureEvent::Acquired {
            stream_id: handle.id().to_string(),
            audio: want_audio,
        });

        Ok(handle)
    }

    /// Stoppt alle Tracks des Handles; mehrfacher Aufruf ist ein No-Op
    pub fn release(&self, handle: &MediaHandle) {
        let stopped = handle.stop();
        if stopped == 0 {
            tracing::trace!("Release of {} was a no-op", handle.id());
            return;
        }

        tracing::info!("Local media released: {} ({} track(s))", handle.id(), stopped);
        self.emit(CaptureEvent::Released {
            stream_id: handle.id().to_string(),
        });
    }

    fn emit(&self, event: CaptureEvent) {
        if let Some(listener) = &self.listener {
            listener(event);
        }
    }
}

impl std::fmt::Debug for MediaCaptureManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaCaptureManager")
            .field("has_listener", &self.listener.is_some())
            .finish()
    }
}
