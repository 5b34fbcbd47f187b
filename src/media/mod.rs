//! Media Module - Lokale und entfernte Media-Streams
//!
//! Dieses Modul verwaltet:
//! - Media Handles (Besitz über Audio/Video-Tracks)
//! - Kamera/Mikrofon-Zugriff über einen austauschbaren Capture Provider
//! - Capture-Events (Kamera an/aus) für die Call Session

mod capture;
mod handle;

pub use capture::{
    CaptureError, CaptureEvent, CaptureListener, CaptureProvider, MediaCaptureManager,
    MediaConstraints,
};
pub use handle::{MediaHandle, MediaSample, MediaTrack, TrackKind};
