//! Lokale Medien
//!
//! Vertrag für `acquireLocalMedia(kind)` und eine Implementierung, die
//! lokale WebRTC-Tracks (Opus, VP8) erzeugt. Die Geräteanbindung selbst
//! liegt außerhalb des Cores.

use super::state::CallMedia;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate (48kHz ist der Standard für Opus)
pub const SAMPLE_RATE: u32 = 48000;

/// Channels (Mono für Voice)
pub const CHANNELS: u16 = 1;

/// RTP Clock Rate für Video
const VIDEO_CLOCK_RATE: u32 = 90000;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum MediaError {
    #[error("Permission to use media devices was denied")]
    PermissionDenied,

    #[error("No media device found for {0:?}")]
    NoDevice(MediaKind),

    #[error("Text calls have no local media")]
    NotRequired,
}

/// Angeforderte Medienart
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    AudioVideo,
}

impl MediaKind {
    pub fn for_call(media: CallMedia) -> Result<Self, MediaError> {
        match media {
            CallMedia::Text => Err(MediaError::NotRequired),
            CallMedia::Audio => Ok(MediaKind::Audio),
            CallMedia::Video => Ok(MediaKind::AudioVideo),
        }
    }
}

// ============================================================================
// LOCAL MEDIA
// ============================================================================

/// Lokaler Stream: eine Menge Tracks, die gemeinsam gestoppt werden
pub struct LocalMedia {
    kind: MediaKind,
    tracks: Mutex<Vec<Arc<TrackLocalStaticSample>>>,
    stopped: Arc<AtomicBool>,
}

impl LocalMedia {
    pub fn new(kind: MediaKind, tracks: Vec<Arc<TrackLocalStaticSample>>) -> Self {
        Self {
            kind,
            tracks: Mutex::new(tracks),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn tracks(&self) -> Vec<Arc<TrackLocalStaticSample>> {
        self.tracks.lock().clone()
    }

    /// Stoppt alle Tracks; mehrfacher Aufruf ist harmlos
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let released = std::mem::take(&mut *self.tracks.lock());
        tracing::debug!("Stopped {} local track(s)", released.len());
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stopped)
    }
}

impl std::fmt::Debug for LocalMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMedia")
            .field("kind", &self.kind)
            .field("tracks", &self.tracks.lock().len())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

// ============================================================================
// MEDIA DEVICES
// ============================================================================

/// Kollaborateur für den Zugriff auf Mikrofon/Kamera
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire_local_media(&self, kind: MediaKind) -> Result<LocalMedia, MediaError>;
}

/// Erzeugt WebRTC-Sample-Tracks, in die ein Capture-Backend schreibt
#[derive(Debug, Clone)]
pub struct TrackMediaDevices {
    stream_id: String,
}

impl TrackMediaDevices {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
        }
    }

    fn audio_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: SAMPLE_RATE,
                channels: CHANNELS,
                ..Default::default()
            },
            "audio".to_string(),
            self.stream_id.clone(),
        ))
    }

    fn video_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: VIDEO_CLOCK_RATE,
                ..Default::default()
            },
            "video".to_string(),
            self.stream_id.clone(),
        ))
    }
}

impl Default for TrackMediaDevices {
    fn default() -> Self {
        Self::new("doorbell")
    }
}

#[async_trait]
impl MediaDevices for TrackMediaDevices {
    async fn acquire_local_media(&self, kind: MediaKind) -> Result<LocalMedia, MediaError> {
        let mut tracks = vec![self.audio_track()];
        if kind == MediaKind::AudioVideo {
            tracks.push(self.video_track());
        }

        tracing::info!(
            "Local media acquired: {:?} ({}Hz, {} channel(s))",
            kind,
            SAMPLE_RATE,
            CHANNELS
        );

        Ok(LocalMedia::new(kind, tracks))
    }
}
