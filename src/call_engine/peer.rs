//! Peer Connection Vertrag
//!
//! Die WebRTC-Engine ist eine Black Box mit Offer/Answer/ICE-Primitiven.
//! Callbacks der Engine kommen als `PeerEvent` über einen Channel zurück.

use super::media::LocalMedia;
use super::state::CallId;
use crate::signaling::{IceCandidate, SdpType, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum PeerError {
    #[error("WebRTC error: {0}")]
    WebRTC(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("Peer connection is closed")]
    Closed,
}

// ============================================================================
// STATES
// ============================================================================

/// Verbindungszustand der Engine (wie `RTCPeerConnectionState`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// Eine Verbindung in diesem Zustand darf nicht wiederverwendet werden
    pub fn is_dead(self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }
}

/// Explizite Offer/Answer-Unterzustandsmaschine
///
/// `NoOffer → HaveLocalOffer → Stable` auf der Caller-Seite,
/// `NoOffer → HaveRemoteOffer → Stable` auf der Callee-Seite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    NoOffer,
    HaveLocalOffer,
    HaveRemoteOffer,
    Stable,
    Closed,
}

impl NegotiationState {
    /// Übergang nach erfolgreichem `set_local_description`
    pub fn after_local(self, sdp_type: SdpType) -> Option<Self> {
        match (self, sdp_type) {
            (NegotiationState::NoOffer | NegotiationState::Stable, SdpType::Offer) => {
                Some(NegotiationState::HaveLocalOffer)
            }
            (NegotiationState::HaveRemoteOffer, SdpType::Answer) => Some(NegotiationState::Stable),
            _ => None,
        }
    }

    /// Übergang nach erfolgreichem `set_remote_description`
    pub fn after_remote(self, sdp_type: SdpType) -> Option<Self> {
        match (self, sdp_type) {
            (NegotiationState::NoOffer | NegotiationState::Stable, SdpType::Offer) => {
                Some(NegotiationState::HaveRemoteOffer)
            }
            (NegotiationState::HaveLocalOffer, SdpType::Answer) => Some(NegotiationState::Stable),
            _ => None,
        }
    }
}

/// Callbacks der Engine
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// Lokaler ICE Candidate, muss als `call.ice` veröffentlicht werden
    LocalCandidate {
        call_id: CallId,
        candidate: IceCandidate,
    },
    /// Eingehender Media-Track
    Track { call_id: CallId, kind: String },
    /// Änderung des Verbindungszustands
    ConnectionState {
        call_id: CallId,
        state: ConnectionState,
    },
}

// ============================================================================
// CONTRACT
// ============================================================================

/// Eine zugrundeliegende Peer Connection
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_local_media(&self, media: &LocalMedia) -> Result<(), PeerError>;

    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;

    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;

    fn connection_state(&self) -> ConnectionState;

    /// Stoppt alle Sender/Receiver-Tracks und schließt die Verbindung.
    /// Muss auch auf bereits geschlossenen Verbindungen funktionieren.
    async fn close(&self) -> Result<(), PeerError>;
}

/// Erzeugt Peer Connections und verdrahtet ihre Callbacks
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        call_id: &CallId,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, PeerError>;
}
