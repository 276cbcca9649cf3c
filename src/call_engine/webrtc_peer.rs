//! WebRTC Peer Connection
//!
//! Implementierung des `PeerConnection`-Vertrags mit dem `webrtc` Crate.

use super::media::LocalMedia;
use super::peer::{ConnectionState, PeerConnection, PeerConnectionFactory, PeerError, PeerEvent};
use super::state::CallId;
use crate::signaling::{IceCandidate, SdpType, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::TrackLocal;

// ============================================================================
// ICE SERVER CONFIGURATION
// ============================================================================

/// Standard STUN Server
pub fn default_ice_servers() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun1.l.google.com:19302".to_string(),
    ]
}

// ============================================================================
// CONVERSIONS
// ============================================================================

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    let result = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    result.map_err(|e| PeerError::InvalidSdp(e.to_string()))
}

fn from_rtc_description(desc: RTCSessionDescription) -> Result<SessionDescription, PeerError> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        other => Err(PeerError::InvalidSdp(format!(
            "unsupported description type {}",
            other
        ))),
    }
}

fn to_rtc_candidate(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}

fn from_rtc_candidate(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn from_rtc_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
    }
}

fn webrtc_error(e: webrtc::Error) -> PeerError {
    PeerError::WebRTC(e.to_string())
}

// ============================================================================
// PEER CONNECTION
// ============================================================================

/// Eine `RTCPeerConnection` hinter dem `PeerConnection`-Vertrag
pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn add_local_media(&self, media: &LocalMedia) -> Result<(), PeerError> {
        for track in media.tracks() {
            self.pc
                .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(webrtc_error)?;
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self.pc.create_offer(None).await.map_err(webrtc_error)?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self.pc.create_answer(None).await.map_err(webrtc_error)?;
        from_rtc_description(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.pc
            .set_local_description(to_rtc_description(desc)?)
            .await
            .map_err(webrtc_error)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.pc
            .set_remote_description(to_rtc_description(desc)?)
            .await
            .map_err(webrtc_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.pc
            .add_ice_candidate(to_rtc_candidate(candidate))
            .await
            .map_err(webrtc_error)
    }

    fn connection_state(&self) -> ConnectionState {
        from_rtc_state(self.pc.connection_state())
    }

    async fn close(&self) -> Result<(), PeerError> {
        for sender in self.pc.get_senders().await {
            if let Err(e) = sender.stop().await {
                tracing::debug!("Failed to stop sender: {}", e);
            }
        }
        for receiver in self.pc.get_receivers().await {
            if let Err(e) = receiver.stop().await {
                tracing::debug!("Failed to stop receiver: {}", e);
            }
        }
        self.pc.close().await.map_err(webrtc_error)
    }
}

// ============================================================================
// FACTORY
// ============================================================================

/// Baut `RTCPeerConnection`s mit Standard-Codecs und Interceptors
#[derive(Debug, Clone)]
pub struct WebRtcPeerFactory {
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcPeerFactory {
    pub fn new(ice_urls: Vec<String>) -> Self {
        let mut ice_servers = Vec::new();
        if !ice_urls.is_empty() {
            ice_servers.push(RTCIceServer {
                urls: ice_urls,
                ..Default::default()
            });
        }
        Self { ice_servers }
    }

    /// Setzt optionale TURN-Server Credentials
    pub fn with_turn_server(mut self, url: String, username: String, credential: String) -> Self {
        self.ice_servers.push(RTCIceServer {
            urls: vec![url],
            username,
            credential,
            ..Default::default()
        });
        self
    }

    /// Registriert die Engine-Callbacks als `PeerEvent`s
    fn wire_callbacks(
        pc: &Arc<RTCPeerConnection>,
        call_id: &CallId,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) {
        // Connection State Handler
        let tx = events.clone();
        let id = call_id.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            tracing::info!("Peer connection state for {}: {:?}", id, s);
            let _ = tx.send(PeerEvent::ConnectionState {
                call_id: id.clone(),
                state: from_rtc_state(s),
            });
            Box::pin(async {})
        }));

        // ICE Candidate Handler
        let tx = events.clone();
        let id = call_id.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            if let Some(c) = candidate {
                match c.to_json() {
                    Ok(init) => {
                        let _ = tx.send(PeerEvent::LocalCandidate {
                            call_id: id.clone(),
                            candidate: from_rtc_candidate(init),
                        });
                    }
                    Err(e) => tracing::warn!("Failed to serialize ICE candidate: {}", e),
                }
            }
            Box::pin(async {})
        }));

        // Track Handler (eingehende Medien)
        let tx = events;
        let id = call_id.clone();
        pc.on_track(Box::new(move |track, _, _| {
            let kind = track.kind().to_string();
            tracing::info!("Received {} track for call {}", kind, id);
            let _ = tx.send(PeerEvent::Track {
                call_id: id.clone(),
                kind,
            });
            Box::pin(async {})
        }));
    }
}

impl Default for WebRtcPeerFactory {
    fn default() -> Self {
        Self::new(default_ice_servers())
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcPeerFactory {
    async fn create(
        &self,
        call_id: &CallId,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        // Media Engine mit Standard-Codecs (Opus, VP8, ...)
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(webrtc_error)?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry =
            register_default_interceptors(registry, &mut media_engine).map_err(webrtc_error)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(webrtc_error)?,
        );

        Self::wire_callbacks(&pc, call_id, events);

        tracing::debug!("Created peer connection for call {}", call_id);

        Ok(Arc::new(WebRtcPeer { pc }))
    }
}
