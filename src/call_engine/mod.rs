//! Call Engine Module - Anrufzustand und WebRTC
//!
//! Dieses Modul verwaltet:
//! - Call Session Registry (Zustandsmaschine pro Anruf)
//! - Busy-Arbitrierung und Ring-Timeouts
//! - Peer Connection Adapter (Offer/Answer/ICE)
//! - Lokale Medien (Opus/VP8 Tracks)

mod adapter;
mod busy;
mod media;
mod peer;
mod registry;
mod state;
mod timeout;
mod webrtc_peer;

pub use adapter::{
    AdapterError, AnswerOutcome, ConnectionAction, PeerConnectionAdapter, SessionState,
};
pub use busy::is_busy;
pub use media::{
    LocalMedia, MediaDevices, MediaError, MediaKind, TrackMediaDevices, CHANNELS, SAMPLE_RATE,
};
pub use peer::{
    ConnectionState, NegotiationState, PeerConnection, PeerConnectionFactory, PeerError,
    PeerEvent,
};
pub use registry::{CallRegistry, Effect, Outcome, DEFAULT_TOMBSTONE_CAPACITY};
pub use state::{CallId, CallMedia, CallState, CallStatus, EndReason, LocalCallState, Role};
pub use timeout::{Expired, TimeoutSupervisor, DEFAULT_RING_TIMEOUT};
pub use webrtc_peer::{default_ice_servers, WebRtcPeer, WebRtcPeerFactory};
