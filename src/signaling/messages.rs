//! Message Types für das Signaling-Protokoll
//!
//! `SignalingEvent` ist die geschlossene Menge der Nachrichten zwischen
//! zwei Teilnehmern. Ungültige Nachrichten scheitern genau einmal, beim
//! Deserialisieren an der Transport-Grenze.

use crate::call_engine::{CallId, CallMedia, CallState, EndReason};
use chrono::Utc;
use serde::{Deserialize, Serialize};

// ============================================================================
// CHANNELS
// ============================================================================

/// Kanal für alle Events eines Anrufs
pub fn call_channel(call_id: &CallId) -> String {
    format!("call:{}", call_id)
}

/// Posteingang eines Benutzers (nur für `call.request`)
pub fn inbox_channel(user_id: &str) -> String {
    format!("user:{}", user_id)
}

// ============================================================================
// PAYLOADS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// SDP Session Description wie im Browser (`{type, sdp}`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE Candidate wie `RTCIceCandidateInit`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

fn default_reject_reason() -> EndReason {
    EndReason::UserReject
}

fn default_hangup_reason() -> EndReason {
    EndReason::UserEnd
}

// ============================================================================
// SIGNALING EVENT
// ============================================================================

/// Alle Event-Varianten, getaggt über das `type` Feld
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventKind {
    #[serde(rename = "call.request")]
    Request {
        #[serde(default)]
        media: CallMedia,
    },

    #[serde(rename = "call.ringing")]
    Ringing,

    #[serde(rename = "call.accept")]
    Accept {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<SessionDescription>,
    },

    #[serde(rename = "call.reject")]
    Reject {
        #[serde(default = "default_reject_reason")]
        reason: EndReason,
    },

    #[serde(rename = "call.hangup")]
    Hangup {
        #[serde(default = "default_hangup_reason")]
        reason: EndReason,
    },

    #[serde(rename = "call.ice")]
    Ice { payload: IceCandidate },

    #[serde(rename = "call.sdp")]
    Sdp { payload: SessionDescription },

    #[serde(rename = "call.status")]
    Status { state: CallState },
}

impl EventKind {
    /// Name des Events auf dem Draht
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Request { .. } => "call.request",
            EventKind::Ringing => "call.ringing",
            EventKind::Accept { .. } => "call.accept",
            EventKind::Reject { .. } => "call.reject",
            EventKind::Hangup { .. } => "call.hangup",
            EventKind::Ice { .. } => "call.ice",
            EventKind::Sdp { .. } => "call.sdp",
            EventKind::Status { .. } => "call.status",
        }
    }
}

/// Ein unveränderliches Signaling-Event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalingEvent {
    #[serde(flatten)]
    pub kind: EventKind,
    #[serde(rename = "callId")]
    pub call_id: CallId,
    pub from: String,
    pub to: String,
    pub timestamp: i64,
}

impl SignalingEvent {
    /// Erstellt ein Event mit aktuellem Timestamp
    pub fn new(
        kind: EventKind,
        call_id: CallId,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            call_id,
            from: from.into(),
            to: to.into(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// Parst und validiert ein Event aus JSON
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Parst ein bereits dekodiertes JSON-Objekt
    pub fn from_value(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Kanal, auf dem dieses Event veröffentlicht wird
    pub fn channel(&self) -> String {
        match self.kind {
            EventKind::Request { .. } => inbox_channel(&self.to),
            _ => call_channel(&self.call_id),
        }
    }
}

// ============================================================================
// RELAY FRAMES
// ============================================================================

/// Client → Relay
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientFrame<'a> {
    Subscribe {
        channel: &'a str,
    },
    Unsubscribe {
        channel: &'a str,
    },
    Publish {
        channel: &'a str,
        event: &'a SignalingEvent,
    },
    Heartbeat {
        #[serde(rename = "userId")]
        user_id: &'a str,
    },
}

/// Relay → Client
///
/// Das Event bleibt zunächst rohes JSON, damit ein einzelnes kaputtes Event
/// nicht den ganzen Frame verwirft.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RelayFrame {
    Event {
        channel: String,
        event: serde_json::Value,
    },
    Error {
        code: i32,
        message: String,
    },
    Pong,
}

// ============================================================================
// TESTS
// ============================================================================
