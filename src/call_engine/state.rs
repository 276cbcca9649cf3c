//! Call State Typen
//!
//! Lokaler Zustand eines Anrufs, wie ihn die Registry verwaltet.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// CALL ID
// ============================================================================

/// Feste Identität eines Anrufversuchs (wird nie wiederverwendet)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    /// Erzeugt eine neue, zufällige Call-ID
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for CallId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

// ============================================================================
// CALL STATE
// ============================================================================

/// Lebenszyklus eines Anrufs: `idle → ringing → in_call → ended`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Idle,
    Ringing,
    InCall,
    Ended,
}

impl CallState {
    /// Zählt für die "ein aktiver Anruf"-Regel
    pub fn is_active(self) -> bool {
        matches!(self, CallState::Ringing | CallState::InCall)
    }

    pub fn is_terminal(self) -> bool {
        self == CallState::Ended
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CallState::Idle => "idle",
            CallState::Ringing => "ringing",
            CallState::InCall => "in_call",
            CallState::Ended => "ended",
        };
        f.write_str(s)
    }
}

/// Rolle des lokalen Teilnehmers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Caller,
    Callee,
}

/// Art des Anrufs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallMedia {
    Text,
    #[default]
    Audio,
    Video,
}

impl CallMedia {
    /// Text-Anrufe brauchen keine Peer Connection
    pub fn needs_peer_connection(self) -> bool {
        self != CallMedia::Text
    }
}

/// Grund für das Ende eines Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Busy,
    UserReject,
    Timeout,
    Error,
    UserEnd,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EndReason::Busy => "busy",
            EndReason::UserReject => "user_reject",
            EndReason::Timeout => "timeout",
            EndReason::Error => "error",
            EndReason::UserEnd => "user_end",
        };
        f.write_str(s)
    }
}

/// Status für den Persistenz-Kollaborateur
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Pending,
    Answered,
    Missed,
    Ended,
}

impl CallStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CallStatus::Pending => "pending",
            CallStatus::Answered => "answered",
            CallStatus::Missed => "missed",
            CallStatus::Ended => "ended",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(CallStatus::Pending),
            "answered" => Some(CallStatus::Answered),
            "missed" => Some(CallStatus::Missed),
            "ended" => Some(CallStatus::Ended),
            _ => None,
        }
    }
}

// ============================================================================
// LOCAL CALL STATE
// ============================================================================

/// Eintrag der Registry für genau einen Anruf
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalCallState {
    pub call_id: CallId,
    pub state: CallState,
    pub from: String,
    pub to: String,
    pub role: Role,
    pub media: CallMedia,
    /// Millisekunden seit Epoch
    pub created_at: i64,
    pub ended_reason: Option<EndReason>,
    /// Deadline beim Timeout Supervisor aktiv
    #[serde(skip)]
    pub timeout_armed: bool,
}

impl LocalCallState {
    /// Die jeweils andere Seite des Anrufs
    pub fn remote(&self) -> &str {
        match self.role {
            Role::Caller => &self.to,
            Role::Callee => &self.from,
        }
    }
}
