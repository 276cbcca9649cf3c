//! Call Session Registry
//!
//! Einzige Wahrheit über den Lebenszyklus der Anrufe eines Teilnehmers.
//! Die Registry ist rein: jede Operation verändert die Tabelle und gibt die
//! daraus folgenden Seiteneffekte (`Effect`) zurück. Timer, Peer Connections
//! und Persistenz führt der `CallAgent` aus.

use super::busy;
use super::state::*;
use crate::signaling::{EventKind, SignalingEvent};
use chrono::Utc;
use std::collections::{HashMap, HashSet, VecDeque};

// ============================================================================
// EFFECTS
// ============================================================================

/// Seiteneffekt eines Übergangs
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Genau ein Mal pro tatsächlichem Übergang
    StateChanged {
        call_id: CallId,
        previous: CallState,
        state: CallState,
        reason: Option<EndReason>,
    },
    /// Neuer eingehender Anruf für Benachrichtigungen
    Incoming(LocalCallState),
    ArmTimeout(CallId),
    CancelTimeout(CallId),
    TeardownConnection(CallId),
    ScheduleRemoval(CallId),
    Persist { call_id: CallId, status: CallStatus },
}

/// Ergebnis von `handle_signaling_event`
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Outcome {
    /// Antwort, die der Aufrufer veröffentlichen soll (z.B. busy-Reject)
    pub reply: Option<SignalingEvent>,
    pub effects: Vec<Effect>,
}

impl Outcome {
    fn effects(effects: Vec<Effect>) -> Self {
        Self {
            reply: None,
            effects,
        }
    }
}

// ============================================================================
// TOMBSTONES
// ============================================================================

/// Beendete Call-IDs, damit späte Events sie nicht wiederbeleben
#[derive(Debug)]
struct Tombstones {
    ids: HashSet<CallId>,
    order: VecDeque<CallId>,
    capacity: usize,
}

impl Tombstones {
    fn new(capacity: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn insert(&mut self, call_id: CallId) {
        if !self.ids.insert(call_id.clone()) {
            return;
        }
        self.order.push_back(call_id);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    fn contains(&self, call_id: &CallId) -> bool {
        self.ids.contains(call_id)
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

pub const DEFAULT_TOMBSTONE_CAPACITY: usize = 1024;

/// Zustandsmaschine aller Anrufe eines lokalen Teilnehmers
#[derive(Debug)]
pub struct CallRegistry {
    local_user: String,
    calls: HashMap<CallId, LocalCallState>,
    active: Option<CallId>,
    tombstones: Tombstones,
}

impl CallRegistry {
    pub fn new(local_user: impl Into<String>) -> Self {
        Self::with_tombstone_capacity(local_user, DEFAULT_TOMBSTONE_CAPACITY)
    }

    pub fn with_tombstone_capacity(local_user: impl Into<String>, capacity: usize) -> Self {
        Self {
            local_user: local_user.into(),
            calls: HashMap::new(),
            active: None,
            tombstones: Tombstones::new(capacity),
        }
    }

    pub fn local_user(&self) -> &str {
        &self.local_user
    }

    pub fn get(&self, call_id: &CallId) -> Option<&LocalCallState> {
        self.calls.get(call_id)
    }

    /// Der Anruf im "aktiven" Slot, falls vorhanden
    pub fn active_call(&self) -> Option<&LocalCallState> {
        self.active.as_ref().and_then(|id| self.calls.get(id))
    }

    /// Alle Einträge in `ringing` oder `in_call`
    pub fn active_calls(&self) -> Vec<LocalCallState> {
        let mut calls: Vec<LocalCallState> = self
            .calls
            .values()
            .filter(|entry| entry.state.is_active())
            .cloned()
            .collect();
        calls.sort_by_key(|entry| entry.created_at);
        calls
    }

    pub fn is_busy(&self) -> bool {
        busy::is_busy(self.calls.values())
    }

    /// Wurde die Call-ID bereits beendet?
    pub fn is_ended(&self, call_id: &CallId) -> bool {
        self.tombstones.contains(call_id)
    }

    /// Startet einen ausgehenden Anruf (Caller-Seite)
    ///
    /// Idempotent: ist die Call-ID schon bekannt, wird der bestehende Eintrag
    /// zurückgegeben.
    pub fn create_call(
        &mut self,
        call_id: CallId,
        to: impl Into<String>,
        media: CallMedia,
    ) -> (LocalCallState, Vec<Effect>) {
        if let Some(existing) = self.calls.get(&call_id) {
            tracing::warn!("Call {} already tracked, not creating it again", call_id);
            return (existing.clone(), Vec::new());
        }

        let entry = LocalCallState {
            call_id: call_id.clone(),
            state: CallState::Ringing,
            from: self.local_user.clone(),
            to: to.into(),
            role: Role::Caller,
            media,
            created_at: Utc::now().timestamp_millis(),
            ended_reason: None,
            timeout_armed: true,
        };

        tracing::info!("Created outgoing call {} to {}", call_id, entry.to);

        self.calls.insert(call_id.clone(), entry.clone());
        self.active = Some(call_id.clone());

        let effects = vec![
            Effect::StateChanged {
                call_id: call_id.clone(),
                previous: CallState::Idle,
                state: CallState::Ringing,
                reason: None,
            },
            Effect::ArmTimeout(call_id.clone()),
            Effect::Persist {
                call_id,
                status: CallStatus::Pending,
            },
        ];

        (entry, effects)
    }

    /// Wie `create_call`, aber nur wenn kein anderer Anruf aktiv ist.
    ///
    /// Prüfung und Eintrag passieren unter derselben `&mut self`-Ausleihe,
    /// ein gleichzeitig eintreffender `call.request` sieht also schon den
    /// belegten Slot.
    pub fn try_create_call(
        &mut self,
        call_id: CallId,
        to: impl Into<String>,
        media: CallMedia,
    ) -> Option<(LocalCallState, Vec<Effect>)> {
        if self.is_busy() && !self.calls.contains_key(&call_id) {
            tracing::info!("Busy, not starting call {}", call_id);
            return None;
        }
        Some(self.create_call(call_id, to, media))
    }

    /// Zentrale Dispatch-Funktion für eingehende Events
    pub fn handle_signaling_event(&mut self, event: &SignalingEvent) -> Outcome {
        if !self.is_addressed_to_me(event) {
            tracing::trace!(
                "Dropping {} for {} (not addressed to {})",
                event.kind.name(),
                event.call_id,
                self.local_user
            );
            return Outcome::default();
        }

        match &event.kind {
            EventKind::Request { media } => self.on_request(event, *media),
            EventKind::Accept { .. } => self.on_accept(event),
            EventKind::Reject { reason } | EventKind::Hangup { reason } => {
                if self.calls.contains_key(&event.call_id) {
                    Outcome::effects(self.cleanup_call(&event.call_id, *reason))
                } else {
                    Outcome::default()
                }
            }
            EventKind::Status { state } => self.on_status(event, *state),
            // Verhandlung ist Sache des Peer Connection Adapters
            EventKind::Ringing | EventKind::Ice { .. } | EventKind::Sdp { .. } => {
                Outcome::default()
            }
        }
    }

    /// Interner Übergang; no-op wenn der Zustand schon `new_state` ist
    pub fn update_call_state(&mut self, call_id: &CallId, new_state: CallState) -> Vec<Effect> {
        let Some(entry) = self.calls.get_mut(call_id) else {
            return Vec::new();
        };

        if entry.state == new_state {
            return Vec::new();
        }

        if entry.state.is_terminal() {
            tracing::warn!(
                "Ignoring transition of ended call {} to {}",
                call_id,
                new_state
            );
            return Vec::new();
        }

        match new_state {
            CallState::Idle => {
                tracing::warn!("Call {} cannot re-enter idle", call_id);
                return Vec::new();
            }
            CallState::Ended => {
                let reason = entry.ended_reason.unwrap_or(EndReason::UserEnd);
                return self.cleanup_call(call_id, reason);
            }
            CallState::Ringing | CallState::InCall => {}
        }

        let previous = entry.state;
        let mut effects = Vec::new();

        if previous == CallState::Ringing && entry.timeout_armed {
            entry.timeout_armed = false;
            effects.push(Effect::CancelTimeout(call_id.clone()));
        }

        entry.state = new_state;

        if new_state == CallState::Ringing {
            entry.timeout_armed = true;
            effects.push(Effect::ArmTimeout(call_id.clone()));
        }

        tracing::info!("Call {}: {} -> {}", call_id, previous, new_state);

        self.active = Some(call_id.clone());

        effects.push(Effect::StateChanged {
            call_id: call_id.clone(),
            previous,
            state: new_state,
            reason: None,
        });

        if new_state == CallState::InCall {
            effects.push(Effect::Persist {
                call_id: call_id.clone(),
                status: CallStatus::Answered,
            });
        }

        effects
    }

    /// Gibt alle Ressourcen frei und markiert den Anruf als `ended`
    ///
    /// Idempotent: ein zweiter Aufruf erzeugt keine Effekte.
    pub fn cleanup_call(&mut self, call_id: &CallId, reason: EndReason) -> Vec<Effect> {
        let Some(entry) = self.calls.get_mut(call_id) else {
            return Vec::new();
        };

        if entry.state.is_terminal() {
            tracing::debug!("Call {} already ended", call_id);
            return Vec::new();
        }

        let mut effects = Vec::new();

        if entry.timeout_armed {
            entry.timeout_armed = false;
            effects.push(Effect::CancelTimeout(call_id.clone()));
        }

        // Teardown läuft vor der Meldung `ended` an Beobachter
        effects.push(Effect::TeardownConnection(call_id.clone()));

        let previous = entry.state;
        entry.state = CallState::Ended;
        entry.ended_reason = Some(reason);

        tracing::info!("Call {} ended ({})", call_id, reason);

        if self.active.as_ref() == Some(call_id) {
            self.active = None;
        }
        self.tombstones.insert(call_id.clone());

        let status = match reason {
            EndReason::Timeout => CallStatus::Missed,
            _ => CallStatus::Ended,
        };

        effects.push(Effect::StateChanged {
            call_id: call_id.clone(),
            previous,
            state: CallState::Ended,
            reason: Some(reason),
        });
        effects.push(Effect::ScheduleRemoval(call_id.clone()));
        effects.push(Effect::Persist {
            call_id: call_id.clone(),
            status,
        });

        effects
    }

    /// Entfernt einen beendeten Eintrag nach der Gnadenfrist
    pub fn purge(&mut self, call_id: &CallId) -> bool {
        match self.calls.get(call_id) {
            Some(entry) if entry.state.is_terminal() => {
                self.calls.remove(call_id);
                tracing::debug!("Purged call {}", call_id);
                true
            }
            _ => false,
        }
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    /// Caller verarbeitet nur `to == self`, Callee `from == self || to == self`
    fn is_addressed_to_me(&self, event: &SignalingEvent) -> bool {
        match self.calls.get(&event.call_id).map(|entry| entry.role) {
            Some(Role::Caller) => event.to == self.local_user,
            _ => event.from == self.local_user || event.to == self.local_user,
        }
    }

    fn on_request(&mut self, event: &SignalingEvent, media: CallMedia) -> Outcome {
        if event.to != self.local_user {
            return Outcome::default();
        }

        if self.calls.contains_key(&event.call_id) {
            tracing::debug!("Duplicate request for call {}", event.call_id);
            return Outcome::default();
        }

        if self.tombstones.contains(&event.call_id) {
            tracing::debug!("Request for already ended call {}", event.call_id);
            return Outcome::default();
        }

        if self.is_busy() {
            tracing::info!(
                "Busy, auto-rejecting call {} from {}",
                event.call_id,
                event.from
            );
            let reply = SignalingEvent::new(
                EventKind::Reject {
                    reason: EndReason::Busy,
                },
                event.call_id.clone(),
                self.local_user.clone(),
                event.from.clone(),
            );
            return Outcome {
                reply: Some(reply),
                effects: Vec::new(),
            };
        }

        let entry = LocalCallState {
            call_id: event.call_id.clone(),
            state: CallState::Ringing,
            from: event.from.clone(),
            to: self.local_user.clone(),
            role: Role::Callee,
            media,
            created_at: Utc::now().timestamp_millis(),
            ended_reason: None,
            timeout_armed: true,
        };

        tracing::info!("Incoming {:?} call {} from {}", media, event.call_id, event.from);

        self.calls.insert(event.call_id.clone(), entry.clone());
        self.active = Some(event.call_id.clone());

        Outcome::effects(vec![
            Effect::StateChanged {
                call_id: event.call_id.clone(),
                previous: CallState::Idle,
                state: CallState::Ringing,
                reason: None,
            },
            Effect::Incoming(entry),
            Effect::ArmTimeout(event.call_id.clone()),
            Effect::Persist {
                call_id: event.call_id.clone(),
                status: CallStatus::Pending,
            },
        ])
    }

    fn on_accept(&mut self, event: &SignalingEvent) -> Outcome {
        if self.tombstones.contains(&event.call_id) {
            tracing::debug!("Accept for already ended call {}", event.call_id);
            return Outcome::default();
        }

        match self.calls.get(&event.call_id).map(|entry| entry.state) {
            None => self.heal_missing_call(event),
            Some(CallState::InCall) => {
                tracing::debug!("Duplicate accept for call {}", event.call_id);
                Outcome::default()
            }
            Some(_) => Outcome::effects(self.update_call_state(&event.call_id, CallState::InCall)),
        }
    }

    /// `request`/`ringing` ging verloren: minimalen `in_call` Eintrag anlegen
    fn heal_missing_call(&mut self, event: &SignalingEvent) -> Outcome {
        if self.is_busy() {
            tracing::warn!(
                "Accept for unknown call {} while another call is active",
                event.call_id
            );
            return Outcome::default();
        }

        let (role, from, to) = if event.to == self.local_user {
            (Role::Caller, self.local_user.clone(), event.from.clone())
        } else {
            (Role::Callee, event.to.clone(), self.local_user.clone())
        };

        let entry = LocalCallState {
            call_id: event.call_id.clone(),
            state: CallState::InCall,
            from,
            to,
            role,
            media: CallMedia::default(),
            created_at: Utc::now().timestamp_millis(),
            ended_reason: None,
            timeout_armed: false,
        };

        tracing::info!("Recovered call {} directly in in_call", event.call_id);

        self.calls.insert(event.call_id.clone(), entry);
        self.active = Some(event.call_id.clone());

        Outcome::effects(vec![
            Effect::StateChanged {
                call_id: event.call_id.clone(),
                previous: CallState::Idle,
                state: CallState::InCall,
                reason: None,
            },
            Effect::Persist {
                call_id: event.call_id.clone(),
                status: CallStatus::Answered,
            },
        ])
    }

    fn on_status(&mut self, event: &SignalingEvent, declared: CallState) -> Outcome {
        let Some(entry) = self.calls.get(&event.call_id) else {
            return Outcome::default();
        };

        if declared == CallState::Ended {
            let reason = entry.ended_reason.unwrap_or(EndReason::UserEnd);
            return Outcome::effects(self.cleanup_call(&event.call_id, reason));
        }

        if declared != entry.state {
            return Outcome::effects(self.update_call_state(&event.call_id, declared));
        }

        Outcome::default()
    }
}

// ============================================================================
// TESTS
// ============================================================================
