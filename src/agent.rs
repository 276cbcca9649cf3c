//! Call Agent
//!
//! Verdrahtet Transport → Registry → Adapter → Transport für einen lokalen
//! Teilnehmer. Die Registry liefert reine Übergänge plus `Effect`s, der Agent
//! führt sie aus (Timer, Peer Connections, Persistenz, Beobachter).
//!
//! Eingehende Events, abgelaufene Deadlines und Engine-Callbacks laufen durch
//! eine Event-Loop, die sie an einen Worker pro Call-ID verteilt. Operationen
//! auf derselben Call-ID sind über eine Sperre pro Anruf serialisiert, auch
//! gegenüber den öffentlichen Methoden. Verhandlungsschritte, die auf Medien
//! warten (Offer, Annahme), laufen als abbrechbare Tasks.

use crate::call_engine::{
    AdapterError, CallId, CallMedia, CallRegistry, CallState, CallStatus,
    ConnectionAction, Effect, EndReason, Expired, LocalCallState, MediaDevices,
    PeerConnectionAdapter, PeerConnectionFactory, PeerEvent, Role, TimeoutSupervisor,
};
use crate::config::Config;
use crate::database::CallStatusSink;
use crate::signaling::{
    call_channel, inbox_channel, EventKind, Outbox, SdpType, SessionDescription, SignalingError,
    SignalingEvent, SignalingTransport,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, OwnedMutexGuard};
use tokio::task::{AbortHandle, JoinHandle};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Already in a call")]
    AlreadyInCall,

    #[error("Unknown call: {0}")]
    UnknownCall(CallId),

    #[error("Cannot {action} call {call_id} in state {state}")]
    InvalidState {
        call_id: CallId,
        state: CallState,
        action: &'static str,
    },

    #[error("Negotiation for call {0} was aborted")]
    Aborted(CallId),

    #[error("Peer connection error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),
}

// ============================================================================
// EVENTS
// ============================================================================

/// Events für UI/Benachrichtigungen
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    StateChanged {
        call_id: CallId,
        state: CallState,
        reason: Option<EndReason>,
    },
    /// Neuer eingehender Anruf (für Push-Benachrichtigungen)
    IncomingCall(LocalCallState),
    /// Eintrag nach der Gnadenfrist entfernt
    Removed(CallId),
    Error {
        call_id: CallId,
        message: String,
    },
}

const EVENT_CAPACITY: usize = 100;

enum Input {
    Signal(SignalingEvent),
    Expired(Expired),
    Peer(PeerEvent),
    Remove(CallId),
}

impl Input {
    fn call_id(&self) -> &CallId {
        match self {
            Input::Signal(event) => &event.call_id,
            Input::Expired(expired) => &expired.call_id,
            Input::Peer(PeerEvent::LocalCandidate { call_id, .. })
            | Input::Peer(PeerEvent::Track { call_id, .. })
            | Input::Peer(PeerEvent::ConnectionState { call_id, .. }) => call_id,
            Input::Remove(call_id) => call_id,
        }
    }
}

struct Receivers {
    signals: mpsc::UnboundedReceiver<SignalingEvent>,
    expired: mpsc::UnboundedReceiver<Expired>,
    peer: mpsc::UnboundedReceiver<PeerEvent>,
    removals: mpsc::UnboundedReceiver<CallId>,
}

// ============================================================================
// AGENT
// ============================================================================

pub struct CallAgent {
    this: Weak<CallAgent>,
    local_user: String,
    ended_grace: Duration,
    registry: Mutex<CallRegistry>,
    adapter: PeerConnectionAdapter,
    supervisor: TimeoutSupervisor,
    outbox: Outbox,
    status_sink: Arc<dyn CallStatusSink>,
    events: broadcast::Sender<CallEvent>,
    signals_tx: mpsc::UnboundedSender<SignalingEvent>,
    removals_tx: mpsc::UnboundedSender<CallId>,
    call_locks: Mutex<HashMap<CallId, Arc<tokio::sync::Mutex<()>>>>,
    /// Laufende Offer-/Annahme-Tasks pro Anruf
    negotiations: Mutex<HashMap<CallId, Vec<AbortHandle>>>,
    subscriptions: Mutex<HashMap<String, JoinHandle<()>>>,
    run_task: Mutex<Option<JoinHandle<()>>>,
}

impl CallAgent {
    /// Abonniert die eigene Inbox und startet die Event-Loop
    pub async fn start(
        config: &Config,
        transport: Arc<dyn SignalingTransport>,
        factory: Arc<dyn PeerConnectionFactory>,
        devices: Arc<dyn MediaDevices>,
        status_sink: Arc<dyn CallStatusSink>,
    ) -> Result<Arc<Self>, AgentError> {
        let outbox = Outbox::new(transport, config.user_id.clone());
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let (removals_tx, removals_rx) = mpsc::unbounded_channel();
        let (supervisor, expired_rx) = TimeoutSupervisor::new(config.ring_timeout);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let agent = Arc::new_cyclic(|this| Self {
            this: this.clone(),
            local_user: config.user_id.clone(),
            ended_grace: config.ended_grace,
            registry: Mutex::new(CallRegistry::new(config.user_id.clone())),
            adapter: PeerConnectionAdapter::new(factory, devices, outbox.clone(), peer_tx),
            supervisor,
            outbox,
            status_sink,
            events,
            signals_tx,
            removals_tx,
            call_locks: Mutex::new(HashMap::new()),
            negotiations: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            run_task: Mutex::new(None),
        });

        agent.watch(inbox_channel(&agent.local_user)).await?;

        let receivers = Receivers {
            signals: signals_rx,
            expired: expired_rx,
            peer: peer_rx,
            removals: removals_rx,
        };
        let task = tokio::spawn(run_loop(Arc::downgrade(&agent), receivers));
        *agent.run_task.lock() = Some(task);

        tracing::info!("Call agent for {} started", agent.local_user);
        Ok(agent)
    }

    pub fn local_user(&self) -> &str {
        &self.local_user
    }

    /// Event-Receiver für UI/Benachrichtigungen
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    pub fn get(&self, call_id: &CallId) -> Option<LocalCallState> {
        self.registry.lock().get(call_id).cloned()
    }

    /// Alle Anrufe in `ringing` oder `in_call`
    pub fn active_calls(&self) -> Vec<LocalCallState> {
        self.registry.lock().active_calls()
    }

    pub fn adapter(&self) -> &PeerConnectionAdapter {
        &self.adapter
    }

    // ========================================================================
    // PUBLIC API
    // ========================================================================

    /// Startet einen ausgehenden Anruf und gibt die neue Call-ID zurück
    pub async fn start_call(&self, to: &str, media: CallMedia) -> Result<CallId, AgentError> {
        let call_id = CallId::generate();

        // Slot vor dem ersten `.await` belegen
        let (entry, effects) = self
            .registry
            .lock()
            .try_create_call(call_id.clone(), to, media)
            .ok_or(AgentError::AlreadyInCall)?;

        let _guard = self.lock_call(&call_id).await;
        self.apply_effects(effects).await;

        // Vor dem Request abonnieren, damit `call.ringing` nicht verloren geht
        if let Err(e) = self.watch(call_channel(&call_id)).await {
            tracing::error!("Failed to subscribe to call {}: {}", call_id, e);
            let effects = self.registry.lock().cleanup_call(&call_id, EndReason::Error);
            self.apply_effects(effects).await;
            return Err(e.into());
        }

        if let Err(e) = self
            .outbox
            .send(EventKind::Request { media }, &call_id, to)
            .await
        {
            tracing::error!("Failed to send call request {}: {}", call_id, e);
            let effects = self.registry.lock().cleanup_call(&call_id, EndReason::Error);
            self.apply_effects(effects).await;
            return Err(e.into());
        }

        tracing::info!("Calling {} ({:?}, call {})", entry.to, media, call_id);
        Ok(call_id)
    }

    /// Nimmt einen klingelnden Anruf an
    ///
    /// Die Annahme läuft als eigener Task; Timeout oder Auflegen brechen ihn
    /// ab, auch wenn der Medienzugriff nie zurückkehrt.
    pub async fn accept(&self, call_id: &CallId) -> Result<(), AgentError> {
        let id = call_id.clone();
        let task = self.spawn_negotiation(call_id, |agent| async move {
            agent.accept_now(&id).await
        })?;

        match task.await {
            Ok(result) => result,
            Err(e) => {
                if !e.is_cancelled() {
                    tracing::error!("Accept task for {} failed: {}", call_id, e);
                }
                Err(AgentError::Aborted(call_id.clone()))
            }
        }
    }

    async fn accept_now(&self, call_id: &CallId) -> Result<(), AgentError> {
        let _guard = self.lock_call(call_id).await;
        let entry = self.expect_state(call_id, CallState::Ringing, "accept")?;
        if entry.role != Role::Callee {
            return Err(AgentError::InvalidState {
                call_id: call_id.clone(),
                state: entry.state,
                action: "accept",
            });
        }

        if entry.media.needs_peer_connection() {
            match self
                .adapter
                .accept(call_id, entry.remote(), entry.media)
                .await
            {
                Ok(()) => {}
                // Offer noch unterwegs: Anruf bleibt `ringing`, erneut versuchen
                Err(e @ AdapterError::NoPendingOffer(_)) => return Err(e.into()),
                Err(e) => {
                    self.emit_error(call_id, &e);
                    if let Err(send) = self.end_call(&entry, EndReason::Error).await {
                        tracing::warn!("Failed to send hangup for {}: {}", call_id, send);
                    }
                    return Err(e.into());
                }
            }
        }

        let effects = self
            .registry
            .lock()
            .update_call_state(call_id, CallState::InCall);
        self.apply_effects(effects).await;

        self.outbox
            .send(EventKind::Accept { payload: None }, call_id, entry.remote())
            .await?;
        Ok(())
    }

    /// Lehnt einen klingelnden Anruf ab
    pub async fn reject(&self, call_id: &CallId) -> Result<(), AgentError> {
        self.cancel_negotiation(call_id);
        let _guard = self.lock_call(call_id).await;
        let entry = self.expect_state(call_id, CallState::Ringing, "reject")?;
        if entry.role != Role::Callee {
            return Err(AgentError::InvalidState {
                call_id: call_id.clone(),
                state: entry.state,
                action: "reject",
            });
        }
        self.end_call(&entry, EndReason::UserReject)
            .await
            .map_err(AgentError::from)
    }

    /// Beendet einen Anruf (auch einen ausgehenden, der noch klingelt)
    pub async fn hangup(&self, call_id: &CallId) -> Result<(), AgentError> {
        self.cancel_negotiation(call_id);
        let _guard = self.lock_call(call_id).await;
        let entry = self.entry(call_id)?;
        if !entry.state.is_active() {
            return Err(AgentError::InvalidState {
                call_id: call_id.clone(),
                state: entry.state,
                action: "hang up",
            });
        }
        self.end_call(&entry, EndReason::UserEnd)
            .await
            .map_err(AgentError::from)
    }

    /// Veröffentlicht den lokalen Zustand als `call.status` an die Gegenseite
    pub async fn announce_status(&self, call_id: &CallId) -> Result<(), AgentError> {
        let entry = self.entry(call_id)?;
        self.outbox
            .send(
                EventKind::Status { state: entry.state },
                call_id,
                entry.remote(),
            )
            .await?;
        Ok(())
    }

    /// Verarbeitet ein Event vom Transport
    pub async fn handle_signaling_event(&self, event: SignalingEvent) {
        // Gegenseite hat beendet: hängende Verhandlung gibt die Sperre frei
        if matches!(event.kind, EventKind::Reject { .. } | EventKind::Hangup { .. })
            && event.to == self.local_user
            && event.from != self.local_user
        {
            self.cancel_negotiation(&event.call_id);
        }
        let _guard = self.lock_call(&event.call_id).await;

        let outcome = self.registry.lock().handle_signaling_event(&event);

        if let Some(reply) = &outcome.reply {
            if let Err(e) = self.outbox.publish(reply).await {
                tracing::warn!("Failed to send {} for {}: {}", reply.kind.name(), reply.call_id, e);
            }
        }
        self.apply_effects(outcome.effects).await;

        self.route_negotiation(&event).await;
    }

    // ========================================================================
    // NEGOTIATION
    // ========================================================================

    async fn route_negotiation(&self, event: &SignalingEvent) {
        if event.to != self.local_user || event.from == self.local_user {
            return;
        }
        let call_id = &event.call_id;

        // Nur laufende Anrufe verhandeln, sonst entstünden verwaiste Sessions
        let entry = self.get(call_id);
        let Some(entry) = entry.filter(|entry| !entry.state.is_terminal()) else {
            tracing::trace!("No live call {} for {}", call_id, event.kind.name());
            return;
        };

        match &event.kind {
            EventKind::Ringing => {
                if entry.role != Role::Caller
                    || entry.state != CallState::Ringing
                    || !entry.media.needs_peer_connection()
                {
                    return;
                }
                let id = call_id.clone();
                let spawned = self.spawn_negotiation(call_id, |agent| async move {
                    agent.initiate(&id).await;
                    Ok(())
                });
                if let Err(e) = spawned {
                    tracing::warn!("Cannot start negotiation for {}: {}", call_id, e);
                }
            }
            EventKind::Sdp { payload } => match payload.sdp_type {
                SdpType::Offer => {
                    self.adapter
                        .handle_offer(call_id, &event.from, payload.clone())
                        .await
                }
                SdpType::Answer => self.apply_answer(call_id, payload.clone()).await,
            },
            EventKind::Accept {
                payload: Some(payload),
            } if payload.sdp_type == SdpType::Answer => {
                self.apply_answer(call_id, payload.clone()).await
            }
            EventKind::Ice { payload } => {
                self.adapter.handle_candidate(call_id, payload.clone()).await
            }
            _ => {}
        }
    }

    /// Caller: Offer senden, sobald die Gegenseite klingelt
    async fn initiate(&self, call_id: &CallId) {
        let _guard = self.lock_call(call_id).await;
        let Ok(entry) = self.entry(call_id) else {
            return;
        };
        if entry.state != CallState::Ringing {
            return;
        }

        if let Err(e) = self.adapter.initiate(call_id, &entry.to, entry.media).await {
            self.emit_error(call_id, &e);
            if let Err(send) = self.end_call(&entry, EndReason::Error).await {
                tracing::warn!("Failed to send hangup for {}: {}", call_id, send);
            }
        }
    }

    async fn apply_answer(&self, call_id: &CallId, answer: SessionDescription) {
        if let Err(e) = self.adapter.handle_answer(call_id, answer).await {
            tracing::error!("Failed to apply answer for {}: {}", call_id, e);
            self.emit_error(call_id, &e);
            if let Ok(entry) = self.entry(call_id) {
                if let Err(send) = self.end_call(&entry, EndReason::Error).await {
                    tracing::warn!("Failed to send hangup for {}: {}", call_id, send);
                }
            }
        }
    }

    // ========================================================================
    // TERMINATION
    // ========================================================================

    /// Lokales Ende: Gegenseite benachrichtigen, aufräumen, `ended` melden.
    ///
    /// Der Abbau läuft auch dann, wenn das Senden fehlschlägt; der Fehler
    /// wird danach zurückgegeben.
    async fn end_call(&self, entry: &LocalCallState, reason: EndReason) -> Result<(), AdapterError> {
        let call_id = &entry.call_id;
        let remote = entry.remote();

        // Callee lehnt ab (auch bei Timeout), alles andere ist ein Auflegen
        let rejects = matches!(
            (reason, entry.role),
            (EndReason::UserReject, _) | (EndReason::Timeout, Role::Callee)
        );

        let sent = if rejects {
            let sent = self
                .outbox
                .send(EventKind::Reject { reason }, call_id, remote)
                .await;
            self.adapter.teardown(call_id).await;
            sent.map(|_| ()).map_err(AdapterError::from)
        } else {
            self.adapter.hangup(call_id, remote, reason).await
        };

        let effects = self.registry.lock().cleanup_call(call_id, reason);
        self.apply_effects(effects).await;

        if let Err(e) = self
            .outbox
            .send(
                EventKind::Status {
                    state: CallState::Ended,
                },
                call_id,
                remote,
            )
            .await
        {
            tracing::warn!("Failed to announce end of {}: {}", call_id, e);
        }

        sent
    }

    async fn on_expired(&self, expired: Expired) {
        if !self.supervisor.claim(&expired) {
            tracing::debug!("Stale ring timeout for {} ignored", expired.call_id);
            return;
        }

        // Wartet die Verhandlung noch auf Medien, wird sie hier abgebrochen
        self.cancel_negotiation(&expired.call_id);
        let _guard = self.lock_call(&expired.call_id).await;
        let Ok(entry) = self.entry(&expired.call_id) else {
            return;
        };
        if entry.state != CallState::Ringing {
            return;
        }

        tracing::info!("Call {} was not answered in time", entry.call_id);
        if let Err(e) = self.end_call(&entry, EndReason::Timeout).await {
            tracing::warn!("Failed to notify {} about timeout: {}", entry.remote(), e);
        }
    }

    // ========================================================================
    // PEER EVENTS
    // ========================================================================

    async fn on_peer_event(&self, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate { call_id, candidate } => {
                if let Err(e) = self.adapter.publish_local_candidate(&call_id, candidate).await {
                    tracing::warn!("Failed to send ICE candidate for {}: {}", call_id, e);
                }
            }
            PeerEvent::Track { call_id, kind } => {
                tracing::debug!("Remote {} media flowing for {}", kind, call_id);
                let _guard = self.lock_call(&call_id).await;
                self.promote(&call_id).await;
            }
            PeerEvent::ConnectionState { call_id, state } => {
                let _guard = self.lock_call(&call_id).await;
                match self.adapter.on_connection_state(&call_id, state).await {
                    ConnectionAction::Promote => self.promote(&call_id).await,
                    ConnectionAction::Fail => {
                        let Ok(entry) = self.entry(&call_id) else {
                            return;
                        };
                        if !entry.state.is_active() {
                            return;
                        }
                        tracing::warn!("Connection for call {} lost ({:?})", call_id, state);
                        if let Err(e) = self.end_call(&entry, EndReason::Error).await {
                            tracing::warn!("Failed to send hangup for {}: {}", call_id, e);
                        }
                    }
                    ConnectionAction::None => {}
                }
            }
        }
    }

    /// Medien fließen: `ringing` → `in_call`
    async fn promote(&self, call_id: &CallId) {
        let state = self.registry.lock().get(call_id).map(|entry| entry.state);
        if state != Some(CallState::Ringing) {
            return;
        }
        let effects = self
            .registry
            .lock()
            .update_call_state(call_id, CallState::InCall);
        self.apply_effects(effects).await;
    }

    // ========================================================================
    // EFFECTS
    // ========================================================================

    async fn apply_effects(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::StateChanged {
                    call_id,
                    state,
                    reason,
                    ..
                } => {
                    let _ = self.events.send(CallEvent::StateChanged {
                        call_id,
                        state,
                        reason,
                    });
                }
                Effect::Incoming(entry) => self.admit(entry).await,
                Effect::ArmTimeout(call_id) => self.supervisor.arm(&call_id),
                Effect::CancelTimeout(call_id) => {
                    self.supervisor.cancel(&call_id);
                }
                Effect::TeardownConnection(call_id) => self.adapter.teardown(&call_id).await,
                Effect::ScheduleRemoval(call_id) => self.schedule_removal(call_id),
                Effect::Persist { call_id, status } => self.persist(call_id, status),
            }
        }
    }

    /// Callee: Kanal abonnieren, `call.ringing` senden, Beobachter benachrichtigen
    async fn admit(&self, entry: LocalCallState) {
        let call_id = &entry.call_id;
        if let Err(e) = self.watch(call_channel(call_id)).await {
            tracing::error!("Failed to subscribe to call {}: {}", call_id, e);
        }
        if let Err(e) = self
            .outbox
            .send(EventKind::Ringing, call_id, &entry.from)
            .await
        {
            tracing::warn!("Failed to send ringing for {}: {}", call_id, e);
        }
        let _ = self.events.send(CallEvent::IncomingCall(entry));
    }

    fn schedule_removal(&self, call_id: CallId) {
        let tx = self.removals_tx.clone();
        let grace = self.ended_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = tx.send(call_id);
        });
    }

    async fn remove(&self, call_id: CallId) {
        if !self.registry.lock().purge(&call_id) {
            return;
        }
        self.adapter.forget(&call_id);
        self.call_locks.lock().remove(&call_id);
        self.negotiations.lock().remove(&call_id);

        let channel = call_channel(&call_id);
        let forwarder = self.subscriptions.lock().remove(&channel);
        if let Some(forwarder) = forwarder {
            forwarder.abort();
            if let Err(e) = self.outbox.transport().unsubscribe(&channel).await {
                tracing::warn!("Failed to unsubscribe {}: {}", channel, e);
            }
        }

        let _ = self.events.send(CallEvent::Removed(call_id));
    }

    /// Fire-and-forget; Fehler blockieren nie den Übergang
    fn persist(&self, call_id: CallId, status: CallStatus) {
        let sink = Arc::clone(&self.status_sink);
        tokio::task::spawn_blocking(move || {
            if let Err(e) = sink.update_call_status(&call_id, status) {
                tracing::warn!(
                    "Failed to persist status {} for {}: {}",
                    status.as_str(),
                    call_id,
                    e
                );
            }
        });
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    fn entry(&self, call_id: &CallId) -> Result<LocalCallState, AgentError> {
        self.get(call_id)
            .ok_or_else(|| AgentError::UnknownCall(call_id.clone()))
    }

    fn expect_state(
        &self,
        call_id: &CallId,
        expected: CallState,
        action: &'static str,
    ) -> Result<LocalCallState, AgentError> {
        let entry = self.entry(call_id)?;
        if entry.state != expected {
            return Err(AgentError::InvalidState {
                call_id: call_id.clone(),
                state: entry.state,
                action,
            });
        }
        Ok(entry)
    }

    fn emit_error(&self, call_id: &CallId, error: &AdapterError) {
        let _ = self.events.send(CallEvent::Error {
            call_id: call_id.clone(),
            message: error.to_string(),
        });
    }

    /// Startet einen abbrechbaren Verhandlungs-Task für den Anruf
    fn spawn_negotiation<F, Fut>(
        &self,
        call_id: &CallId,
        work: F,
    ) -> Result<JoinHandle<Result<(), AgentError>>, AgentError>
    where
        F: FnOnce(Arc<CallAgent>) -> Fut,
        Fut: Future<Output = Result<(), AgentError>> + Send + 'static,
    {
        let agent = self
            .this
            .upgrade()
            .ok_or_else(|| AgentError::Aborted(call_id.clone()))?;
        let task = tokio::spawn(work(agent));

        let mut negotiations = self.negotiations.lock();
        let handles = negotiations.entry(call_id.clone()).or_default();
        handles.retain(|handle| !handle.is_finished());
        handles.push(task.abort_handle());
        Ok(task)
    }

    fn cancel_negotiation(&self, call_id: &CallId) {
        let handles = self.negotiations.lock().remove(call_id);
        for handle in handles.into_iter().flatten() {
            if !handle.is_finished() {
                tracing::debug!("Aborting pending negotiation for {}", call_id);
                handle.abort();
            }
        }
    }

    fn is_tracked(&self, call_id: &CallId) -> bool {
        self.registry.lock().get(call_id).is_some()
    }

    async fn lock_call(&self, call_id: &CallId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.call_locks.lock();
            Arc::clone(locks.entry(call_id.clone()).or_default())
        };
        lock.lock_owned().await
    }

    /// Abonniert einen Kanal und leitet seine Events in die Event-Loop
    async fn watch(&self, channel: String) -> Result<(), SignalingError> {
        if self.subscriptions.lock().contains_key(&channel) {
            return Ok(());
        }

        let mut rx = self.outbox.transport().subscribe(&channel).await?;
        let tx = self.signals_tx.clone();
        let name = channel.clone();
        let forwarder = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if tx.send(event).is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        tracing::warn!("Subscription {} lagged, {} event(s) lost", name, n)
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        if let Some(previous) = self.subscriptions.lock().insert(channel, forwarder) {
            previous.abort();
        }
        Ok(())
    }

    async fn dispatch(&self, input: Input) {
        match input {
            Input::Signal(event) => self.handle_signaling_event(event).await,
            Input::Expired(expired) => self.on_expired(expired).await,
            Input::Peer(event) => self.on_peer_event(event).await,
            Input::Remove(call_id) => self.remove(call_id).await,
        }
    }
}

impl Drop for CallAgent {
    fn drop(&mut self) {
        for (_, forwarder) in self.subscriptions.lock().drain() {
            forwarder.abort();
        }
        for (_, handles) in self.negotiations.lock().drain() {
            for handle in handles {
                handle.abort();
            }
        }
        if let Some(task) = self.run_task.lock().take() {
            task.abort();
        }
    }
}

/// Verteilt Eingaben an einen Worker pro Call-ID
///
/// Ein hängender Anruf blockiert so nur seinen eigenen Worker.
async fn run_loop(agent: Weak<CallAgent>, mut rx: Receivers) {
    let mut workers: HashMap<CallId, mpsc::UnboundedSender<Input>> = HashMap::new();

    loop {
        let input = tokio::select! {
            Some(event) = rx.signals.recv() => Input::Signal(event),
            Some(expired) = rx.expired.recv() => Input::Expired(expired),
            Some(event) = rx.peer.recv() => Input::Peer(event),
            Some(call_id) = rx.removals.recv() => Input::Remove(call_id),
            else => break,
        };

        if agent.strong_count() == 0 {
            break;
        }

        workers.retain(|_, tx| !tx.is_closed());
        let call_id = input.call_id().clone();
        let input = match workers.get(&call_id) {
            Some(tx) => match tx.send(input) {
                Ok(()) => continue,
                // Worker hat sich gerade beendet
                Err(mpsc::error::SendError(input)) => input,
            },
            None => input,
        };

        let (tx, inputs) = mpsc::unbounded_channel();
        tokio::spawn(call_worker(agent.clone(), call_id.clone(), inputs));
        let _ = tx.send(input);
        workers.insert(call_id, tx);
    }
    tracing::debug!("Call agent loop stopped");
}

/// Arbeitet die Eingaben eines Anrufs der Reihe nach ab
///
/// Endet, sobald die Queue leer ist und die Registry den Anruf nicht mehr kennt.
async fn call_worker(
    agent: Weak<CallAgent>,
    call_id: CallId,
    mut inputs: mpsc::UnboundedReceiver<Input>,
) {
    while let Some(input) = inputs.recv().await {
        let Some(agent) = agent.upgrade() else {
            return;
        };
        agent.dispatch(input).await;

        if inputs.is_empty() && !agent.is_tracked(&call_id) {
            inputs.close();
            while let Ok(input) = inputs.try_recv() {
                agent.dispatch(input).await;
            }
            break;
        }
    }
    tracing::trace!("Worker for call {} stopped", call_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_engine::{ConnectionState, MediaError, NegotiationState};
    use crate::signaling::{IceCandidate, MemoryTransport};
    use crate::testing::{FakeFactory, FakeMedia, RecordingStatusSink};
    use async_trait::async_trait;

    /// Relay mit Umlaufzeit beim Abonnieren
    struct SlowSubscribe {
        inner: Arc<MemoryTransport>,
        delay: Duration,
    }

    #[async_trait]
    impl SignalingTransport for SlowSubscribe {
        async fn publish(&self, event: &SignalingEvent) -> Result<(), SignalingError> {
            self.inner.publish(event).await
        }

        async fn subscribe(
            &self,
            channel: &str,
        ) -> Result<broadcast::Receiver<SignalingEvent>, SignalingError> {
            tokio::time::sleep(self.delay).await;
            self.inner.subscribe(channel).await
        }

        async fn unsubscribe(&self, channel: &str) -> Result<(), SignalingError> {
            self.inner.unsubscribe(channel).await
        }
    }

    struct Participant {
        agent: Arc<CallAgent>,
        factory: Arc<FakeFactory>,
        media: Arc<FakeMedia>,
        sink: Arc<RecordingStatusSink>,
    }

    async fn participant_with(transport: Arc<dyn SignalingTransport>, config: Config) -> Participant {
        let factory = Arc::new(FakeFactory::default());
        let media = Arc::new(FakeMedia::default());
        let sink = Arc::new(RecordingStatusSink::default());
        let agent = CallAgent::start(
            &config,
            transport,
            factory.clone(),
            media.clone(),
            sink.clone(),
        )
        .await
        .unwrap();
        Participant {
            agent,
            factory,
            media,
            sink,
        }
    }

    async fn participant(bus: &Arc<MemoryTransport>, user: &str) -> Participant {
        participant_with(bus.clone(), Config::new(user)).await
    }

    async fn eventually<F>(what: &str, mut check: F)
    where
        F: FnMut() -> bool,
    {
        for _ in 0..400 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    fn state_of(p: &Participant, call_id: &CallId) -> Option<CallState> {
        p.agent.get(call_id).map(|entry| entry.state)
    }

    fn reason_of(p: &Participant, call_id: &CallId) -> Option<EndReason> {
        p.agent.get(call_id).and_then(|entry| entry.ended_reason)
    }

    /// Das Offer des Anrufers kann noch unterwegs sein
    async fn accept_when_offered(p: &Participant, call_id: &CallId) -> Result<(), AgentError> {
        for _ in 0..400 {
            match p.agent.accept(call_id).await {
                Err(AgentError::Adapter(AdapterError::NoPendingOffer(_))) => {
                    tokio::time::sleep(Duration::from_millis(5)).await
                }
                other => return other,
            }
        }
        panic!("offer for {} never arrived", call_id);
    }

    async fn connected_call(
        visitor: &Participant,
        resident: &Participant,
        media: CallMedia,
    ) -> CallId {
        let call_id = visitor.agent.start_call("resident", media).await.unwrap();
        eventually("incoming call", || {
            state_of(resident, &call_id) == Some(CallState::Ringing)
        })
        .await;
        accept_when_offered(resident, &call_id).await.unwrap();
        eventually("both sides in_call", || {
            state_of(visitor, &call_id) == Some(CallState::InCall)
                && state_of(resident, &call_id) == Some(CallState::InCall)
        })
        .await;
        call_id
    }

    fn from_resident(kind: EventKind, call_id: &CallId) -> SignalingEvent {
        SignalingEvent::new(kind, call_id.clone(), "resident", "visitor")
    }

    /// Nächstes Event auf dem Kanal, das nicht vom Testskript selbst stammt
    async fn next_from(
        rx: &mut broadcast::Receiver<SignalingEvent>,
        sender: &str,
    ) -> SignalingEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            if event.from == sender {
                return event;
            }
        }
    }

    fn request(call_id: &CallId, from: &str, to: &str) -> SignalingEvent {
        SignalingEvent::new(
            EventKind::Request {
                media: CallMedia::Audio,
            },
            call_id.clone(),
            from,
            to,
        )
    }

    #[tokio::test]
    async fn test_audio_call_reaches_in_call_on_both_sides() {
        let bus = Arc::new(MemoryTransport::new());
        let visitor = participant(&bus, "visitor").await;
        let resident = participant(&bus, "resident").await;
        let mut notifications = resident.agent.subscribe();

        let call_id = connected_call(&visitor, &resident, CallMedia::Audio).await;

        let incoming = loop {
            if let CallEvent::IncomingCall(entry) = notifications.recv().await.unwrap() {
                break entry;
            }
        };
        assert_eq!(incoming.call_id, call_id);
        assert_eq!(incoming.role, Role::Callee);
        assert_eq!(incoming.from, "visitor");

        // Offer vom Anrufer, Answer vom Angerufenen
        let caller_peer = visitor.factory.last().unwrap();
        eventually("answer applied", || caller_peer.remote_descriptions().len() == 1).await;
        assert_eq!(caller_peer.remote_descriptions()[0].sdp_type, SdpType::Answer);
        assert_eq!(caller_peer.local_descriptions()[0].sdp_type, SdpType::Offer);

        let callee_peer = resident.factory.last().unwrap();
        assert_eq!(callee_peer.remote_descriptions()[0].sdp_type, SdpType::Offer);
        assert_eq!(callee_peer.local_descriptions()[0].sdp_type, SdpType::Answer);

        eventually("answered persisted", || {
            let statuses = visitor.sink.statuses_for(&call_id);
            statuses.contains(&CallStatus::Pending) && statuses.contains(&CallStatus::Answered)
        })
        .await;
        assert_eq!(resident.agent.active_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_busy_callee_rejects_second_call() {
        let bus = Arc::new(MemoryTransport::new());
        let visitor = participant(&bus, "visitor").await;
        let resident = participant(&bus, "resident").await;
        let first = connected_call(&visitor, &resident, CallMedia::Audio).await;

        let second = CallId::from("C2");
        let mut rx = bus.subscribe(&call_channel(&second)).await.unwrap();
        bus.publish(&request(&second, "courier", "resident"))
            .await
            .unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            reply.kind,
            EventKind::Reject {
                reason: EndReason::Busy
            }
        );
        assert_eq!(reply.from, "resident");
        assert_eq!(reply.to, "courier");

        assert!(resident.agent.get(&second).is_none());
        assert_eq!(state_of(&resident, &first), Some(CallState::InCall));
    }

    #[tokio::test]
    async fn test_start_call_while_busy_fails() {
        let bus = Arc::new(MemoryTransport::new());
        let visitor = participant(&bus, "visitor").await;

        visitor
            .agent
            .start_call("resident", CallMedia::Text)
            .await
            .unwrap();
        let result = visitor.agent.start_call("neighbour", CallMedia::Text).await;
        assert!(matches!(result, Err(AgentError::AlreadyInCall)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_call_times_out() {
        let bus = Arc::new(MemoryTransport::new());
        let resident = participant(&bus, "resident").await;

        let call_id = CallId::from("C3");
        let mut rx = bus.subscribe(&call_channel(&call_id)).await.unwrap();
        bus.publish(&request(&call_id, "visitor", "resident"))
            .await
            .unwrap();

        let ringing = rx.recv().await.unwrap();
        assert_eq!(ringing.kind, EventKind::Ringing);
        assert_eq!(state_of(&resident, &call_id), Some(CallState::Ringing));

        tokio::time::sleep(Duration::from_millis(30_100)).await;

        assert_eq!(state_of(&resident, &call_id), Some(CallState::Ended));
        assert_eq!(reason_of(&resident, &call_id), Some(EndReason::Timeout));
        assert!(resident.agent.active_calls().is_empty());

        let reject = rx.recv().await.unwrap();
        assert_eq!(
            reject.kind,
            EventKind::Reject {
                reason: EndReason::Timeout
            }
        );
        assert_eq!(reject.to, "visitor");
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_gives_up_after_timeout() {
        let bus = Arc::new(MemoryTransport::new());
        let visitor = participant(&bus, "visitor").await;

        let call_id = visitor
            .agent
            .start_call("resident", CallMedia::Audio)
            .await
            .unwrap();
        let mut rx = bus.subscribe(&call_channel(&call_id)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30_100)).await;

        assert_eq!(reason_of(&visitor, &call_id), Some(EndReason::Timeout));
        let hangup = rx.recv().await.unwrap();
        assert_eq!(
            hangup.kind,
            EventKind::Hangup {
                reason: EndReason::Timeout
            }
        );
        // Kein Ringing, also nie eine Peer Connection
        assert_eq!(visitor.factory.created(), 0);
    }

    #[tokio::test]
    async fn test_reject_ends_call_on_both_sides() {
        let bus = Arc::new(MemoryTransport::new());
        let visitor = participant(&bus, "visitor").await;
        let resident = participant(&bus, "resident").await;

        let call_id = visitor
            .agent
            .start_call("resident", CallMedia::Audio)
            .await
            .unwrap();
        eventually("incoming call", || {
            state_of(&resident, &call_id) == Some(CallState::Ringing)
        })
        .await;

        resident.agent.reject(&call_id).await.unwrap();
        assert_eq!(reason_of(&resident, &call_id), Some(EndReason::UserReject));

        eventually("caller sees rejection", || {
            reason_of(&visitor, &call_id) == Some(EndReason::UserReject)
        })
        .await;
        eventually("caller connection closed", || {
            visitor
                .factory
                .last()
                .map(|peer| peer.close_count() == 1)
                .unwrap_or(false)
        })
        .await;
        eventually("ended persisted", || {
            visitor
                .sink
                .statuses_for(&call_id)
                .contains(&CallStatus::Ended)
        })
        .await;
    }

    #[tokio::test]
    async fn test_hangup_releases_everything_once() {
        let bus = Arc::new(MemoryTransport::new());
        let visitor = participant(&bus, "visitor").await;
        let resident = participant(&bus, "resident").await;
        let call_id = connected_call(&visitor, &resident, CallMedia::Video).await;

        visitor.agent.hangup(&call_id).await.unwrap();
        assert_eq!(state_of(&visitor, &call_id), Some(CallState::Ended));
        assert_eq!(visitor.factory.last().unwrap().close_count(), 1);
        assert!(visitor.media.all_stopped());

        eventually("callee ended", || {
            reason_of(&resident, &call_id) == Some(EndReason::UserEnd)
        })
        .await;
        assert_eq!(resident.factory.last().unwrap().close_count(), 1);
        assert!(resident.media.all_stopped());

        let again = visitor.agent.hangup(&call_id).await;
        assert!(matches!(again, Err(AgentError::InvalidState { .. })));
        assert_eq!(visitor.factory.last().unwrap().close_count(), 1);
    }

    #[tokio::test]
    async fn test_media_failure_ends_call_with_error() {
        let bus = Arc::new(MemoryTransport::new());
        let visitor = participant(&bus, "visitor").await;
        let resident = participant(&bus, "resident").await;
        resident.media.deny();

        let call_id = visitor
            .agent
            .start_call("resident", CallMedia::Audio)
            .await
            .unwrap();
        eventually("incoming call", || {
            state_of(&resident, &call_id) == Some(CallState::Ringing)
        })
        .await;

        let result = accept_when_offered(&resident, &call_id).await;
        assert!(matches!(
            result,
            Err(AgentError::Adapter(AdapterError::Media(
                MediaError::PermissionDenied
            )))
        ));
        assert_eq!(reason_of(&resident, &call_id), Some(EndReason::Error));

        eventually("caller ended with error", || {
            reason_of(&visitor, &call_id) == Some(EndReason::Error)
        })
        .await;
    }

    #[tokio::test]
    async fn test_connection_failure_runs_hangup_path() {
        let bus = Arc::new(MemoryTransport::new());
        let visitor = participant(&bus, "visitor").await;
        let resident = participant(&bus, "resident").await;
        let call_id = connected_call(&visitor, &resident, CallMedia::Audio).await;

        visitor
            .factory
            .emit_state(&call_id, ConnectionState::Failed);

        eventually("caller ended", || {
            reason_of(&visitor, &call_id) == Some(EndReason::Error)
        })
        .await;
        eventually("callee ended", || {
            reason_of(&resident, &call_id) == Some(EndReason::Error)
        })
        .await;
    }

    #[tokio::test]
    async fn test_text_call_needs_no_peer_connection() {
        let bus = Arc::new(MemoryTransport::new());
        let visitor = participant(&bus, "visitor").await;
        let resident = participant(&bus, "resident").await;

        let call_id = connected_call(&visitor, &resident, CallMedia::Text).await;
        assert_eq!(visitor.factory.created(), 0);
        assert_eq!(resident.factory.created(), 0);

        let mut rx = bus.subscribe(&call_channel(&call_id)).await.unwrap();
        visitor.agent.announce_status(&call_id).await.unwrap();
        let status = rx.recv().await.unwrap();
        assert_eq!(
            status.kind,
            EventKind::Status {
                state: CallState::InCall
            }
        );
        assert_eq!(status.to, "resident");
    }

    #[tokio::test]
    async fn test_ended_call_is_removed_after_grace() {
        let bus = Arc::new(MemoryTransport::new());
        let mut config = Config::new("visitor");
        config.ended_grace = Duration::from_millis(20);
        let visitor = participant_with(bus.clone(), config).await;
        let resident = participant(&bus, "resident").await;
        let mut events = visitor.agent.subscribe();

        let call_id = connected_call(&visitor, &resident, CallMedia::Text).await;
        visitor.agent.hangup(&call_id).await.unwrap();

        eventually("entry purged", || visitor.agent.get(&call_id).is_none()).await;

        let mut states = Vec::new();
        let mut removed = false;
        while let Ok(event) = events.try_recv() {
            match event {
                CallEvent::StateChanged { state, .. } => states.push(state),
                CallEvent::Removed(id) => removed = id == call_id,
                _ => {}
            }
        }
        assert_eq!(
            states,
            vec![CallState::Ringing, CallState::InCall, CallState::Ended]
        );
        assert!(removed);

        // Späte Events beleben den Anruf nicht wieder
        bus.publish(&SignalingEvent::new(
            EventKind::Accept { payload: None },
            call_id.clone(),
            "resident",
            "visitor",
        ))
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(visitor.agent.get(&call_id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_media_does_not_block_timeout() {
        let bus = Arc::new(MemoryTransport::new());
        let visitor = participant(&bus, "visitor").await;
        visitor.media.stall();

        let call_id = visitor
            .agent
            .start_call("resident", CallMedia::Audio)
            .await
            .unwrap();
        let mut rx = bus.subscribe(&call_channel(&call_id)).await.unwrap();
        bus.publish(&from_resident(EventKind::Ringing, &call_id))
            .await
            .unwrap();
        eventually("peer created", || visitor.factory.created() == 1).await;

        // Andere Anrufe werden trotzdem bearbeitet
        let other = CallId::from("C9");
        let mut other_rx = bus.subscribe(&call_channel(&other)).await.unwrap();
        bus.publish(&request(&other, "courier", "visitor"))
            .await
            .unwrap();
        let reply = next_from(&mut other_rx, "visitor").await;
        assert_eq!(
            reply.kind,
            EventKind::Reject {
                reason: EndReason::Busy
            }
        );

        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(state_of(&visitor, &call_id), Some(CallState::Ended));
        assert_eq!(reason_of(&visitor, &call_id), Some(EndReason::Timeout));
        let hangup = next_from(&mut rx, "visitor").await;
        assert_eq!(
            hangup.kind,
            EventKind::Hangup {
                reason: EndReason::Timeout
            }
        );
        assert_eq!(visitor.factory.last().unwrap().close_count(), 1);
        assert!(visitor.media.acquired().is_empty());
    }

    #[tokio::test]
    async fn test_hangup_aborts_stalled_offer() {
        let bus = Arc::new(MemoryTransport::new());
        let visitor = participant(&bus, "visitor").await;
        visitor.media.stall();

        let call_id = visitor
            .agent
            .start_call("resident", CallMedia::Video)
            .await
            .unwrap();
        bus.publish(&from_resident(EventKind::Ringing, &call_id))
            .await
            .unwrap();
        eventually("peer created", || visitor.factory.created() == 1).await;

        tokio::time::timeout(Duration::from_secs(1), visitor.agent.hangup(&call_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason_of(&visitor, &call_id), Some(EndReason::UserEnd));
        assert_eq!(visitor.factory.last().unwrap().close_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_accept_is_aborted_by_timeout() {
        let bus = Arc::new(MemoryTransport::new());
        let visitor = participant(&bus, "visitor").await;
        let resident = participant(&bus, "resident").await;
        resident.media.stall();

        let call_id = visitor
            .agent
            .start_call("resident", CallMedia::Audio)
            .await
            .unwrap();
        let mut offered = false;
        for _ in 0..400 {
            if resident.agent.adapter().has_pending_offer(&call_id).await {
                offered = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(offered, "offer never reached the callee");

        let agent = Arc::clone(&resident.agent);
        let id = call_id.clone();
        let accepting = tokio::spawn(async move { agent.accept(&id).await });

        tokio::time::sleep(Duration::from_secs(31)).await;

        assert_eq!(reason_of(&resident, &call_id), Some(EndReason::Timeout));
        assert!(matches!(
            accepting.await.unwrap(),
            Err(AgentError::Aborted(_))
        ));
        assert!(resident.agent.active_calls().is_empty());
    }

    #[tokio::test]
    async fn test_start_call_reserves_slot_before_subscribing() {
        let bus = Arc::new(MemoryTransport::new());
        let slow = Arc::new(SlowSubscribe {
            inner: bus.clone(),
            delay: Duration::from_millis(20),
        });
        let resident = participant_with(slow, Config::new("resident")).await;

        let incoming = CallId::from("IN1");
        let mut rx = bus.subscribe(&call_channel(&incoming)).await.unwrap();
        bus.publish(&request(&incoming, "visitor", "resident"))
            .await
            .unwrap();
        let outgoing = resident
            .agent
            .start_call("neighbour", CallMedia::Audio)
            .await
            .unwrap();

        let reply = next_from(&mut rx, "resident").await;
        assert_eq!(
            reply.kind,
            EventKind::Reject {
                reason: EndReason::Busy
            }
        );

        let active = resident.agent.active_calls();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].call_id, outgoing);
        assert_eq!(active[0].role, Role::Caller);
        assert!(resident.agent.get(&incoming).is_none());
    }

    #[tokio::test]
    async fn test_negotiation_for_unknown_call_creates_no_session() {
        let bus = Arc::new(MemoryTransport::new());
        let resident = participant(&bus, "resident").await;
        let ghost = CallId::from("GHOST");

        resident
            .agent
            .handle_signaling_event(SignalingEvent::new(
                EventKind::Ice {
                    payload: IceCandidate {
                        candidate: "candidate:1 1 udp 1 10.0.0.1 5000 typ host".to_string(),
                        sdp_mid: Some("0".to_string()),
                        sdp_mline_index: Some(0),
                        username_fragment: None,
                    },
                },
                ghost.clone(),
                "visitor",
                "resident",
            ))
            .await;
        resident
            .agent
            .handle_signaling_event(SignalingEvent::new(
                EventKind::Sdp {
                    payload: SessionDescription::offer("v=0"),
                },
                ghost.clone(),
                "visitor",
                "resident",
            ))
            .await;

        assert_eq!(resident.agent.adapter().session_count(), 0);
        assert!(resident.agent.get(&ghost).is_none());
    }

    #[tokio::test]
    async fn test_answer_inside_accept_is_applied_once() {
        let bus = Arc::new(MemoryTransport::new());
        let visitor = participant(&bus, "visitor").await;

        let call_id = visitor
            .agent
            .start_call("resident", CallMedia::Audio)
            .await
            .unwrap();
        let mut rx = bus.subscribe(&call_channel(&call_id)).await.unwrap();
        bus.publish(&from_resident(EventKind::Ringing, &call_id))
            .await
            .unwrap();

        let offer = next_from(&mut rx, "visitor").await;
        assert!(matches!(
            offer.kind,
            EventKind::Sdp { ref payload } if payload.sdp_type == SdpType::Offer
        ));

        bus.publish(&from_resident(
            EventKind::Accept {
                payload: Some(SessionDescription::answer("v=0 answer")),
            },
            &call_id,
        ))
        .await
        .unwrap();
        eventually("caller in_call", || {
            state_of(&visitor, &call_id) == Some(CallState::InCall)
        })
        .await;

        let peer = visitor.factory.last().unwrap();
        eventually("answer applied", || peer.remote_descriptions().len() == 1).await;

        // Ein nachgereichtes Answer ändert nichts mehr
        bus.publish(&from_resident(
            EventKind::Sdp {
                payload: SessionDescription::answer("v=0 late"),
            },
            &call_id,
        ))
        .await
        .unwrap();
        bus.publish(&from_resident(
            EventKind::Ice {
                payload: IceCandidate {
                    candidate: "candidate:2 1 udp 1 10.0.0.2 5000 typ host".to_string(),
                    sdp_mid: Some("0".to_string()),
                    sdp_mline_index: Some(0),
                    username_fragment: None,
                },
            },
            &call_id,
        ))
        .await
        .unwrap();
        eventually("candidate applied", || peer.applied_candidates().len() == 1).await;

        assert_eq!(peer.remote_descriptions().len(), 1);
        assert_eq!(peer.remote_descriptions()[0].sdp, "v=0 answer");
        assert_eq!(
            visitor.agent.adapter().negotiation_state(&call_id).await,
            Some(NegotiationState::Stable)
        );
        assert_eq!(state_of(&visitor, &call_id), Some(CallState::InCall));
    }
}
