//! Peer Connection Adapter
//!
//! Verwaltet pro Anruf eine Peer Connection und die Offer/Answer/ICE
//! Verhandlung. Jede Sitzung liegt hinter einem eigenen async Mutex, damit
//! Operationen für denselben Anruf strikt nacheinander ablaufen.

use super::media::{LocalMedia, MediaDevices, MediaError, MediaKind};
use super::peer::{
    ConnectionState, NegotiationState, PeerConnection, PeerConnectionFactory, PeerError,
    PeerEvent,
};
use super::state::{CallId, CallMedia, EndReason};
use crate::signaling::{
    EventKind, IceCandidate, Outbox, SdpType, SessionDescription, SignalingError,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("No pending offer for call {0}")]
    NoPendingOffer(CallId),

    #[error("Call {0} has already been torn down")]
    Ended(CallId),

    #[error("Peer error: {0}")]
    Peer(#[from] PeerError),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),
}

// ============================================================================
// SESSION STATE
// ============================================================================

/// Zustand der Medienverbindung eines Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Noch keine Verhandlung
    Idle,
    /// Offer gesendet, warte auf Answer
    Calling,
    /// Offer empfangen, warte auf accept
    Ringing,
    /// Verhandlung läuft
    Connecting,
    /// Medien fließen
    Connected,
    /// Abgebaut
    Ended,
}

/// Was der Agent nach einer Änderung des Verbindungszustands tun soll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionAction {
    /// Nichts
    None,
    /// Anruf auf `in_call` heben
    Promote,
    /// Anruf mit `error` beenden
    Fail,
}

/// Ergebnis von `handle_answer`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerOutcome {
    Applied,
    /// Verbindung stand bereits, nur der Zustand wurde abgeglichen
    Reconciled,
    Discarded,
}

struct PeerSession {
    call_id: CallId,
    remote: Option<String>,
    peer: Option<Arc<dyn PeerConnection>>,
    negotiation: NegotiationState,
    state: SessionState,
    pending_offer: Option<SessionDescription>,
    pending_candidates: VecDeque<IceCandidate>,
    remote_description_set: bool,
    local_media: Option<LocalMedia>,
}

impl PeerSession {
    fn new(call_id: CallId) -> Self {
        Self {
            call_id,
            remote: None,
            peer: None,
            negotiation: NegotiationState::NoOffer,
            state: SessionState::Idle,
            pending_offer: None,
            pending_candidates: VecDeque::new(),
            remote_description_set: false,
            local_media: None,
        }
    }

    fn is_ended(&self) -> bool {
        self.state == SessionState::Ended
    }
}

type SharedSession = Arc<Mutex<PeerSession>>;

// ============================================================================
// ADAPTER
// ============================================================================

pub struct PeerConnectionAdapter {
    factory: Arc<dyn PeerConnectionFactory>,
    devices: Arc<dyn MediaDevices>,
    outbox: Outbox,
    peer_events: mpsc::UnboundedSender<PeerEvent>,
    sessions: parking_lot::Mutex<HashMap<CallId, SharedSession>>,
}

impl PeerConnectionAdapter {
    /// Erstellt einen neuen Adapter; Engine-Callbacks landen in `peer_events`
    pub fn new(
        factory: Arc<dyn PeerConnectionFactory>,
        devices: Arc<dyn MediaDevices>,
        outbox: Outbox,
        peer_events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        Self {
            factory,
            devices,
            outbox,
            peer_events,
            sessions: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    fn session(&self, call_id: &CallId) -> SharedSession {
        let mut sessions = self.sessions.lock();
        sessions
            .entry(call_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(PeerSession::new(call_id.clone()))))
            .clone()
    }

    fn existing(&self, call_id: &CallId) -> Option<SharedSession> {
        self.sessions.lock().get(call_id).cloned()
    }

    /// Liefert eine nutzbare Peer Connection; eine tote wird ersetzt
    pub async fn ensure_connection(
        &self,
        call_id: &CallId,
    ) -> Result<Arc<dyn PeerConnection>, AdapterError> {
        let session = self.session(call_id);
        let mut session = session.lock().await;
        if session.is_ended() {
            return Err(AdapterError::Ended(call_id.clone()));
        }
        self.ensure_peer(&mut session).await
    }

    async fn ensure_peer(
        &self,
        session: &mut PeerSession,
    ) -> Result<Arc<dyn PeerConnection>, AdapterError> {
        if let Some(pc) = &session.peer {
            if !pc.connection_state().is_dead() {
                return Ok(Arc::clone(pc));
            }
            tracing::info!("Replacing dead peer connection for call {}", session.call_id);
            if let Some(old) = session.peer.take() {
                if let Err(e) = old.close().await {
                    tracing::debug!("Closing stale peer connection failed: {}", e);
                }
            }
            session.negotiation = NegotiationState::NoOffer;
            session.remote_description_set = false;
        }

        let pc = self
            .factory
            .create(&session.call_id, self.peer_events.clone())
            .await?;
        session.peer = Some(Arc::clone(&pc));
        Ok(pc)
    }

    async fn attach_local_media(
        &self,
        session: &mut PeerSession,
        pc: &Arc<dyn PeerConnection>,
        media: CallMedia,
    ) -> Result<(), AdapterError> {
        if session.local_media.is_some() {
            return Ok(());
        }
        let kind = MediaKind::for_call(media)?;
        let local = self.devices.acquire_local_media(kind).await?;
        // Erst speichern, damit ein Abbau die Tracks in jedem Fall stoppt
        session.local_media = Some(local);
        if let Some(local) = &session.local_media {
            pc.add_local_media(local).await?;
        }
        Ok(())
    }

    // ========================================================================
    // CALLER
    // ========================================================================

    /// Startet die Verhandlung als Anrufer und veröffentlicht das Offer.
    ///
    /// Ein zweiter Aufruf für denselben Anruf ist ein No-op.
    pub async fn initiate(
        &self,
        call_id: &CallId,
        to: &str,
        media: CallMedia,
    ) -> Result<(), AdapterError> {
        let session = self.session(call_id);
        let mut session = session.lock().await;

        if session.is_ended() {
            return Err(AdapterError::Ended(call_id.clone()));
        }
        if session.negotiation != NegotiationState::NoOffer {
            tracing::debug!("Offer for call {} already sent", call_id);
            return Ok(());
        }

        session.remote = Some(to.to_string());
        session.state = SessionState::Calling;

        let result = self.send_offer(&mut session, media).await;
        if let Err(e) = &result {
            tracing::error!("Failed to initiate call {}: {}", call_id, e);
            Self::teardown_session(&mut session).await;
        }
        result
    }

    async fn send_offer(
        &self,
        session: &mut PeerSession,
        media: CallMedia,
    ) -> Result<(), AdapterError> {
        let pc = self.ensure_peer(session).await?;
        self.attach_local_media(session, &pc, media).await?;

        let offer = pc.create_offer().await?;
        pc.set_local_description(offer.clone()).await?;
        session.negotiation = session
            .negotiation
            .after_local(SdpType::Offer)
            .unwrap_or(NegotiationState::HaveLocalOffer);

        let to = session.remote.clone().unwrap_or_default();
        self.outbox
            .send(EventKind::Sdp { payload: offer }, &session.call_id, &to)
            .await?;

        tracing::info!("Offer sent for call {}", session.call_id);
        Ok(())
    }

    /// Wendet ein Answer an, aber nur wenn tatsächlich ein lokales Offer aussteht
    pub async fn handle_answer(
        &self,
        call_id: &CallId,
        answer: SessionDescription,
    ) -> Result<AnswerOutcome, AdapterError> {
        let Some(session) = self.existing(call_id) else {
            tracing::warn!("Answer for unknown call {} discarded", call_id);
            return Ok(AnswerOutcome::Discarded);
        };
        let mut session = session.lock().await;

        let Some(pc) = session.peer.clone() else {
            tracing::warn!("Answer for call {} without connection discarded", call_id);
            return Ok(AnswerOutcome::Discarded);
        };

        if session.negotiation != NegotiationState::HaveLocalOffer {
            tracing::warn!(
                "Stale answer for call {} in {:?} discarded",
                call_id,
                session.negotiation
            );
            if pc.connection_state() == ConnectionState::Connected {
                session.state = SessionState::Connected;
                return Ok(AnswerOutcome::Reconciled);
            }
            return Ok(AnswerOutcome::Discarded);
        }

        pc.set_remote_description(answer).await?;
        session.negotiation = NegotiationState::Stable;
        session.remote_description_set = true;
        session.state = SessionState::Connecting;
        Self::drain_candidates(&mut session, &pc).await;

        tracing::info!("Answer applied for call {}", call_id);
        Ok(AnswerOutcome::Applied)
    }

    // ========================================================================
    // CALLEE
    // ========================================================================

    /// Merkt sich ein eingehendes Offer bis zur Annahme
    pub async fn handle_offer(&self, call_id: &CallId, from: &str, offer: SessionDescription) {
        let session = self.session(call_id);
        let mut session = session.lock().await;

        if session.is_ended() {
            tracing::debug!("Offer for ended call {} ignored", call_id);
            return;
        }
        if session.negotiation != NegotiationState::NoOffer {
            tracing::debug!("Offer for call {} arrived after negotiation", call_id);
            return;
        }

        session.remote = Some(from.to_string());
        session.pending_offer = Some(offer);
        session.state = SessionState::Ringing;
        tracing::debug!("Stored offer for call {}", call_id);
    }

    /// Nimmt den Anruf an: Offer anwenden, Answer erzeugen und senden,
    /// danach die ICE-Warteschlange abarbeiten.
    pub async fn accept(
        &self,
        call_id: &CallId,
        from: &str,
        media: CallMedia,
    ) -> Result<(), AdapterError> {
        let session = self.session(call_id);
        let mut session = session.lock().await;

        if session.is_ended() {
            return Err(AdapterError::Ended(call_id.clone()));
        }
        let offer = session
            .pending_offer
            .clone()
            .ok_or_else(|| AdapterError::NoPendingOffer(call_id.clone()))?;

        if session.remote.is_none() {
            session.remote = Some(from.to_string());
        }
        session.state = SessionState::Connecting;

        let result = self.send_answer(&mut session, offer, media).await;
        if let Err(e) = &result {
            tracing::error!("Failed to accept call {}: {}", call_id, e);
            Self::teardown_session(&mut session).await;
        }
        result
    }

    async fn send_answer(
        &self,
        session: &mut PeerSession,
        offer: SessionDescription,
        media: CallMedia,
    ) -> Result<(), AdapterError> {
        let pc = self.ensure_peer(session).await?;
        self.attach_local_media(session, &pc, media).await?;

        pc.set_remote_description(offer).await?;
        session.negotiation = NegotiationState::HaveRemoteOffer;
        session.remote_description_set = true;

        let answer = pc.create_answer().await?;
        pc.set_local_description(answer.clone()).await?;
        session.negotiation = NegotiationState::Stable;

        let to = session.remote.clone().unwrap_or_default();
        self.outbox
            .send(EventKind::Sdp { payload: answer }, &session.call_id, &to)
            .await?;

        Self::drain_candidates(session, &pc).await;
        session.state = SessionState::Connected;
        session.pending_offer = None;

        tracing::info!("Answer sent for call {}", session.call_id);
        Ok(())
    }

    // ========================================================================
    // ICE
    // ========================================================================

    /// Wendet einen entfernten Candidate an oder stellt ihn zurück
    pub async fn handle_candidate(&self, call_id: &CallId, candidate: IceCandidate) {
        let session = self.session(call_id);
        let mut session = session.lock().await;

        if session.is_ended() {
            tracing::debug!("Candidate for ended call {} dropped", call_id);
            return;
        }

        let ready = session.peer.clone().filter(|_| session.remote_description_set);
        match ready {
            Some(pc) => {
                if let Err(e) = pc.add_ice_candidate(candidate).await {
                    tracing::warn!("Failed to add ICE candidate for {}: {}", call_id, e);
                }
            }
            None => {
                session.pending_candidates.push_back(candidate);
                tracing::trace!(
                    "Queued ICE candidate for {} ({} pending)",
                    call_id,
                    session.pending_candidates.len()
                );
            }
        }
    }

    async fn drain_candidates(session: &mut PeerSession, pc: &Arc<dyn PeerConnection>) {
        let count = session.pending_candidates.len();
        while let Some(candidate) = session.pending_candidates.pop_front() {
            if let Err(e) = pc.add_ice_candidate(candidate).await {
                tracing::warn!(
                    "Failed to add queued ICE candidate for {}: {}",
                    session.call_id,
                    e
                );
            }
        }
        if count > 0 {
            tracing::debug!("Flushed {} ICE candidate(s) for {}", count, session.call_id);
        }
    }

    /// Veröffentlicht einen lokal gefundenen Candidate
    pub async fn publish_local_candidate(
        &self,
        call_id: &CallId,
        candidate: IceCandidate,
    ) -> Result<(), AdapterError> {
        let Some(session) = self.existing(call_id) else {
            return Ok(());
        };
        let remote = {
            let session = session.lock().await;
            if session.is_ended() {
                return Ok(());
            }
            session.remote.clone()
        };
        if let Some(to) = remote {
            self.outbox
                .send(EventKind::Ice { payload: candidate }, call_id, &to)
                .await?;
        }
        Ok(())
    }

    // ========================================================================
    // CONNECTION STATE
    // ========================================================================

    /// Beobachtet den Verbindungszustand der Engine
    pub async fn on_connection_state(
        &self,
        call_id: &CallId,
        state: ConnectionState,
    ) -> ConnectionAction {
        let Some(session) = self.existing(call_id) else {
            return ConnectionAction::None;
        };
        let mut session = session.lock().await;
        if session.is_ended() {
            return ConnectionAction::None;
        }

        match state {
            ConnectionState::Connected => {
                session.state = SessionState::Connected;
                ConnectionAction::Promote
            }
            ConnectionState::Failed | ConnectionState::Disconnected => ConnectionAction::Fail,
            _ => ConnectionAction::None,
        }
    }

    // ========================================================================
    // TEARDOWN
    // ========================================================================

    /// Veröffentlicht `call.hangup` und baut die Verbindung ab.
    ///
    /// Der Abbau passiert auch dann, wenn das Senden fehlschlägt.
    pub async fn hangup(
        &self,
        call_id: &CallId,
        to: &str,
        reason: EndReason,
    ) -> Result<(), AdapterError> {
        let sent = self
            .outbox
            .send(EventKind::Hangup { reason }, call_id, to)
            .await;
        self.teardown(call_id).await;
        sent.map(|_| ()).map_err(AdapterError::from)
    }

    /// Stoppt Medien und schließt die Verbindung. Mehrfacher Aufruf ist harmlos.
    pub async fn teardown(&self, call_id: &CallId) {
        let Some(session) = self.existing(call_id) else {
            return;
        };
        let mut session = session.lock().await;
        Self::teardown_session(&mut session).await;
    }

    async fn teardown_session(session: &mut PeerSession) {
        if session.is_ended() {
            return;
        }

        if let Some(media) = session.local_media.take() {
            media.stop();
        }
        if let Some(pc) = session.peer.take() {
            if let Err(e) = pc.close().await {
                tracing::debug!("Closing peer connection for {} failed: {}", session.call_id, e);
            }
        }

        session.pending_candidates.clear();
        session.pending_offer = None;
        session.remote_description_set = false;
        session.negotiation = NegotiationState::Closed;
        session.state = SessionState::Ended;

        tracing::info!("Peer session for call {} torn down", session.call_id);
    }

    /// Entfernt die (abgebaute) Sitzung endgültig
    pub fn forget(&self, call_id: &CallId) {
        self.sessions.lock().remove(call_id);
    }

    // ========================================================================
    // INSPECTION
    // ========================================================================

    pub async fn session_state(&self, call_id: &CallId) -> Option<SessionState> {
        let session = self.existing(call_id)?;
        let state = session.lock().await.state;
        Some(state)
    }

    pub async fn negotiation_state(&self, call_id: &CallId) -> Option<NegotiationState> {
        let session = self.existing(call_id)?;
        let state = session.lock().await.negotiation;
        Some(state)
    }

    pub async fn pending_candidates(&self, call_id: &CallId) -> usize {
        match self.existing(call_id) {
            Some(session) => session.lock().await.pending_candidates.len(),
            None => 0,
        }
    }

    pub async fn has_pending_offer(&self, call_id: &CallId) -> bool {
        match self.existing(call_id) {
            Some(session) => session.lock().await.pending_offer.is_some(),
            None => false,
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }
}
