//! Test-Doubles für Engine, Medien und Persistenz

use crate::call_engine::{
    CallId, CallStatus, ConnectionState, LocalMedia, MediaDevices, MediaError, MediaKind,
    PeerConnection, PeerConnectionFactory, PeerError, PeerEvent,
};
use crate::database::{CallStatusSink, DatabaseError};
use crate::signaling::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

// ============================================================================
// PEER
// ============================================================================

/// Zeichnet alle Aufrufe auf; Candidates ohne Remote Description schlagen fehl
pub struct FakePeer {
    state: Mutex<ConnectionState>,
    candidates: Mutex<Vec<IceCandidate>>,
    local: Mutex<Vec<SessionDescription>>,
    remote: Mutex<Vec<SessionDescription>>,
    closes: AtomicUsize,
}

impl FakePeer {
    fn new() -> Self {
        Self {
            state: Mutex::new(ConnectionState::New),
            candidates: Mutex::new(Vec::new()),
            local: Mutex::new(Vec::new()),
            remote: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
        }
    }

    pub fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.candidates.lock().clone()
    }

    pub fn remote_descriptions(&self) -> Vec<SessionDescription> {
        self.remote.lock().clone()
    }

    pub fn local_descriptions(&self) -> Vec<SessionDescription> {
        self.local.lock().clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn add_local_media(&self, _media: &LocalMedia) -> Result<(), PeerError> {
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        Ok(SessionDescription::offer("v=0 fake-offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        if self.remote.lock().is_empty() {
            return Err(PeerError::WebRTC("no remote offer".to_string()));
        }
        Ok(SessionDescription::answer("v=0 fake-answer"))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.local.lock().push(desc);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.remote.lock().push(desc);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        if self.remote.lock().is_empty() {
            return Err(PeerError::WebRTC("remote description not set".to_string()));
        }
        self.candidates.lock().push(candidate);
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state.lock()
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.set_state(ConnectionState::Closed);
        Ok(())
    }
}

/// Merkt sich alle erzeugten Peers und deren Event-Sender
#[derive(Default)]
pub struct FakeFactory {
    peers: Mutex<Vec<(CallId, Arc<FakePeer>, mpsc::UnboundedSender<PeerEvent>)>>,
}

impl FakeFactory {
    pub fn created(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn last(&self) -> Option<Arc<FakePeer>> {
        self.peers.lock().last().map(|(_, peer, _)| Arc::clone(peer))
    }

    pub fn peer_for(&self, call_id: &CallId) -> Option<Arc<FakePeer>> {
        self.peers
            .lock()
            .iter()
            .rev()
            .find(|(id, _, _)| id == call_id)
            .map(|(_, peer, _)| Arc::clone(peer))
    }

    /// Simuliert einen Zustandswechsel der Engine
    pub fn emit_state(&self, call_id: &CallId, state: ConnectionState) {
        let peers = self.peers.lock();
        if let Some((_, peer, tx)) = peers.iter().rev().find(|(id, _, _)| id == call_id) {
            peer.set_state(state);
            let _ = tx.send(PeerEvent::ConnectionState {
                call_id: call_id.clone(),
                state,
            });
        }
    }
}

#[async_trait]
impl PeerConnectionFactory for FakeFactory {
    async fn create(
        &self,
        call_id: &CallId,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let peer = Arc::new(FakePeer::new());
        self.peers
            .lock()
            .push((call_id.clone(), Arc::clone(&peer), events));
        Ok(peer)
    }
}

// ============================================================================
// MEDIA
// ============================================================================

#[derive(Default)]
pub struct FakeMedia {
    denied: AtomicBool,
    stalled: AtomicBool,
    acquired: Mutex<Vec<MediaKind>>,
    stop_flags: Mutex<Vec<Arc<AtomicBool>>>,
}

impl FakeMedia {
    /// Alle folgenden Anfragen werden verweigert
    pub fn deny(&self) {
        self.denied.store(true, Ordering::SeqCst);
    }

    /// Folgende Anfragen kehren nie zurück (Berechtigungsdialog bleibt offen)
    pub fn stall(&self) {
        self.stalled.store(true, Ordering::SeqCst);
    }

    pub fn acquired(&self) -> Vec<MediaKind> {
        self.acquired.lock().clone()
    }

    pub fn all_stopped(&self) -> bool {
        self.stop_flags
            .lock()
            .iter()
            .all(|flag| flag.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl MediaDevices for FakeMedia {
    async fn acquire_local_media(&self, kind: MediaKind) -> Result<LocalMedia, MediaError> {
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.denied.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied);
        }
        let media = LocalMedia::new(kind, Vec::new());
        self.acquired.lock().push(kind);
        self.stop_flags.lock().push(media.stop_flag());
        Ok(media)
    }
}

// ============================================================================
// STATUS SINK
// ============================================================================

#[derive(Default)]
pub struct RecordingStatusSink {
    updates: Mutex<Vec<(CallId, CallStatus)>>,
}

impl RecordingStatusSink {
    pub fn updates(&self) -> Vec<(CallId, CallStatus)> {
        self.updates.lock().clone()
    }

    pub fn statuses_for(&self, call_id: &CallId) -> Vec<CallStatus> {
        self.updates
            .lock()
            .iter()
            .filter(|(id, _)| id == call_id)
            .map(|(_, status)| *status)
            .collect()
    }
}

impl CallStatusSink for RecordingStatusSink {
    fn update_call_status(&self, call_id: &CallId, status: CallStatus) -> Result<(), DatabaseError> {
        self.updates.lock().push((call_id.clone(), status));
        Ok(())
    }
}
