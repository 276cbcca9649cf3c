//! Signaling Transport
//!
//! Benannte Broadcast-Kanäle mit at-least-once, ungeordneter Zustellung.
//! Der Core kennt nur diesen Vertrag; `MemoryTransport` ist die
//! In-Process-Variante, `SignalingClient` spricht mit einem Relay.

use super::client::SignalingError;
use super::messages::{EventKind, SignalingEvent};
use crate::call_engine::CallId;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Kapazität pro Kanal
const CHANNEL_CAPACITY: usize = 100;

/// Publish/Subscribe Vertrag des externen Pub/Sub-Dienstes
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Veröffentlicht ein Event auf seinem Kanal (`SignalingEvent::channel`)
    async fn publish(&self, event: &SignalingEvent) -> Result<(), SignalingError>;

    /// Abonniert einen Kanal
    async fn subscribe(
        &self,
        channel: &str,
    ) -> Result<broadcast::Receiver<SignalingEvent>, SignalingError>;

    /// Beendet ein Abonnement (Empfänger werden danach nicht mehr beliefert)
    async fn unsubscribe(&self, channel: &str) -> Result<(), SignalingError>;
}

// ============================================================================
// CHANNEL TABLE
// ============================================================================

/// Tabelle Kanalname → Broadcast-Sender, geteilt von beiden Transports
#[derive(Default)]
pub(crate) struct ChannelTable {
    channels: Mutex<HashMap<String, broadcast::Sender<SignalingEvent>>>,
}

impl ChannelTable {
    pub(crate) fn subscribe(&self, channel: &str) -> broadcast::Receiver<SignalingEvent> {
        let mut channels = self.channels.lock();
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Liefert an alle Abonnenten; gibt die Anzahl der Empfänger zurück
    ///
    /// Kanäle ohne Empfänger werden dabei entfernt.
    pub(crate) fn deliver(&self, channel: &str, event: SignalingEvent) -> usize {
        let mut channels = self.channels.lock();
        let Some(tx) = channels.get(channel) else {
            return 0;
        };
        match tx.send(event) {
            Ok(receivers) => receivers,
            Err(_) => {
                channels.remove(channel);
                0
            }
        }
    }

    /// Entfernt den Kanal, sobald kein Empfänger mehr existiert
    pub(crate) fn release(&self, channel: &str) -> bool {
        let mut channels = self.channels.lock();
        match channels.get(channel) {
            Some(tx) if tx.receiver_count() == 0 => {
                channels.remove(channel);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn remove(&self, channel: &str) {
        self.channels.lock().remove(channel);
    }

    pub(crate) fn contains(&self, channel: &str) -> bool {
        self.channels.lock().contains_key(channel)
    }
}

// ============================================================================
// MEMORY TRANSPORT
// ============================================================================

/// In-Process Bus: alle Teilnehmer teilen sich eine Instanz
#[derive(Default)]
pub struct MemoryTransport {
    table: ChannelTable,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SignalingTransport for MemoryTransport {
    async fn publish(&self, event: &SignalingEvent) -> Result<(), SignalingError> {
        let channel = event.channel();
        let receivers = self.table.deliver(&channel, event.clone());
        tracing::trace!(
            "Published {} on {} to {} receiver(s)",
            event.kind.name(),
            channel,
            receivers
        );
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: &str,
    ) -> Result<broadcast::Receiver<SignalingEvent>, SignalingError> {
        Ok(self.table.subscribe(channel))
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), SignalingError> {
        // Kanäle sind geteilt; andere Teilnehmer können noch zuhören
        if self.table.release(channel) {
            tracing::trace!("Released channel {}", channel);
        }
        Ok(())
    }
}

// ============================================================================
// OUTBOX
// ============================================================================

/// Baut ausgehende Events im Namen des lokalen Teilnehmers und veröffentlicht sie
#[derive(Clone)]
pub struct Outbox {
    transport: Arc<dyn SignalingTransport>,
    local_user: String,
}

impl Outbox {
    pub fn new(transport: Arc<dyn SignalingTransport>, local_user: impl Into<String>) -> Self {
        Self {
            transport,
            local_user: local_user.into(),
        }
    }

    pub fn local_user(&self) -> &str {
        &self.local_user
    }

    pub fn transport(&self) -> &Arc<dyn SignalingTransport> {
        &self.transport
    }

    /// Veröffentlicht ein Event an `to`
    pub async fn send(
        &self,
        kind: EventKind,
        call_id: &CallId,
        to: &str,
    ) -> Result<SignalingEvent, SignalingError> {
        let event = SignalingEvent::new(kind, call_id.clone(), self.local_user.clone(), to);
        self.publish(&event).await?;
        Ok(event)
    }

    /// Veröffentlicht ein fertiges Event (z.B. die busy-Antwort der Registry)
    pub async fn publish(&self, event: &SignalingEvent) -> Result<(), SignalingError> {
        tracing::debug!(
            "Sending {} for call {} to {}",
            event.kind.name(),
            event.call_id,
            event.to
        );
        self.transport.publish(event).await
    }
}

impl std::fmt::Debug for Outbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbox")
            .field("local_user", &self.local_user)
            .finish()
    }
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport").finish()
    }
}
