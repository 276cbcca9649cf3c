//! WebSocket Client für das Pub/Sub-Relay
//!
//! Verwaltet die WebSocket-Verbindung zum Relay:
//! - Kanal-Abonnements (`subscribe`/`unsubscribe`)
//! - Veröffentlichen von Signaling-Events
//! - Heartbeat-Keeping
//! - Validierung eingehender Events an der Grenze

use super::messages::*;
use super::transport::{ChannelTable, SignalingTransport};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

/// Relays wie Cloudflare Workers trennen inaktive Verbindungen
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum SignalingError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to signaling relay")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Relay error: {code} - {message}")]
    RelayError { code: i32, message: String },
}

// ============================================================================
// CONNECTION EVENTS
// ============================================================================

/// Events zum Zustand der Relay-Verbindung
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Verbunden mit dem Relay
    Connected,

    /// Verbindung getrennt
    Disconnected,

    /// Fehler vom Relay
    Error { code: i32, message: String },
}

// ============================================================================
// CLIENT STATE
// ============================================================================

#[derive(Debug, Clone, Default)]
struct ClientState {
    is_connected: bool,
    dropped_events: u64,
}

// ============================================================================
// SIGNALING CLIENT
// ============================================================================

/// WebSocket Client, der den `SignalingTransport`-Vertrag über ein Relay erfüllt
pub struct SignalingClient {
    server_url: String,
    user_id: String,
    state: Arc<RwLock<ClientState>>,
    tx: mpsc::Sender<String>,
    channels: Arc<ChannelTable>,
    event_tx: broadcast::Sender<ConnectionEvent>,
}

impl SignalingClient {
    /// Verbindet mit dem Relay und startet Read-, Write- und Heartbeat-Task
    pub async fn connect(
        server_url: String,
        user_id: String,
    ) -> Result<Arc<Self>, SignalingError> {
        let ws_url = websocket_url(&server_url)?;

        tracing::info!("Connecting to signaling relay: {}", ws_url);

        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        let (tx, mut rx) = mpsc::channel::<String>(100);
        let (event_tx, _) = broadcast::channel(16);

        let client = Arc::new(Self {
            server_url,
            user_id,
            state: Arc::new(RwLock::new(ClientState {
                is_connected: true,
                dropped_events: 0,
            })),
            tx,
            channels: Arc::new(ChannelTable::default()),
            event_tx,
        });

        let _ = client.event_tx.send(ConnectionEvent::Connected);

        // Read-Task
        let state = Arc::clone(&client.state);
        let channels = Arc::clone(&client.channels);
        let event_tx = client.event_tx.clone();
        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => {
                        Self::handle_relay_message(&text, &state, &channels, &event_tx);
                    }
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by relay");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            state.write().is_connected = false;
            let _ = event_tx.send(ConnectionEvent::Disconnected);
        });

        // Write-Task
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(Message::Text(msg)).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
        });

        Self::start_heartbeat(Arc::clone(&client));

        Ok(client)
    }

    /// Gibt einen Receiver für Verbindungs-Events zurück
    pub fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.event_tx.subscribe()
    }

    /// Prüft ob verbunden
    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }

    /// Anzahl verworfener (ungültiger) Events
    pub fn dropped_events(&self) -> u64 {
        self.state.read().dropped_events
    }

    /// Sendet einen Heartbeat
    pub async fn send_heartbeat(&self) -> Result<(), SignalingError> {
        self.send_frame(&ClientFrame::Heartbeat {
            user_id: &self.user_id,
        })
        .await
    }

    /// Serialisiert und sendet einen Frame
    async fn send_frame(&self, frame: &ClientFrame<'_>) -> Result<(), SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::NotConnected);
        }

        let msg_string =
            serde_json::to_string(frame).map_err(|e| SignalingError::SendFailed(e.to_string()))?;

        self.tx
            .send(msg_string)
            .await
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }

    /// Verarbeitet eingehende Relay-Nachrichten
    fn handle_relay_message(
        text: &str,
        state: &Arc<RwLock<ClientState>>,
        channels: &ChannelTable,
        event_tx: &broadcast::Sender<ConnectionEvent>,
    ) {
        let frame = match serde_json::from_str::<RelayFrame>(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!("Ignoring unknown relay frame: {}", e);
                return;
            }
        };

        match frame {
            RelayFrame::Event { channel, event } => match SignalingEvent::from_value(event) {
                Ok(event) => {
                    channels.deliver(&channel, event);
                }
                Err(e) => {
                    // Ungültige Events werden hier einmal verworfen
                    tracing::warn!("Dropping malformed event on {}: {}", channel, e);
                    state.write().dropped_events += 1;
                }
            },

            RelayFrame::Error { code, message } => {
                tracing::error!("Relay error {}: {}", code, message);
                let _ = event_tx.send(ConnectionEvent::Error { code, message });
            }

            RelayFrame::Pong => {
                // Heartbeat-Response - nichts zu tun
            }
        }
    }

    /// Startet einen Heartbeat-Task
    fn start_heartbeat(client: Arc<Self>) {
        let client = Arc::downgrade(&client);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(client) = client.upgrade() else {
                    break;
                };
                if !client.is_connected() {
                    tracing::info!("Heartbeat: client disconnected, stopping heartbeat task");
                    break;
                }
                if let Err(e) = client.send_heartbeat().await {
                    tracing::warn!("Failed to send heartbeat: {}", e);
                }
            }
        });
    }
}

#[async_trait]
impl SignalingTransport for SignalingClient {
    async fn publish(&self, event: &SignalingEvent) -> Result<(), SignalingError> {
        let channel = event.channel();
        self.send_frame(&ClientFrame::Publish {
            channel: &channel,
            event,
        })
        .await
    }

    async fn subscribe(
        &self,
        channel: &str,
    ) -> Result<broadcast::Receiver<SignalingEvent>, SignalingError> {
        let first = !self.channels.contains(channel);
        let rx = self.channels.subscribe(channel);
        if first {
            self.send_frame(&ClientFrame::Subscribe { channel }).await?;
        }
        Ok(rx)
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), SignalingError> {
        self.channels.remove(channel);
        self.send_frame(&ClientFrame::Unsubscribe { channel }).await
    }
}

impl std::fmt::Debug for SignalingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingClient")
            .field("server_url", &self.server_url)
            .field("user_id", &self.user_id)
            .field("state", &*self.state.read())
            .finish()
    }
}

/// Baut die WebSocket-URL (`http` → `ws`, Standardpfad `/ws`)
fn websocket_url(server_url: &str) -> Result<Url, SignalingError> {
    let mut url =
        Url::parse(server_url).map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(SignalingError::ConnectionFailed(format!(
                "unsupported scheme: {}",
                other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| SignalingError::ConnectionFailed("invalid scheme".to_string()))?;

    if url.path().is_empty() || url.path() == "/" {
        url.set_path("/ws");
    }

    Ok(url)
}
