//! Doorbell - Signaling und Anrufzustand für eine smarte Türklingel
//!
//! Zwei Teilnehmer (Klingel und Bewohner) handeln Anrufe über einen
//! externen Pub/Sub-Dienst aus:
//! - Signaling Event Model und Transport (WebSocket-Relay oder In-Process)
//! - Call Session Registry mit Busy-Arbitrierung und Ring-Timeout
//! - WebRTC Peer Connections für Audio/Video
//! - SQLite für den Anrufverlauf

pub mod agent;
pub mod call_engine;
pub mod config;
pub mod database;
pub mod signaling;

#[cfg(test)]
pub(crate) mod testing;

pub use agent::{AgentError, CallAgent, CallEvent};
pub use config::{Config, ConfigError};

use call_engine::{TrackMediaDevices, WebRtcPeerFactory};
use database::{CallLog, CallStatusSink, DatabaseError};
use signaling::{SignalingClient, SignalingError};
use std::sync::Arc;
use thiserror::Error;

/// Standardfilter, wenn `RUST_LOG` nicht gesetzt ist
pub const DEFAULT_LOG_FILTER: &str = "doorbell=debug,doorbell_lib=debug,webrtc=warn";

/// Installiert den `tracing` Subscriber (mehrfacher Aufruf ist harmlos)
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

// ============================================================================
// STARTUP
// ============================================================================

#[derive(Error, Debug)]
pub enum StartupError {
    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),
}

/// Verbindet mit dem Relay und startet einen Agent mit WebRTC und SQLite
pub async fn connect(config: &Config) -> Result<Arc<CallAgent>, StartupError> {
    tracing::info!("Starting doorbell agent for {}", config.user_id);

    let call_log = match &config.db_path {
        Some(path) => CallLog::open(path)?,
        None => CallLog::open_default()?,
    };
    let status_sink: Arc<dyn CallStatusSink> = Arc::new(call_log);

    let client =
        SignalingClient::connect(config.signaling_url.clone(), config.user_id.clone()).await?;
    let factory = Arc::new(WebRtcPeerFactory::new(config.ice_urls.clone()));
    let devices = Arc::new(TrackMediaDevices::default());

    let agent = CallAgent::start(config, client, factory, devices, status_sink).await?;
    Ok(agent)
}
