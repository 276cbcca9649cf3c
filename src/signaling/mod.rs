//! Signaling Module - Event-Modell und Pub/Sub-Transport
//!
//! Dieses Modul verwaltet die Kommunikation zwischen den Teilnehmern:
//! - Geschlossenes Event-Modell (`call.request` … `call.status`)
//! - Transport-Vertrag (Publish/Subscribe auf benannten Kanälen)
//! - WebSocket-Client für ein externes Relay
//!

mod client;
mod messages;
mod transport;

pub use client::{ConnectionEvent, SignalingClient, SignalingError};
pub use messages::*;
pub use transport::{MemoryTransport, Outbox, SignalingTransport};
