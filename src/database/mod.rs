//! Database Module - Anrufprotokoll
//!
//! Persistenz-Kollaborator für `updateCallStatus(callId, status)`.

mod call_log;

pub use call_log::{CallLog, CallRecord, DatabaseError};

use crate::call_engine::{CallId, CallStatus};

/// Empfänger für Statusänderungen (pending/answered/missed/ended)
///
/// Aufrufe passieren auf einem Blocking-Task; Fehler werden nur geloggt und
/// halten den Zustandsübergang nie auf.
pub trait CallStatusSink: Send + Sync {
    fn update_call_status(&self, call_id: &CallId, status: CallStatus)
        -> Result<(), DatabaseError>;
}

/// Verwirft alle Updates (Betrieb ohne Datenbank)
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStatusSink;

impl CallStatusSink for NoopStatusSink {
    fn update_call_status(
        &self,
        _call_id: &CallId,
        _status: CallStatus,
    ) -> Result<(), DatabaseError> {
        Ok(())
    }
}
