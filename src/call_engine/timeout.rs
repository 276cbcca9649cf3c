//! Timeout Supervisor
//!
//! Hängt eine einzelne verzögerte Cleanup-Aktion an Anrufe in `ringing`.
//! Abgelaufene Deadlines werden als `Expired` über einen Channel gemeldet;
//! veraltete Meldungen (nach `cancel`) erkennt `claim` an der Generation.

use super::state::CallId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Standard-Deadline für unbeantwortete Anrufe
pub const DEFAULT_RING_TIMEOUT: Duration = Duration::from_secs(30);

/// Meldung einer abgelaufenen Deadline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expired {
    pub call_id: CallId,
    generation: u64,
}

struct Pending {
    generation: u64,
    task: JoinHandle<()>,
}

pub struct TimeoutSupervisor {
    deadline: Duration,
    pending: Mutex<HashMap<CallId, Pending>>,
    next_generation: Mutex<u64>,
    expired_tx: mpsc::UnboundedSender<Expired>,
}

impl TimeoutSupervisor {
    /// Erstellt einen Supervisor und den Receiver für abgelaufene Deadlines
    pub fn new(deadline: Duration) -> (Self, mpsc::UnboundedReceiver<Expired>) {
        let (expired_tx, expired_rx) = mpsc::unbounded_channel();
        (
            Self {
                deadline,
                pending: Mutex::new(HashMap::new()),
                next_generation: Mutex::new(0),
                expired_tx,
            },
            expired_rx,
        )
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Setzt die Deadline für einen Anruf (ersetzt eine bestehende)
    pub fn arm(&self, call_id: &CallId) {
        let generation = {
            let mut next = self.next_generation.lock();
            *next += 1;
            *next
        };

        let tx = self.expired_tx.clone();
        let deadline = self.deadline;
        let expired = Expired {
            call_id: call_id.clone(),
            generation,
        };
        let task = tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            let _ = tx.send(expired);
        });

        if let Some(previous) = self
            .pending
            .lock()
            .insert(call_id.clone(), Pending { generation, task })
        {
            previous.task.abort();
        }

        tracing::debug!("Armed {:?} ring timeout for call {}", deadline, call_id);
    }

    /// Bricht eine ausstehende Deadline ab; `true` wenn eine aktiv war
    pub fn cancel(&self, call_id: &CallId) -> bool {
        match self.pending.lock().remove(call_id) {
            Some(pending) => {
                pending.task.abort();
                tracing::debug!("Cancelled ring timeout for call {}", call_id);
                true
            }
            None => false,
        }
    }

    /// Übernimmt eine Ablaufmeldung, wenn sie noch aktuell ist
    pub fn claim(&self, expired: &Expired) -> bool {
        let mut pending = self.pending.lock();
        match pending.get(&expired.call_id) {
            Some(current) if current.generation == expired.generation => {
                pending.remove(&expired.call_id);
                true
            }
            _ => false,
        }
    }

    pub fn is_armed(&self, call_id: &CallId) -> bool {
        self.pending.lock().contains_key(call_id)
    }

    pub fn armed_count(&self) -> usize {
        self.pending.lock().len()
    }
}

impl Drop for TimeoutSupervisor {
    fn drop(&mut self) {
        for (_, pending) in self.pending.lock().drain() {
            pending.task.abort();
        }
    }
}

impl std::fmt::Debug for TimeoutSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutSupervisor")
            .field("deadline", &self.deadline)
            .field("armed", &self.armed_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_deadline_fires_after_timeout() {
        let (supervisor, mut expired_rx) = TimeoutSupervisor::new(DEFAULT_RING_TIMEOUT);
        supervisor.arm(&CallId::from("C3"));

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(expired_rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(2)).await;
        let expired = expired_rx.recv().await.unwrap();
        assert_eq!(expired.call_id, CallId::from("C3"));
        assert!(supervisor.claim(&expired));
        assert!(!supervisor.is_armed(&CallId::from("C3")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_expiry() {
        let (supervisor, mut expired_rx) = TimeoutSupervisor::new(DEFAULT_RING_TIMEOUT);
        supervisor.arm(&CallId::from("C1"));

        assert!(supervisor.cancel(&CallId::from("C1")));
        assert!(!supervisor.cancel(&CallId::from("C1")));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(expired_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_invalidates_previous_generation() {
        let (supervisor, _expired_rx) = TimeoutSupervisor::new(Duration::from_secs(5));
        supervisor.arm(&CallId::from("C1"));
        let stale = Expired {
            call_id: CallId::from("C1"),
            generation: 1,
        };
        supervisor.arm(&CallId::from("C1"));

        assert!(!supervisor.claim(&stale));
        assert!(supervisor.is_armed(&CallId::from("C1")));
        assert_eq!(supervisor.armed_count(), 1);
    }
}
