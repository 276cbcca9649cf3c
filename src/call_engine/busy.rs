//! Busy Arbitrator
//!
//! Zustandsloses Prädikat über die Einträge der Registry. Wird nur bei der
//! Annahme eines `call.request` gefragt, nie bei späteren Übergängen.

use super::state::LocalCallState;

/// Ein Benutzer ist besetzt, sobald er einen Anruf in `ringing` oder
/// `in_call` hat. Text-, Audio- und Videoanrufe zählen gleichermaßen.
pub fn is_busy<'a>(entries: impl IntoIterator<Item = &'a LocalCallState>) -> bool {
    entries.into_iter().any(|entry| entry.state.is_active())
}
