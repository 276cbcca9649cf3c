//! Call Log Database
//!
//! SQLite-Datenbank für den Anrufverlauf.
//! Speichert pro Call-ID den letzten Status.

use super::CallStatusSink;
use crate::call_engine::{CallId, CallStatus};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Result as SqliteResult};
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to create database directory: {0}")]
    DirectoryCreation(#[from] std::io::Error),

    #[error("Unknown call status in database: {0}")]
    InvalidStatus(String),
}

// ============================================================================
// CALL RECORD
// ============================================================================

/// Ein Eintrag im Anrufverlauf
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallRecord {
    pub call_id: String,
    pub status: CallStatus,
    pub created_at: String,
    pub updated_at: String,
}

// ============================================================================
// DATABASE
// ============================================================================

/// SQLite-Anrufprotokoll (Thread-safe durch Mutex)
pub struct CallLog {
    conn: Mutex<Connection>,
}

impl CallLog {
    /// Öffnet oder erstellt die Datenbank am Standardpfad
    pub fn open_default() -> Result<Self, DatabaseError> {
        let db_path = Self::default_path()?;
        Self::open(&db_path)
    }

    /// Öffnet oder erstellt die Datenbank unter `path`
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        // Parent-Verzeichnis erstellen
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        tracing::info!("Opening call log at {:?}", path);

        let conn = Connection::open(path)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;

        Ok(db)
    }

    /// In-Memory Datenbank (Tests, Betrieb ohne Datei)
    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Ermittelt den Pfad zur Datenbank-Datei
    pub fn default_path() -> Result<PathBuf, DatabaseError> {
        let proj_dirs = directories::ProjectDirs::from("com", "doorbell", "doorbell")
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "Could not determine app data directory",
                )
            })?;

        let mut path = proj_dirs.data_dir().to_path_buf();
        path.push("calls.db");
        Ok(path)
    }

    /// Initialisiert das Datenbank-Schema
    fn init_schema(&self) -> Result<(), DatabaseError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS calls (
                call_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE INDEX IF NOT EXISTS idx_calls_status ON calls(status)
            "#,
            [],
        )?;

        Ok(())
    }

    /// Setzt den Status eines Anrufs (legt ihn bei Bedarf an)
    pub fn set_status(&self, call_id: &CallId, status: CallStatus) -> Result<(), DatabaseError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO calls (call_id, status)
            VALUES (?1, ?2)
            ON CONFLICT(call_id) DO UPDATE SET
                status = excluded.status,
                updated_at = datetime('now')
            "#,
            params![call_id.as_str(), status.as_str()],
        )?;
        Ok(())
    }

    /// Liest den letzten Status eines Anrufs
    pub fn get_status(&self, call_id: &CallId) -> Result<Option<CallStatus>, DatabaseError> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT status FROM calls WHERE call_id = ?1",
                params![call_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        raw.map(|value| CallStatus::parse(&value).ok_or(DatabaseError::InvalidStatus(value)))
            .transpose()
    }

    /// Die letzten `limit` Anrufe, neueste zuerst
    pub fn recent_calls(&self, limit: usize) -> Result<Vec<CallRecord>, DatabaseError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT call_id, status, created_at, updated_at
            FROM calls
            ORDER BY updated_at DESC, rowid DESC
            LIMIT ?1
            "#,
        )?;

        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<SqliteResult<Vec<_>>>()?;

        rows.into_iter()
            .map(|(call_id, status, created_at, updated_at)| {
                let status =
                    CallStatus::parse(&status).ok_or(DatabaseError::InvalidStatus(status))?;
                Ok(CallRecord {
                    call_id,
                    status,
                    created_at,
                    updated_at,
                })
            })
            .collect()
    }
}

impl CallStatusSink for CallLog {
    fn update_call_status(&self, call_id: &CallId, status: CallStatus) -> Result<(), DatabaseError> {
        self.set_status(call_id, status)
    }
}

// ============================================================================
// TESTS
// ============================================================================
