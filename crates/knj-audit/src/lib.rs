// SPDX-License-Identifier: MIT OR Apache-2.0
//! Append-only, hash-chained audit log.
//!
//! Every state transition, operator action, export receipt, memory-rule
//! change, corpus change, model swap, and auth decision lands here. Each
//! event links to its predecessor by hash; [`AuditLog::verify`] recomputes
//! the chain and reports the first break. A broken chain seals the log:
//! further writes are refused and the process is expected to exit with
//! code 4.
//!
//! This crate also owns the shared SQLite handle ([`Db`]). Stores that
//! must commit atomically with an audit append (booking transitions,
//! export receipts) attach to the same connection and use
//! [`AuditLog::append_tx`] inside their transaction.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use knj_core::{canonical_json, sha256_hex};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};

/// Shared handle to the single SQLite database file.
pub type Db = Arc<Mutex<Connection>>;

/// Open (or create) the database file and apply pragmas.
pub fn open_db(path: &Path) -> Result<Db, AuditError> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(Arc::new(Mutex::new(conn)))
}

/// In-memory database for tests.
pub fn open_db_in_memory() -> Result<Db, AuditError> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    Ok(Arc::new(Mutex::new(conn)))
}

/// The zero hash that anchors the chain.
pub const GENESIS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// What kind of event is being recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    /// Login success, failure, or lockout.
    AuthDecision,
    /// A booking moved between states.
    StateTransition,
    /// Approve / reject / correct / override by an operator.
    OperatorAction,
    /// An export receipt was issued.
    ExportReceipt,
    /// An L2 memory rule was created or reinforced.
    MemoryRule,
    /// Conflicting corrections split an L2 rule.
    MemoryConflict,
    /// A legal corpus chunk was ingested, confirmed, or superseded.
    CorpusChange,
    /// The primary model handle was swapped.
    ModelSwap,
    /// A request was refused on safety grounds.
    SafetyRefusal,
    /// A subcomponent failure left a booking in place.
    PipelineFailure,
}

impl fmt::Display for AuditKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = serde_json::to_value(self).map_err(|_| fmt::Error)?;
        f.write_str(v.as_str().ok_or(fmt::Error)?)
    }
}

/// An event not yet in the chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAuditEvent {
    /// Acting principal: `user:<name>`, `pipeline`, or `system`.
    pub actor: String,
    /// Event kind.
    pub kind: AuditKind,
    /// Identifier of the affected subject (booking id, chunk id, user).
    pub subject_id: String,
    /// Structured event payload.
    pub payload: serde_json::Value,
}

/// A chained, persisted audit event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Dense, monotonically increasing sequence number starting at 1.
    pub seq: u64,
    /// When the event was appended.
    pub timestamp: DateTime<Utc>,
    /// Acting principal.
    pub actor: String,
    /// Event kind.
    pub kind: AuditKind,
    /// Affected subject.
    pub subject_id: String,
    /// SHA-256 of the canonical payload.
    pub payload_hash: String,
    /// Hash of the predecessor event ([`GENESIS_HASH`] for seq 1).
    pub prev_hash: String,
    /// This event's chain hash.
    pub hash: String,
    /// The payload itself.
    pub payload: serde_json::Value,
}

/// Errors from audit log operations.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// Database failure.
    #[error("audit db: {0}")]
    Db(#[from] rusqlite::Error),

    /// Payload failed to serialize canonically.
    #[error("audit payload: {0}")]
    Payload(#[from] serde_json::Error),

    /// The chain failed verification. Fatal.
    #[error("audit chain broken at seq {seq}: {detail}")]
    ChainBroken {
        /// Sequence number of the first broken event.
        seq: u64,
        /// What failed: hash link, dense sequence, or payload hash.
        detail: String,
    },

    /// The log was sealed after an integrity failure; writes are refused.
    #[error("audit log is sealed after an integrity failure")]
    Sealed,
}

// ---------------------------------------------------------------------------
// AuditLog
// ---------------------------------------------------------------------------

/// Single-writer, hash-chained audit log over the shared database.
pub struct AuditLog {
    db: Db,
    sealed: AtomicBool,
}

impl AuditLog {
    /// Attach to the shared database, creating the table if needed.
    pub fn open(db: Db) -> Result<Self, AuditError> {
        {
            let conn = db.lock();
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS audit_events (
                    seq          INTEGER PRIMARY KEY,
                    timestamp    TEXT NOT NULL,
                    actor        TEXT NOT NULL,
                    kind         TEXT NOT NULL,
                    subject_id   TEXT NOT NULL,
                    payload_hash TEXT NOT NULL,
                    prev_hash    TEXT NOT NULL,
                    hash         TEXT NOT NULL,
                    payload      TEXT NOT NULL
                );",
            )?;
        }
        Ok(Self {
            db,
            sealed: AtomicBool::new(false),
        })
    }

    /// The shared database handle, for stores that transact with the log.
    #[must_use]
    pub fn db(&self) -> Db {
        Arc::clone(&self.db)
    }

    /// Returns `true` once the log refuses writes.
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }

    /// Seal the log after an external integrity failure.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::SeqCst);
        error!("audit log sealed; no further writes will be accepted");
    }

    /// Append an event, assigning the next dense sequence number.
    pub fn append(&self, event: NewAuditEvent) -> Result<AuditEvent, AuditError> {
        if self.is_sealed() {
            return Err(AuditError::Sealed);
        }
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        let appended = self.append_inner(&tx, event)?;
        tx.commit()?;
        Ok(appended)
    }

    /// Append inside a caller-held transaction on the shared connection.
    ///
    /// This is what makes a booking transition and its audit event one
    /// atomic unit: the caller opens the transaction, updates its own
    /// rows, appends here, and commits.
    pub fn append_tx(
        &self,
        tx: &rusqlite::Transaction<'_>,
        event: NewAuditEvent,
    ) -> Result<AuditEvent, AuditError> {
        if self.is_sealed() {
            return Err(AuditError::Sealed);
        }
        self.append_inner(tx, event)
    }

    fn append_inner(
        &self,
        tx: &rusqlite::Transaction<'_>,
        event: NewAuditEvent,
    ) -> Result<AuditEvent, AuditError> {
        let (last_seq, prev_hash): (u64, String) = tx
            .query_row(
                "SELECT seq, hash FROM audit_events ORDER BY seq DESC LIMIT 1",
                [],
                |row| Ok((row.get::<_, i64>(0)? as u64, row.get(1)?)),
            )
            .optional()?
            .unwrap_or((0, GENESIS_HASH.to_string()));

        let seq = last_seq + 1;
        let timestamp = Utc::now();
        let payload_hash = sha256_hex(canonical_json(&event.payload)?.as_bytes());
        let envelope = canonical_json(&serde_json::json!({
            "seq": seq,
            "timestamp": timestamp.to_rfc3339(),
            "actor": event.actor,
            "kind": event.kind,
            "subject_id": event.subject_id,
            "payload_hash": payload_hash,
        }))?;
        let hash = sha256_hex(format!("{prev_hash}{envelope}").as_bytes());

        tx.execute(
            "INSERT INTO audit_events
                (seq, timestamp, actor, kind, subject_id, payload_hash, prev_hash, hash, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                seq as i64,
                timestamp.to_rfc3339(),
                event.actor,
                serde_json::to_value(event.kind)?.as_str().unwrap_or(""),
                event.subject_id,
                payload_hash,
                prev_hash,
                hash,
                serde_json::to_string(&event.payload)?,
            ],
        )?;

        Ok(AuditEvent {
            seq,
            timestamp,
            actor: event.actor,
            kind: event.kind,
            subject_id: event.subject_id,
            payload_hash,
            prev_hash,
            hash,
            payload: event.payload,
        })
    }

    /// Read events in `[from_seq, to_seq]` inclusive, ascending.
    pub fn events(&self, from_seq: u64, to_seq: u64) -> Result<Vec<AuditEvent>, AuditError> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT seq, timestamp, actor, kind, subject_id, payload_hash, prev_hash, hash, payload
             FROM audit_events WHERE seq >= ?1 AND seq <= ?2 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![from_seq as i64, to_seq as i64], row_to_event)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Highest assigned sequence number, or 0 for an empty log.
    pub fn last_seq(&self) -> Result<u64, AuditError> {
        let conn = self.db.lock();
        let seq: Option<i64> = conn
            .query_row("SELECT MAX(seq) FROM audit_events", [], |row| row.get(0))
            .optional()?
            .flatten();
        Ok(seq.unwrap_or(0) as u64)
    }

    /// Verify the chain over `[from_seq, to_seq]`.
    ///
    /// Recomputes every payload hash and chain link, checks sequence
    /// density, and seals the log on the first break.
    pub fn verify(&self, from_seq: u64, to_seq: u64) -> Result<(), AuditError> {
        let events = self.events(from_seq, to_seq)?;
        let mut expected_prev: Option<String> = None;
        let mut expected_seq = from_seq.max(1);

        if from_seq <= 1 {
            expected_prev = Some(GENESIS_HASH.to_string());
        } else {
            let conn = self.db.lock();
            let prev: Option<String> = conn
                .query_row(
                    "SELECT hash FROM audit_events WHERE seq = ?1",
                    params![(from_seq - 1) as i64],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(prev) = prev {
                expected_prev = Some(prev);
            }
        }

        for event in &events {
            if event.seq != expected_seq {
                return self.broken(event.seq, format!("expected seq {expected_seq}"));
            }
            let payload_hash = sha256_hex(canonical_json(&event.payload)?.as_bytes());
            if payload_hash != event.payload_hash {
                return self.broken(event.seq, "payload hash mismatch".into());
            }
            if let Some(prev) = &expected_prev
                && *prev != event.prev_hash
            {
                return self.broken(event.seq, "previous-hash link mismatch".into());
            }
            let envelope = canonical_json(&serde_json::json!({
                "seq": event.seq,
                "timestamp": event.timestamp.to_rfc3339(),
                "actor": event.actor,
                "kind": event.kind,
                "subject_id": event.subject_id,
                "payload_hash": event.payload_hash,
            }))?;
            let recomputed = sha256_hex(format!("{}{envelope}", event.prev_hash).as_bytes());
            if recomputed != event.hash {
                return self.broken(event.seq, "event hash mismatch".into());
            }
            expected_prev = Some(event.hash.clone());
            expected_seq += 1;
        }

        info!(from = from_seq, to = to_seq, count = events.len(), "audit chain verified");
        Ok(())
    }

    fn broken(&self, seq: u64, detail: String) -> Result<(), AuditError> {
        self.seal();
        Err(AuditError::ChainBroken { seq, detail })
    }
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditEvent> {
    let kind_str: String = row.get(3)?;
    let kind: AuditKind = serde_json::from_value(serde_json::Value::String(kind_str))
        .unwrap_or(AuditKind::PipelineFailure);
    let timestamp: String = row.get(1)?;
    let payload: String = row.get(8)?;
    Ok(AuditEvent {
        seq: row.get::<_, i64>(0)? as u64,
        timestamp: DateTime::parse_from_rfc3339(&timestamp)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        actor: row.get(2)?,
        kind,
        subject_id: row.get(4)?,
        payload_hash: row.get(5)?,
        prev_hash: row.get(6)?,
        hash: row.get(7)?,
        payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log() -> AuditLog {
        AuditLog::open(open_db_in_memory().unwrap()).unwrap()
    }

    fn event(subject: &str) -> NewAuditEvent {
        NewAuditEvent {
            actor: "pipeline".into(),
            kind: AuditKind::StateTransition,
            subject_id: subject.into(),
            payload: serde_json::json!({ "from": "ingested", "to": "extracted" }),
        }
    }

    #[test]
    fn appends_assign_dense_sequence() {
        let log = log();
        let a = log.append(event("b1")).unwrap();
        let b = log.append(event("b2")).unwrap();
        let c = log.append(event("b3")).unwrap();
        assert_eq!((a.seq, b.seq, c.seq), (1, 2, 3));
        assert_eq!(a.prev_hash, GENESIS_HASH);
        assert_eq!(b.prev_hash, a.hash);
        assert_eq!(c.prev_hash, b.hash);
    }

    #[test]
    fn verify_accepts_intact_chain() {
        let log = log();
        for i in 0..10 {
            log.append(event(&format!("b{i}"))).unwrap();
        }
        log.verify(1, 10).unwrap();
        // Partial ranges verify too.
        log.verify(4, 8).unwrap();
    }

    #[test]
    fn tampered_payload_breaks_chain_and_seals() {
        let log = log();
        for i in 0..5 {
            log.append(event(&format!("b{i}"))).unwrap();
        }
        {
            let conn = log.db();
            let conn = conn.lock();
            conn.execute(
                "UPDATE audit_events SET payload = '{\"forged\":true}' WHERE seq = 3",
                [],
            )
            .unwrap();
        }
        let err = log.verify(1, 5).unwrap_err();
        match err {
            AuditError::ChainBroken { seq, .. } => assert_eq!(seq, 3),
            other => panic!("unexpected: {other}"),
        }
        assert!(log.is_sealed());
        assert!(matches!(log.append(event("b9")), Err(AuditError::Sealed)));
    }

    #[test]
    fn deleted_row_breaks_density() {
        let log = log();
        for i in 0..5 {
            log.append(event(&format!("b{i}"))).unwrap();
        }
        {
            let conn = log.db();
            let conn = conn.lock();
            conn.execute("DELETE FROM audit_events WHERE seq = 2", [])
                .unwrap();
        }
        assert!(log.verify(1, 5).is_err());
    }

    #[test]
    fn events_range_is_inclusive() {
        let log = log();
        for i in 0..5 {
            log.append(event(&format!("b{i}"))).unwrap();
        }
        let events = log.events(2, 4).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].seq, 2);
        assert_eq!(events[2].seq, 4);
    }
}
