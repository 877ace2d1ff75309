// SPDX-License-Identifier: MIT OR Apache-2.0
//! Booking persistence: rows, per-booking locks, and transitions that are
//! atomic with their audit event.

use crate::PipelineError;
use chrono::Utc;
use knj_audit::{AuditKind, AuditLog, Db, NewAuditEvent};
use knj_core::{Booking, BookingStatus, BlobId, DocClass, VerifiedDoc};
use parking_lot::Mutex;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Filter for booking listings.
#[derive(Debug, Clone, Default)]
pub struct BookingFilter {
    /// Restrict to one status.
    pub status: Option<BookingStatus>,
    /// Restrict to one client.
    pub client_id: Option<String>,
}

/// Listing row for the approval UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingSummary {
    /// Booking id.
    pub id: Uuid,
    /// Client.
    pub client_id: String,
    /// Document class.
    pub class: DocClass,
    /// Current status.
    pub status: BookingStatus,
    /// Gross total rendered for the list, when entries exist.
    pub gross: Option<String>,
    /// Creation time, RFC 3339.
    pub created_at: String,
}

/// Review context stored next to a booking: the verified document and the
/// blockers that forced `needs_review`, if any.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReviewContext {
    /// The verified document, once verification ran.
    pub verified: Option<VerifiedDoc>,
    /// Human-readable blocker descriptions.
    pub blockers: Vec<String>,
    /// Operator override note, when a rule check was overridden.
    pub override_note: Option<String>,
}

/// SQLite-backed booking store with per-booking async locks.
pub struct BookingStore {
    db: Db,
    audit: Arc<AuditLog>,
    locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl BookingStore {
    /// Attach to the shared database, creating tables if needed.
    pub fn open(db: Db, audit: Arc<AuditLog>) -> Result<Self, PipelineError> {
        {
            let conn = db.lock();
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS bookings (
                    id          TEXT PRIMARY KEY,
                    client_id   TEXT NOT NULL,
                    doc_class   TEXT NOT NULL,
                    status      TEXT NOT NULL,
                    fingerprint TEXT,
                    blob_id     TEXT,
                    body        TEXT NOT NULL,
                    created_at  TEXT NOT NULL,
                    updated_at  TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_bookings_status
                    ON bookings (status, client_id);
                CREATE INDEX IF NOT EXISTS idx_bookings_source
                    ON bookings (client_id, doc_class, blob_id);
                CREATE TABLE IF NOT EXISTS booking_reviews (
                    booking_id TEXT PRIMARY KEY REFERENCES bookings(id),
                    context    TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS supplier_accounts (
                    client_id    TEXT NOT NULL,
                    supplier_oib TEXT NOT NULL,
                    iban         TEXT NOT NULL,
                    updated_at   TEXT NOT NULL,
                    PRIMARY KEY (client_id, supplier_oib)
                );",
            )?;
        }
        Ok(Self {
            db,
            audit,
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// The per-booking lock. Operator actions and pipeline steps on the
    /// same booking serialize here; the first acquirer wins and the loser
    /// sees a stale status, i.e. a `StateConflict`.
    pub fn lock_for(&self, id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        Arc::clone(locks.entry(id).or_default())
    }

    /// Insert a new booking and audit its creation.
    pub fn insert(&self, booking: &Booking) -> Result<(), PipelineError> {
        let body = serde_json::to_string(booking)?;
        let fingerprint = booking.fingerprint()?.0;
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO bookings
                (id, client_id, doc_class, status, fingerprint, blob_id, body,
                 created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            params![
                booking.id.to_string(),
                booking.client_id,
                booking.class.to_string(),
                booking.status.to_string(),
                fingerprint,
                booking.source.as_ref().map(|b| b.0.clone()),
                body,
                Utc::now().to_rfc3339(),
            ],
        )?;
        self.audit.append_tx(
            &tx,
            NewAuditEvent {
                actor: "pipeline".into(),
                kind: AuditKind::StateTransition,
                subject_id: booking.id.to_string(),
                payload: serde_json::json!({
                    "from": null,
                    "to": booking.status.to_string(),
                    "client_id": booking.client_id,
                }),
            },
        )?;
        tx.commit()?;
        debug!(booking = %booking.id, "booking inserted");
        Ok(())
    }

    /// Load a booking by id.
    pub fn get(&self, id: Uuid) -> Result<Booking, PipelineError> {
        let conn = self.db.lock();
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM bookings WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        let body = body.ok_or(PipelineError::NotFound(id))?;
        Ok(serde_json::from_str(&body)?)
    }

    /// List bookings matching the filter, newest first.
    pub fn list(&self, filter: &BookingFilter) -> Result<Vec<BookingSummary>, PipelineError> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT body, created_at FROM bookings
             WHERE (?1 IS NULL OR status = ?1)
               AND (?2 IS NULL OR client_id = ?2)
             ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map(
            params![
                filter.status.map(|s| s.to_string()),
                filter.client_id.as_deref(),
            ],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
        )?;
        let mut out = Vec::new();
        for row in rows {
            let (body, created_at) = row?;
            let booking: Booking = serde_json::from_str(&body)?;
            out.push(BookingSummary {
                id: booking.id,
                client_id: booking.client_id.clone(),
                class: booking.class,
                status: booking.status,
                gross: booking.gross_total().map(|m| m.to_string()),
                created_at,
            });
        }
        Ok(out)
    }

    /// Booking already created for this exact source document, if any.
    pub fn find_by_source(
        &self,
        client_id: &str,
        doc_class: DocClass,
        blob_id: &BlobId,
    ) -> Result<Option<Uuid>, PipelineError> {
        let conn = self.db.lock();
        let id: Option<String> = conn
            .query_row(
                "SELECT id FROM bookings
                 WHERE client_id = ?1 AND doc_class = ?2 AND blob_id = ?3
                 ORDER BY created_at ASC LIMIT 1",
                params![client_id, doc_class.to_string(), blob_id.0],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id.and_then(|s| Uuid::parse_str(&s).ok()))
    }

    /// A live booking with the same proposal fingerprint, if any.
    pub fn find_duplicate_proposal(
        &self,
        client_id: &str,
        fingerprint: &str,
        excluding: Uuid,
    ) -> Result<Option<Uuid>, PipelineError> {
        let conn = self.db.lock();
        let id: Option<String> = conn
            .query_row(
                "SELECT id FROM bookings
                 WHERE client_id = ?1 AND fingerprint = ?2 AND id != ?3
                   AND status IN ('proposed', 'approved', 'exported')
                 LIMIT 1",
                params![client_id, fingerprint, excluding.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id.and_then(|s| Uuid::parse_str(&s).ok()))
    }

    /// Transition a booking, updating its body in the same transaction as
    /// the audit event.
    ///
    /// `expected_from` is the optimistic-concurrency check: if the stored
    /// status differs, another actor got there first and the caller
    /// receives [`PipelineError::StateConflict`].
    pub fn transition(
        &self,
        booking: &mut Booking,
        expected_from: BookingStatus,
        to: BookingStatus,
        actor: &str,
        detail: serde_json::Value,
    ) -> Result<(), PipelineError> {
        self.transition_with(booking, expected_from, to, actor, detail, |_| Ok(()))
    }

    /// [`transition`](Self::transition) with extra statements executed in
    /// the same transaction — the exporter inserts its receipt here so the
    /// `exported` flip and the receipt are one atomic unit.
    pub fn transition_with<F>(
        &self,
        booking: &mut Booking,
        expected_from: BookingStatus,
        to: BookingStatus,
        actor: &str,
        detail: serde_json::Value,
        extra: F,
    ) -> Result<(), PipelineError>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> rusqlite::Result<()>,
    {
        if !expected_from.can_transition_to(to) {
            return Err(PipelineError::InvalidTransition {
                from: expected_from,
                to,
            });
        }

        let mut conn = self.db.lock();
        let tx = conn.transaction()?;

        let stored: Option<String> = tx
            .query_row(
                "SELECT status FROM bookings WHERE id = ?1",
                params![booking.id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        let stored = stored.ok_or(PipelineError::NotFound(booking.id))?;
        if stored != expected_from.to_string() {
            return Err(PipelineError::StateConflict {
                id: booking.id,
                current: stored,
            });
        }

        booking.status = to;
        if to.is_terminal() {
            booking.finalized_at = Some(Utc::now());
        }
        let body = serde_json::to_string(&*booking)?;
        let fingerprint = booking.fingerprint()?.0;
        tx.execute(
            "UPDATE bookings
             SET status = ?1, body = ?2, fingerprint = ?3, updated_at = ?4
             WHERE id = ?5",
            params![
                to.to_string(),
                body,
                fingerprint,
                Utc::now().to_rfc3339(),
                booking.id.to_string(),
            ],
        )?;
        extra(&tx)?;
        self.audit.append_tx(
            &tx,
            NewAuditEvent {
                actor: actor.to_string(),
                kind: AuditKind::StateTransition,
                subject_id: booking.id.to_string(),
                payload: serde_json::json!({
                    "from": expected_from.to_string(),
                    "to": to.to_string(),
                    "detail": detail,
                }),
            },
        )?;
        tx.commit()?;
        debug!(booking = %booking.id, from = %expected_from, to = %to, "transition");
        Ok(())
    }

    /// Store the review context (verified doc + blockers) for a booking.
    pub fn save_review(&self, id: Uuid, context: &ReviewContext) -> Result<(), PipelineError> {
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO booking_reviews (booking_id, context) VALUES (?1, ?2)
             ON CONFLICT (booking_id) DO UPDATE SET context = excluded.context",
            params![id.to_string(), serde_json::to_string(context)?],
        )?;
        Ok(())
    }

    /// Load the review context for a booking.
    pub fn review(&self, id: Uuid) -> Result<ReviewContext, PipelineError> {
        let conn = self.db.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT context FROM booking_reviews WHERE booking_id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(ReviewContext::default()),
        }
    }

    /// Remembered bank account for a supplier, if any.
    pub fn known_supplier_iban(
        &self,
        client_id: &str,
        supplier_oib: &str,
    ) -> Result<Option<String>, PipelineError> {
        let conn = self.db.lock();
        Ok(conn
            .query_row(
                "SELECT iban FROM supplier_accounts
                 WHERE client_id = ?1 AND supplier_oib = ?2",
                params![client_id, supplier_oib],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Memorize a supplier's bank account (called on approval).
    pub fn remember_supplier_iban(
        &self,
        client_id: &str,
        supplier_oib: &str,
        iban: &str,
    ) -> Result<(), PipelineError> {
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO supplier_accounts (client_id, supplier_oib, iban, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (client_id, supplier_oib)
             DO UPDATE SET iban = excluded.iban, updated_at = excluded.updated_at",
            params![client_id, supplier_oib, iban, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// The shared database handle (for the exporter's receipt transaction).
    #[must_use]
    pub fn db(&self) -> Db {
        Arc::clone(&self.db)
    }

    /// The audit log this store appends to.
    #[must_use]
    pub fn audit(&self) -> Arc<AuditLog> {
        Arc::clone(&self.audit)
    }
}
