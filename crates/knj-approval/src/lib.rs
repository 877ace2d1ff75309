// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = "Operator-facing approval gateway."]
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! Everything an operator can do to a booking goes through here: list,
//! inspect, approve, reject, correct. Authorization is by role, every
//! call is audited with its actor, and corrections spawn a successor
//! booking that re-enters verification.

use chrono::Utc;
use knj_audit::{AuditKind, AuditLog, NewAuditEvent};
use knj_core::{Booking, BookingStatus, CitationRef, Entry, VatBreakdown};
use knj_error::{ErrorCode, KnjError};
use knj_memory::{MemoryStore, RuleKey};
use knj_pipeline::{
    BookingFilter, BookingStore, BookingSummary, Pipeline, PipelineError, ReviewContext,
};
use knj_auth::Session;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Errors from the approval gateway.
#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    /// The caller's role does not permit the operation.
    #[error("role {0} may not decide bookings")]
    Forbidden(String),

    /// Underlying pipeline / store failure.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// Memory store failure.
    #[error(transparent)]
    Memory(#[from] knj_memory::MemoryError),

    /// Audit failure.
    #[error(transparent)]
    Audit(#[from] knj_audit::AuditError),

    /// The patch is unusable (e.g. empty).
    #[error("invalid patch: {0}")]
    InvalidPatch(String),
}

impl From<&ApprovalError> for KnjError {
    fn from(err: &ApprovalError) -> Self {
        match err {
            ApprovalError::Forbidden(_) => KnjError::new(ErrorCode::Forbidden, err.to_string()),
            ApprovalError::Pipeline(inner) => inner.into(),
            ApprovalError::InvalidPatch(_) => {
                KnjError::new(ErrorCode::InputInvalid, err.to_string())
            }
            ApprovalError::Memory(_) | ApprovalError::Audit(_) => {
                KnjError::internal(err.to_string())
            }
        }
    }
}

/// A correction patch. Only the populated parts change.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BookingPatch {
    /// Replacement entry lines.
    #[serde(default)]
    pub entries: Option<Vec<Entry>>,
    /// Replacement VAT breakdown.
    #[serde(default)]
    pub vat_breakdown: Option<VatBreakdown>,
    /// Replacement narrative.
    #[serde(default)]
    pub narrative: Option<String>,
    /// Replacement citations.
    #[serde(default)]
    pub citations: Option<BTreeSet<CitationRef>>,
    /// Justification when the operator overrides a failed rule check.
    #[serde(default)]
    pub override_note: Option<String>,
}

impl BookingPatch {
    fn is_empty(&self) -> bool {
        self.entries.is_none()
            && self.vat_breakdown.is_none()
            && self.narrative.is_none()
            && self.citations.is_none()
    }
}

/// A booking together with its review context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingDetail {
    /// The booking.
    pub booking: Booking,
    /// Verification output and blockers.
    pub review: ReviewContext,
}

/// The approval gateway.
pub struct ApprovalGateway {
    store: Arc<BookingStore>,
    pipeline: Arc<Pipeline>,
    memory: Arc<MemoryStore>,
    audit: Arc<AuditLog>,
}

impl ApprovalGateway {
    /// Wire the gateway over the pipeline's store.
    #[must_use]
    pub fn new(pipeline: Arc<Pipeline>, memory: Arc<MemoryStore>) -> Self {
        let store = pipeline.store();
        let audit = store.audit();
        Self {
            store,
            pipeline,
            memory,
            audit,
        }
    }

    /// List bookings. Any authenticated role may read.
    pub fn list(
        &self,
        filter: &BookingFilter,
        _session: &Session,
    ) -> Result<Vec<BookingSummary>, ApprovalError> {
        Ok(self.store.list(filter)?)
    }

    /// Fetch one booking with its review context.
    pub fn get(&self, id: Uuid, _session: &Session) -> Result<BookingDetail, ApprovalError> {
        Ok(BookingDetail {
            booking: self.store.get(id)?,
            review: self.store.review(id)?,
        })
    }

    /// Approve a proposed booking.
    ///
    /// Exactly one of two concurrent approvals takes effect; the loser
    /// observes a state conflict. On success the supplier's bank account
    /// is memorized and, for corrected bookings, a preference pair is
    /// recorded for the nightly fine-tuning export.
    pub async fn approve(&self, id: Uuid, session: &Session) -> Result<BookingStatus, ApprovalError> {
        self.require_decider(session)?;
        let lock = self.store.lock_for(id);
        let _guard = lock.lock().await;

        let mut booking = self.store.get(id)?;
        booking.approved_by = Some(session.username.clone());
        self.store.transition(
            &mut booking,
            BookingStatus::Proposed,
            BookingStatus::Approved,
            &actor(session),
            serde_json::json!({ "action": "approve" }),
        )?;
        self.audit_action(session, id, "approve", serde_json::Value::Null)?;

        // Learning hooks, all outside the approval-critical section's
        // correctness: failures here are surfaced, not rolled back.
        let review = self.store.review(id)?;
        if let Some(verified) = &review.verified {
            if let (Some(oib), Some(iban)) = (
                verified.doc.text("supplier_oib"),
                verified.doc.text("supplier_iban"),
            ) {
                self.store
                    .remember_supplier_iban(&booking.client_id, oib, iban)?;
            }
        }
        if let Some(predecessor_id) = booking.corrected_from {
            let predecessor = self.store.get(predecessor_id)?;
            self.memory.preference_pair(
                &format!("client={} class={}", booking.client_id, booking.class),
                &booking,
                &predecessor,
            )?;
        }
        self.memory.journal(
            &booking.client_id,
            &serde_json::json!({
                "event": "approved",
                "booking_id": id.to_string(),
                "by": session.username,
            }),
        )?;
        info!(booking = %id, by = %session.username, "approved");
        Ok(BookingStatus::Approved)
    }

    /// Reject a booking with a reason. Valid from `proposed` and
    /// `needs_review`.
    pub async fn reject(
        &self,
        id: Uuid,
        session: &Session,
        reason: &str,
    ) -> Result<BookingStatus, ApprovalError> {
        self.require_decider(session)?;
        let lock = self.store.lock_for(id);
        let _guard = lock.lock().await;

        let mut booking = self.store.get(id)?;
        let from = booking.status;
        self.store.transition(
            &mut booking,
            from,
            BookingStatus::Rejected,
            &actor(session),
            serde_json::json!({ "action": "reject", "reason": reason }),
        )?;
        self.audit_action(session, id, "reject", serde_json::json!({ "reason": reason }))?;
        Ok(BookingStatus::Rejected)
    }

    /// Correct a booking.
    ///
    /// Creates a successor carrying the patch, moves the predecessor to
    /// `rejected`, records the correction in L2 memory, and re-enters
    /// verification. An operator override of a rule check is recorded
    /// with its justification; it can advance a 2-of-3 field but never a
    /// monetary 1-of-3.
    pub async fn correct(
        &self,
        id: Uuid,
        patch: BookingPatch,
        session: &Session,
    ) -> Result<Uuid, ApprovalError> {
        self.require_decider(session)?;
        if patch.is_empty() {
            return Err(ApprovalError::InvalidPatch("no fields to change".into()));
        }

        let lock = self.store.lock_for(id);
        let _guard = lock.lock().await;

        let mut predecessor = self.store.get(id)?;
        let from = predecessor.status;
        if !matches!(from, BookingStatus::Proposed | BookingStatus::NeedsReview) {
            return Err(ApprovalError::Pipeline(PipelineError::StateConflict {
                id,
                current: from.to_string(),
            }));
        }

        // Build the successor.
        let mut successor = predecessor.clone();
        successor.id = Uuid::new_v4();
        successor.status = BookingStatus::Corrected;
        successor.corrected_from = Some(id);
        successor.proposed_by = knj_core::Proposer::User(session.username.clone());
        successor.approved_by = None;
        successor.created_at = Utc::now();
        successor.finalized_at = None;
        if let Some(entries) = patch.entries {
            successor.entries = entries;
        }
        if let Some(vat) = patch.vat_breakdown {
            successor.vat_breakdown = vat;
        }
        if let Some(narrative) = patch.narrative {
            successor.narrative = narrative;
        }
        if let Some(citations) = patch.citations {
            successor.citations = citations;
        }

        self.store.insert(&successor)?;
        // Carry the review context over so re-verification sees the
        // original consensus.
        let review = self.store.review(id)?;
        self.store.save_review(successor.id, &review)?;

        self.store.transition(
            &mut predecessor,
            from,
            BookingStatus::Rejected,
            &actor(session),
            serde_json::json!({
                "action": "correct",
                "successor": successor.id.to_string(),
            }),
        )?;
        self.audit_action(
            session,
            id,
            "correct",
            serde_json::json!({
                "successor": successor.id.to_string(),
                "override": patch.override_note,
            }),
        )?;

        // Teach L2: the corrected posting is the ground truth.
        if let Some(verified) = &review.verified {
            let key = RuleKey::new(
                &successor.client_id,
                verified.doc.text("supplier_oib"),
                successor.class,
                &[&verified
                    .doc
                    .text("supplier_name")
                    .unwrap_or_default()
                    .to_lowercase()],
            );
            self.memory.record_correction(&key, &successor)?;
        }

        // Re-verify outside this booking's lock; the successor has its own.
        drop(_guard);
        self.pipeline
            .reverify_correction(successor.id, patch.override_note)
            .await?;
        Ok(successor.id)
    }

    // --- helpers ---

    fn require_decider(&self, session: &Session) -> Result<(), ApprovalError> {
        if session.role.can_decide() {
            Ok(())
        } else {
            Err(ApprovalError::Forbidden(session.role.to_string()))
        }
    }

    fn audit_action(
        &self,
        session: &Session,
        id: Uuid,
        action: &str,
        detail: serde_json::Value,
    ) -> Result<(), ApprovalError> {
        self.audit.append(NewAuditEvent {
            actor: actor(session),
            kind: AuditKind::OperatorAction,
            subject_id: id.to_string(),
            payload: serde_json::json!({ "action": action, "detail": detail }),
        })?;
        Ok(())
    }
}

fn actor(session: &Session) -> String {
    format!("user:{}", session.username)
}
