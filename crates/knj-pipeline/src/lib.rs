// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = "Booking pipeline: ingest, extract, verify, propose."]
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! The pipeline drives each uploaded document through the approval state
//! machine. State transitions are atomic with their audit event (one
//! SQLite transaction), per-booking mutations serialize on an async lock,
//! and anything that would change state without operator consent surfaces
//! as a blocker instead of proceeding.

mod build;
mod pipeline;
mod store;

pub use build::{
    accounts, build_posting, vat_class_from_amounts, BuiltPosting, Classification,
};
pub use pipeline::{Pipeline, PipelineConfig};
pub use store::{BookingFilter, BookingStore, BookingSummary, ReviewContext};

use knj_core::BookingStatus;
use knj_error::{ErrorCode, KnjError};
use uuid::Uuid;

/// Errors from the pipeline and booking store.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Unknown booking.
    #[error("booking not found: {0}")]
    NotFound(Uuid),

    /// Another actor changed the booking first.
    #[error("state conflict on {id}: currently {current}")]
    StateConflict {
        /// Booking id.
        id: Uuid,
        /// Status the booking actually holds.
        current: String,
    },

    /// The requested transition is not in the state machine.
    #[error("invalid transition {from} -> {to}")]
    InvalidTransition {
        /// Current status.
        from: BookingStatus,
        /// Requested status.
        to: BookingStatus,
    },

    /// Every extraction tier declined.
    #[error("unextractable: {diagnostics:?}")]
    Unextractable {
        /// Per-tier diagnostics.
        diagnostics: Vec<String>,
    },

    /// Inference backpressure; ingest work pauses.
    #[error("inference overloaded, retry after {retry_after_secs}s")]
    Overloaded {
        /// Client backoff hint.
        retry_after_secs: u64,
    },

    /// Inference failed after its retry.
    #[error("inference failed: {0}")]
    Inference(String),

    /// Blob store failure.
    #[error(transparent)]
    Blob(#[from] knj_blob::BlobError),

    /// Memory store failure.
    #[error(transparent)]
    Memory(#[from] knj_memory::MemoryError),

    /// Audit failure.
    #[error(transparent)]
    Audit(#[from] knj_audit::AuditError),

    /// Database failure.
    #[error("pipeline db: {0}")]
    Db(#[from] rusqlite::Error),

    /// Serialization failure.
    #[error("pipeline serde: {0}")]
    Serde(#[from] serde_json::Error),

    /// Anything else.
    #[error("pipeline internal: {0}")]
    Internal(String),
}

impl From<&PipelineError> for KnjError {
    fn from(err: &PipelineError) -> Self {
        match err {
            PipelineError::NotFound(id) => KnjError::not_found(format!("booking {id}")),
            PipelineError::StateConflict { current, .. } => {
                KnjError::new(ErrorCode::StateConflict, err.to_string()).with_state(current.clone())
            }
            PipelineError::InvalidTransition { .. } => {
                KnjError::new(ErrorCode::InvalidTransition, err.to_string())
            }
            PipelineError::Unextractable { .. } => {
                KnjError::new(ErrorCode::Unextractable, err.to_string())
            }
            PipelineError::Overloaded { retry_after_secs } => {
                KnjError::new(ErrorCode::Overloaded, err.to_string())
                    .with_retry_after(*retry_after_secs)
            }
            PipelineError::Inference(_) => {
                KnjError::new(ErrorCode::InferenceFailed, err.to_string())
            }
            PipelineError::Audit(_) => KnjError::new(ErrorCode::AuditIntegrity, err.to_string()),
            _ => KnjError::internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use knj_audit::{open_db_in_memory, AuditLog};
    use knj_core::{Booking, Currency, DocClass, Entry, Money, Proposer, VatBreakdown};
    use rust_decimal_macros::dec;
    use std::collections::BTreeSet;
    use std::sync::Arc;

    fn store() -> BookingStore {
        let db = open_db_in_memory().unwrap();
        let audit = Arc::new(AuditLog::open(Arc::clone(&db)).unwrap());
        BookingStore::open(db, audit).unwrap()
    }

    fn booking(status: BookingStatus) -> Booking {
        Booking {
            id: Uuid::new_v4(),
            client_id: "K1".into(),
            source: None,
            class: DocClass::InvoiceIn,
            entries: vec![
                Entry::debit("4000", Money::new(dec!(100), Currency::eur())),
                Entry::credit("2200", Money::new(dec!(100), Currency::eur())),
            ],
            vat_breakdown: VatBreakdown::default(),
            posting_date: chrono::NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
            narrative: String::new(),
            citations: BTreeSet::new(),
            status,
            proposed_by: Proposer::Pipeline,
            approved_by: None,
            corrected_from: None,
            created_at: chrono::Utc::now(),
            finalized_at: None,
        }
    }

    #[test]
    fn insert_get_roundtrip() {
        let store = store();
        let b = booking(BookingStatus::Proposed);
        store.insert(&b).unwrap();
        let loaded = store.get(b.id).unwrap();
        assert_eq!(loaded.id, b.id);
        assert_eq!(loaded.status, BookingStatus::Proposed);
    }

    #[test]
    fn transition_writes_audit_atomically() {
        let store = store();
        let mut b = booking(BookingStatus::Proposed);
        store.insert(&b).unwrap();
        store
            .transition(
                &mut b,
                BookingStatus::Proposed,
                BookingStatus::Approved,
                "user:mira",
                serde_json::json!({}),
            )
            .unwrap();
        assert_eq!(store.get(b.id).unwrap().status, BookingStatus::Approved);

        let audit = store.audit();
        // Creation event + transition event.
        assert_eq!(audit.last_seq().unwrap(), 2);
        audit.verify(1, 2).unwrap();
    }

    #[test]
    fn stale_transition_is_state_conflict() {
        let store = store();
        let mut b = booking(BookingStatus::Proposed);
        store.insert(&b).unwrap();

        let mut first = store.get(b.id).unwrap();
        store
            .transition(
                &mut first,
                BookingStatus::Proposed,
                BookingStatus::Approved,
                "user:mira",
                serde_json::json!({}),
            )
            .unwrap();

        // The second actor still believes the booking is proposed.
        let err = store
            .transition(
                &mut b,
                BookingStatus::Proposed,
                BookingStatus::Rejected,
                "user:ivo",
                serde_json::json!({}),
            )
            .unwrap_err();
        assert!(matches!(err, PipelineError::StateConflict { .. }));
    }

    #[test]
    fn invalid_transition_rejected_up_front() {
        let store = store();
        let mut b = booking(BookingStatus::Exported);
        store.insert(&b).unwrap();
        let err = store
            .transition(
                &mut b,
                BookingStatus::Exported,
                BookingStatus::Proposed,
                "user:mira",
                serde_json::json!({}),
            )
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidTransition { .. }));
    }

    #[test]
    fn list_filters_by_status_and_client() {
        let store = store();
        store.insert(&booking(BookingStatus::Proposed)).unwrap();
        store.insert(&booking(BookingStatus::NeedsReview)).unwrap();
        let mut other = booking(BookingStatus::Proposed);
        other.client_id = "K2".into();
        store.insert(&other).unwrap();

        let proposed = store
            .list(&BookingFilter {
                status: Some(BookingStatus::Proposed),
                client_id: Some("K1".into()),
            })
            .unwrap();
        assert_eq!(proposed.len(), 1);
        let all = store.list(&BookingFilter::default()).unwrap();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn supplier_iban_memory() {
        let store = store();
        assert!(store.known_supplier_iban("K1", "123").unwrap().is_none());
        store
            .remember_supplier_iban("K1", "123", "HR17236000011")
            .unwrap();
        assert_eq!(
            store.known_supplier_iban("K1", "123").unwrap().as_deref(),
            Some("HR17236000011")
        );
    }

    #[test]
    fn error_codes_map_for_clients() {
        let err = PipelineError::StateConflict {
            id: Uuid::new_v4(),
            current: "approved".into(),
        };
        let knj: KnjError = (&err).into();
        assert_eq!(knj.code, ErrorCode::StateConflict);
        assert_eq!(
            knj.context.get("current_state").map(String::as_str),
            Some("approved")
        );
    }
}
