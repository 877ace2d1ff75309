// SPDX-License-Identifier: MIT OR Apache-2.0
//! The ingest-to-proposal pipeline.
//!
//! `ingest` stores the blob and creates the booking in `ingested`; `run`
//! drives it through extraction, verification, and construction to
//! `proposed` or `needs_review`. Every transition commits atomically with
//! its audit event, and a failure at any stage leaves the booking where
//! it was with an audited failure event.

use crate::build::{
    accounts, build_posting, vat_class_from_amounts, Classification,
};
use crate::store::{BookingStore, ReviewContext};
use crate::PipelineError;
use chrono::Utc;
use knj_audit::{AuditKind, AuditLog, NewAuditEvent};
use knj_blob::BlobStore;
use knj_core::{
    Booking, BookingStatus, BlobId, DocClass, Proposer, VatBreakdown, VerifiedDoc,
};
use knj_core::Currency;
use knj_extract::{ExtractError, ExtractInput, ExtractorFabric};
use knj_infer::{InferError, InferKind, InferOutcome, InferRequest, Orchestrator};
use knj_memory::{MemoryStore, RuleKey};
use knj_rag::RagIndex;
use knj_verify::Verifier;
use rust_decimal::Decimal;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Pipeline tuning, fixed at construction.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Home currency.
    pub home_currency: Currency,
    /// Cash amount above which a booking always needs review.
    pub aml_cash_threshold: Decimal,
    /// Minimum consensus score for auto-advance to `proposed`.
    pub consensus_auto_advance: f64,
    /// Deadline for pipeline-originated inference calls.
    pub infer_deadline: Duration,
}

/// The booking pipeline service.
pub struct Pipeline {
    store: Arc<BookingStore>,
    blobs: Arc<BlobStore>,
    fabric: Arc<ExtractorFabric>,
    verifier: Arc<Verifier>,
    memory: Arc<MemoryStore>,
    rag: Arc<RagIndex>,
    orchestrator: Arc<Orchestrator>,
    audit: Arc<AuditLog>,
    config: PipelineConfig,
    /// Set while the inference queue is saturated; ingest-triggered work
    /// pauses and resumes on drain.
    paused: AtomicBool,
}

impl Pipeline {
    /// Wire the pipeline over its collaborators.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        store: Arc<BookingStore>,
        blobs: Arc<BlobStore>,
        fabric: Arc<ExtractorFabric>,
        verifier: Arc<Verifier>,
        memory: Arc<MemoryStore>,
        rag: Arc<RagIndex>,
        orchestrator: Arc<Orchestrator>,
        config: PipelineConfig,
    ) -> Self {
        let audit = store.audit();
        Self {
            store,
            blobs,
            fabric,
            verifier,
            memory,
            rag,
            orchestrator,
            audit,
            config,
            paused: AtomicBool::new(false),
        }
    }

    /// The booking store (shared with the approval gateway and exporter).
    #[must_use]
    pub fn store(&self) -> Arc<BookingStore> {
        Arc::clone(&self.store)
    }

    /// Returns `true` while ingest-triggered inference is paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Resume ingest-triggered work after queue drain.
    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            info!("pipeline ingest resumed");
        }
    }

    /// Store an upload and create its booking in `ingested`.
    ///
    /// A document with the same content hash for the same `(client,
    /// doc_class)` dedupes to the prior booking id.
    pub fn ingest(
        &self,
        client_id: &str,
        bytes: &[u8],
        media_type: &str,
        doc_class: DocClass,
    ) -> Result<(BlobId, Uuid), PipelineError> {
        let blob_id = self.blobs.put(bytes, media_type)?;

        if let Some(existing) = self.store.find_by_source(client_id, doc_class, &blob_id)? {
            info!(booking = %existing, "duplicate upload deduped");
            return Ok((blob_id, existing));
        }

        let booking = Booking {
            id: Uuid::new_v4(),
            client_id: client_id.to_string(),
            source: Some(blob_id.clone()),
            class: doc_class,
            entries: vec![],
            vat_breakdown: VatBreakdown::default(),
            posting_date: Utc::now().date_naive(),
            narrative: String::new(),
            citations: BTreeSet::new(),
            status: BookingStatus::Ingested,
            proposed_by: Proposer::Pipeline,
            approved_by: None,
            corrected_from: None,
            created_at: Utc::now(),
            finalized_at: None,
        };
        self.store.insert(&booking)?;
        Ok((blob_id, booking.id))
    }

    /// Drive a booking from `ingested` to `proposed` / `needs_review`.
    pub async fn run(&self, booking_id: Uuid) -> Result<BookingStatus, PipelineError> {
        let lock = self.store.lock_for(booking_id);
        let _guard = lock.lock().await;

        let mut booking = self.store.get(booking_id)?;
        if booking.status != BookingStatus::Ingested {
            return Err(PipelineError::StateConflict {
                id: booking_id,
                current: booking.status.to_string(),
            });
        }

        // Extract.
        let doc = match self.extract(&booking).await {
            Ok(doc) => doc,
            Err(err) => {
                self.audit_failure(booking_id, "extract", &err.to_string())?;
                return Err(err);
            }
        };
        self.store.transition(
            &mut booking,
            BookingStatus::Ingested,
            BookingStatus::Extracted,
            "pipeline",
            serde_json::json!({ "tier": doc.source_tier }),
        )?;

        // Verify.
        let verified = self.verifier.verify(&doc);
        self.store.transition(
            &mut booking,
            BookingStatus::Extracted,
            BookingStatus::Verified,
            "pipeline",
            serde_json::json!({ "min_score": verified.min_score() }),
        )?;

        // Construct and decide.
        match self.propose(&mut booking, &verified).await {
            Ok(status) => Ok(status),
            Err(err) => {
                self.audit_failure(booking_id, "propose", &err.to_string())?;
                Err(err)
            }
        }
    }

    /// Re-verify a corrected booking and advance it to `proposed` /
    /// `needs_review`. Called by the approval gateway.
    pub async fn reverify_correction(
        &self,
        booking_id: Uuid,
        override_note: Option<String>,
    ) -> Result<BookingStatus, PipelineError> {
        let lock = self.store.lock_for(booking_id);
        let _guard = lock.lock().await;

        let mut booking = self.store.get(booking_id)?;
        if booking.status != BookingStatus::Corrected {
            return Err(PipelineError::StateConflict {
                id: booking_id,
                current: booking.status.to_string(),
            });
        }

        let mut review = self.store.review(booking_id)?;
        review.override_note = override_note.clone();
        let mut blockers = Vec::new();

        if !booking.is_balanced() {
            blockers.push("ledger invariant violated: debits != credits".to_string());
        }
        if let Some(verified) = &review.verified {
            // A monetary 1of3 field can never be overridden.
            for field in verified.blocking_fields() {
                let monetary = verified
                    .doc
                    .fields
                    .get(field)
                    .map(|f| matches!(f.value, knj_core::FieldData::Money(_)))
                    .unwrap_or(false);
                if monetary {
                    blockers.push(format!("monetary field '{field}' rejected by consensus"));
                } else if override_note.is_none() {
                    blockers.push(format!("field '{field}' rejected by consensus"));
                }
            }
        }

        let target = if blockers.is_empty() {
            BookingStatus::Proposed
        } else {
            BookingStatus::NeedsReview
        };
        review.blockers = blockers;
        self.store.save_review(booking_id, &review)?;
        self.store.transition(
            &mut booking,
            BookingStatus::Corrected,
            target,
            "pipeline",
            serde_json::json!({ "override": override_note.is_some() }),
        )?;
        Ok(target)
    }

    // --- stages ---

    async fn extract(&self, booking: &Booking) -> Result<knj_core::ExtractedDoc, PipelineError> {
        let blob_id = booking
            .source
            .clone()
            .ok_or_else(|| PipelineError::Internal("booking has no source blob".into()))?;
        let (bytes, media_type) = self.blobs.get(&blob_id)?;
        let input = ExtractInput {
            blob_id,
            media_type,
            bytes,
            doc_class_hint: Some(booking.class),
        };
        match self.fabric.extract(&input).await {
            Ok(doc) => Ok(doc),
            Err(ExtractError::Unextractable { diagnostics }) => {
                Err(PipelineError::Unextractable { diagnostics })
            }
        }
    }

    async fn propose(
        &self,
        booking: &mut Booking,
        verified: &VerifiedDoc,
    ) -> Result<BookingStatus, PipelineError> {
        let doc = &verified.doc;
        booking.posting_date = doc
            .date("issue_date")
            .unwrap_or_else(|| Utc::now().date_naive());

        // Memory first: what did the operators teach us about this key?
        let supplier = doc.text("supplier_oib").map(str::to_string);
        let key = RuleKey::new(
            &booking.client_id,
            supplier.as_deref(),
            booking.class,
            &[&doc.text("supplier_name").unwrap_or_default().to_lowercase()],
        );
        let rules = self.memory.suggest(&key)?;

        // Legal context as of the posting date.
        let rag_query = rag_query_for(booking.class);
        let hits = self
            .rag
            .search(rag_query, booking.posting_date, 3)
            .await
            .unwrap_or_default();
        let context: Vec<String> = hits
            .iter()
            .map(|h| format!("{}: {}", h.citation, h.chunk.text))
            .collect();

        // Classification: the model suggests an account and VAT class,
        // nothing more.
        let classification = self.classify(booking, verified, &context).await?;

        // Rule-table cross-check.
        let rule_class = vat_class_from_amounts(verified);
        let model_class = classification.vat_class();
        let mut blockers = Vec::new();
        if let Some(model_class) = model_class
            && model_class != rule_class
        {
            blockers.push(format!(
                "model VAT class {model_class} disagrees with rule table {rule_class}"
            ));
        }

        // L2 cross-check.
        let live_rule = rules.iter().find(|r| !r.conflict);
        let account = classification
            .account
            .clone()
            .or_else(|| {
                live_rule.and_then(|r| r.value.suggested_accounts.first().cloned())
            })
            .unwrap_or_else(|| accounts::EXPENSE.to_string());
        if let Some(rule) = live_rule
            && !rule.value.suggested_accounts.is_empty()
            && !rule.value.suggested_accounts.contains(&account)
        {
            blockers.push(format!(
                "proposed account {account} conflicts with learned rule ({})",
                rule.value.suggested_accounts.join(", ")
            ));
        }

        // Deterministic monetary construction.
        let Some(posting) = build_posting(verified, rule_class, &account, &self.config.home_currency)
        else {
            blockers.push("required monetary fields missing".to_string());
            return self.park(booking, verified, blockers).await;
        };
        booking.entries = posting.entries;
        booking.vat_breakdown = posting.vat_breakdown;
        booking.citations = hits.iter().map(|h| h.citation.clone()).collect();
        booking.narrative = narrative_for(verified, doc.text("supplier_name"));

        // Blockers that gate auto-advance.
        for field in verified.blocking_fields() {
            blockers.push(format!("field '{field}' failed consensus"));
        }
        if !booking.is_balanced() {
            // Never persist an unbalanced posting: the proposal is
            // withdrawn and the operator supplies the entries.
            blockers.push("ledger invariant violated: debits != credits".to_string());
            booking.entries.clear();
            booking.vat_breakdown = knj_core::VatBreakdown::default();
        }
        if booking.class == DocClass::CashRegister
            && let Some(gross) = doc.money("gross")
            && gross.currency == self.config.home_currency
            && gross.amount > self.config.aml_cash_threshold
        {
            blockers.push(format!(
                "safety_violation_pending: cash {} exceeds AML threshold {}",
                gross.amount, self.config.aml_cash_threshold
            ));
        }
        if let (Some(supplier_oib), Some(iban)) = (supplier.as_deref(), doc.text("supplier_iban"))
            && let Some(known) = self.store.known_supplier_iban(&booking.client_id, supplier_oib)?
            && known != iban
        {
            blockers.push(format!(
                "supplier bank account changed from {known} to {iban}"
            ));
        }
        // Cross-currency postings need the FX rate of the posting date;
        // an amount without its FX date cannot auto-advance.
        for (name, field) in doc.monetary_fields() {
            if let knj_core::FieldData::Money(m) = &field.value
                && m.currency != self.config.home_currency
                && m.fx_date.is_none()
            {
                blockers.push(format!("field '{name}' lacks an FX date"));
            }
        }
        if verified.monetary_min_score() < self.config.consensus_auto_advance
            && blockers.is_empty()
        {
            blockers.push(format!(
                "monetary consensus {:.2} below auto-advance floor {:.2}",
                verified.monetary_min_score(),
                self.config.consensus_auto_advance
            ));
        }

        // Fingerprint dedup before `proposed`.
        let fingerprint = booking.fingerprint()?;
        if let Some(duplicate) =
            self.store
                .find_duplicate_proposal(&booking.client_id, &fingerprint.0, booking.id)?
        {
            booking.narrative = format!("duplicate of booking {duplicate}");
            self.store.transition(
                booking,
                BookingStatus::Verified,
                BookingStatus::Rejected,
                "pipeline",
                serde_json::json!({ "duplicate_of": duplicate.to_string() }),
            )?;
            return Ok(BookingStatus::Rejected);
        }

        if blockers.is_empty() {
            self.store.save_review(
                booking.id,
                &ReviewContext {
                    verified: Some(verified.clone()),
                    blockers: vec![],
                    override_note: None,
                },
            )?;
            self.store.transition(
                booking,
                BookingStatus::Verified,
                BookingStatus::Proposed,
                "pipeline",
                serde_json::json!({ "min_score": verified.min_score() }),
            )?;
            self.memory.journal(
                &booking.client_id,
                &serde_json::json!({
                    "event": "proposed",
                    "booking_id": booking.id.to_string(),
                    "doc_class": booking.class.to_string(),
                }),
            )?;
            Ok(BookingStatus::Proposed)
        } else {
            self.park(booking, verified, blockers).await
        }
    }

    async fn park(
        &self,
        booking: &mut Booking,
        verified: &VerifiedDoc,
        blockers: Vec<String>,
    ) -> Result<BookingStatus, PipelineError> {
        warn!(booking = %booking.id, blockers = blockers.len(), "parked for review");
        self.store.save_review(
            booking.id,
            &ReviewContext {
                verified: Some(verified.clone()),
                blockers: blockers.clone(),
                override_note: None,
            },
        )?;
        self.store.transition(
            booking,
            BookingStatus::Verified,
            BookingStatus::NeedsReview,
            "pipeline",
            serde_json::json!({ "blockers": blockers }),
        )?;
        Ok(BookingStatus::NeedsReview)
    }

    async fn classify(
        &self,
        booking: &Booking,
        verified: &VerifiedDoc,
        context: &[String],
    ) -> Result<Classification, PipelineError> {
        let doc = &verified.doc;
        let prompt = format!(
            "classify booking: class={} supplier={} narrative={} net_present={} vat_present={}",
            booking.class,
            doc.text("supplier_name").unwrap_or("unknown"),
            doc.text("supplier_oib").unwrap_or(""),
            doc.money("net").is_some(),
            doc.money("vat").is_some(),
        );
        let request = InferRequest {
            kind: InferKind::Classify,
            user: "pipeline".into(),
            system_prompt: CLASSIFY_SYSTEM_PROMPT.to_string(),
            prompt,
            context: context.to_vec(),
            image: None,
            deadline: self.config.infer_deadline,
        };
        match self.orchestrator.infer(request).await {
            Ok(InferOutcome::Completed { text, .. }) => Ok(Classification::parse(&text)),
            Ok(InferOutcome::Stream { .. }) => {
                Err(PipelineError::Internal("classify returned a stream".into()))
            }
            Err(InferError::Overloaded { retry_after_secs }) => {
                // Backpressure: pause ingest-triggered work.
                self.paused.store(true, Ordering::SeqCst);
                Err(PipelineError::Overloaded { retry_after_secs })
            }
            Err(err) => Err(PipelineError::Inference(err.to_string())),
        }
    }

    fn audit_failure(&self, booking_id: Uuid, stage: &str, detail: &str) -> Result<(), PipelineError> {
        self.audit.append(NewAuditEvent {
            actor: "pipeline".into(),
            kind: AuditKind::PipelineFailure,
            subject_id: booking_id.to_string(),
            payload: serde_json::json!({ "stage": stage, "detail": detail }),
        })?;
        Ok(())
    }
}

/// System prompt for classification calls. Amounts are forbidden output.
const CLASSIFY_SYSTEM_PROMPT: &str = "You label bookkeeping documents. Reply with JSON \
    {\"account\": string, \"vat_class\": string}. Never output amounts.";

fn rag_query_for(class: DocClass) -> &'static str {
    match class {
        DocClass::InvoiceIn | DocClass::InvoiceOut => "pretporez odbitak racun porez na dodanu vrijednost",
        DocClass::InvoiceEu => "obrnuta porezna obveza stjecanje dobara iz druge drzave clanice",
        DocClass::BankStmt => "platni promet racun banke",
        DocClass::PayrollInput => "place doprinosi porez na dohodak",
        DocClass::TravelOrder => "putni nalog dnevnica sluzbeno putovanje",
        DocClass::CashRegister => "gotovinski promet blagajnicki maksimum",
    }
}

fn narrative_for(verified: &VerifiedDoc, supplier: Option<&str>) -> String {
    let mut narrative = match supplier {
        Some(name) => format!("ulazni dokument, dobavljač {name}"),
        None => "ulazni dokument".to_string(),
    };
    // Flag fields where some check produced a conflicting value — a real
    // discrepancy, not just a missing independent source.
    let disputed: Vec<&str> = verified
        .verification
        .iter()
        .filter(|(_, c)| c.checks.iter().any(|ch| !ch.ok && ch.value.is_some()))
        .map(|(name, _)| name.as_str())
        .collect();
    if !disputed.is_empty() {
        narrative.push_str(&format!(
            " [provjera: odstupanje u poljima {}]",
            disputed.join(", ")
        ));
    }
    narrative
}
