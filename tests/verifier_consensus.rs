// SPDX-License-Identifier: MIT OR Apache-2.0
//! Consensus behavior on noisy and invalid documents (OCR ambiguity,
//! checksum failures).

mod common;

use common::stack;
use knj_core::{Agreement, BookingStatus, CheckSource, DocClass};

/// A printed invoice whose plain-text rendition the regex tier reads.
const PRINTED_INVOICE: &str = "\
RAČUN br. 2026-0099
Dobavljač d.o.o., OIB: 12345678903
Datum: 15.03.2026.
Osnovica: 1 000,00
PDV: 250,00
Ukupno: 1 250,00
";

#[tokio::test]
async fn printed_invoice_reaches_full_consensus_via_shadow_tier() {
    // The template tier wins; the regex tier's shadow extraction supplies
    // the independent algorithmic check.
    let stack = stack().await;

    let (_, booking_id) = stack
        .pipeline
        .ingest("K1", PRINTED_INVOICE.as_bytes(), "text/plain", DocClass::InvoiceIn)
        .unwrap();
    let status = stack.pipeline.run(booking_id).await.unwrap();

    let review = stack.store.review(booking_id).unwrap();
    let verified = review.verified.unwrap();
    // net was read by the template tier and recomputed from gross - vat:
    // full agreement despite the scan.
    assert_eq!(
        verified.verification["net"].agreement,
        Agreement::ThreeOfThree
    );
    assert_eq!(status, BookingStatus::Proposed);
}

#[tokio::test]
async fn disagreeing_amounts_admit_with_warning_and_park() {
    // The scan's totals disagree: gross says 1 250,00 but vat reads as
    // 25,00 somewhere down the fallback ladder.
    let noisy = PRINTED_INVOICE.replace("PDV: 250,00", "PDV: 25,00");
    let stack = stack().await;

    let (_, booking_id) = stack
        .pipeline
        .ingest("K1", noisy.as_bytes(), "text/plain", DocClass::InvoiceIn)
        .unwrap();
    let status = stack.pipeline.run(booking_id).await.unwrap();

    let review = stack.store.review(booking_id).unwrap();
    let verified = review.verified.unwrap();

    // vat: the stated 25,00 disagrees with gross - net = 250,00, so the
    // recomputation votes against it.
    let vat = &verified.verification["vat"];
    assert_ne!(vat.agreement, Agreement::ThreeOfThree);

    // The booking cannot auto-advance.
    assert_eq!(status, BookingStatus::NeedsReview);
    assert!(!review.blockers.is_empty());

    // The unbalanced proposal was withdrawn rather than persisted: the
    // ledger invariant holds in every stored state.
    let booking = stack.store.get(booking_id).unwrap();
    assert!(booking.entries.is_empty());
    assert!(booking.is_balanced());
    assert!(review
        .blockers
        .iter()
        .any(|b| b.contains("debits != credits")));
}

#[tokio::test]
async fn fiscal_id_checksum_failure_blocks() {
    // 12345678900 fails the OIB checksum.
    let bad = PRINTED_INVOICE.replace("12345678903", "12345678900");
    let stack = stack().await;

    let (_, booking_id) = stack
        .pipeline
        .ingest("K1", bad.as_bytes(), "text/plain", DocClass::InvoiceIn)
        .unwrap();
    let status = stack.pipeline.run(booking_id).await.unwrap();
    assert_eq!(status, BookingStatus::NeedsReview);

    let review = stack.store.review(booking_id).unwrap();
    let verified = review.verified.unwrap();
    let oib = &verified.verification["supplier_oib"];
    let rule = oib
        .checks
        .iter()
        .find(|c| c.source == CheckSource::Rule)
        .unwrap();
    assert!(!rule.ok);
    assert!(matches!(
        oib.agreement,
        Agreement::OneOfThree | Agreement::TwoOfThree
    ));
    assert!(oib.is_blocking() || oib.agreement == Agreement::TwoOfThree);
    assert!(review
        .blockers
        .iter()
        .any(|b| b.contains("supplier_oib") || b.contains("consensus")));
}

#[tokio::test]
async fn no_monetary_field_ever_originates_from_ai() {
    let stack = stack().await;
    let (_, booking_id) = stack
        .pipeline
        .ingest(
            "K1",
            common::DOMESTIC_INVOICE_XML.as_bytes(),
            "application/xml",
            DocClass::InvoiceIn,
        )
        .unwrap();
    stack.pipeline.run(booking_id).await.unwrap();

    let review = stack.store.review(booking_id).unwrap();
    let verified = review.verified.unwrap();
    for (name, field) in verified.doc.monetary_fields() {
        // Provenance of extracted monetary values is a deterministic
        // tier, and the booking amounts are recomputed from them.
        assert_ne!(
            field.provenance.extractor_id, "model",
            "field {name} must not come from the model"
        );
    }
    let booking = stack.store.get(booking_id).unwrap();
    assert!(booking.is_balanced());
}
