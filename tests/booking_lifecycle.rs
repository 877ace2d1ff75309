// SPDX-License-Identifier: MIT OR Apache-2.0
//! End-to-end lifecycle: upload → propose → approve → export.

mod common;

use common::{accountant, stack, DOMESTIC_INVOICE_XML};
use knj_core::{Agreement, BookingStatus, DocClass, Side};
use knj_pipeline::BookingFilter;
use rust_decimal_macros::dec;

#[tokio::test]
async fn domestic_invoice_happy_path() {
    let stack = stack().await;

    // Upload and run the pipeline.
    let (blob_id, booking_id) = stack
        .pipeline
        .ingest(
            "K1",
            DOMESTIC_INVOICE_XML.as_bytes(),
            "application/xml",
            DocClass::InvoiceIn,
        )
        .unwrap();
    assert!(stack.blobs.contains(&blob_id));

    let status = stack.pipeline.run(booking_id).await.unwrap();
    assert_eq!(status, BookingStatus::Proposed);

    // Entries: 4000 dr 1000, 1400 dr 250, 2200 cr 1250.
    let booking = stack.store.get(booking_id).unwrap();
    assert!(booking.is_balanced());
    let entry = |account: &str| {
        booking
            .entries
            .iter()
            .find(|e| e.account == account)
            .unwrap_or_else(|| panic!("missing entry {account}"))
    };
    assert_eq!(entry("4000").amount.amount, dec!(1000.00));
    assert_eq!(entry("4000").side, Side::Debit);
    assert_eq!(entry("1400").amount.amount, dec!(250.00));
    assert_eq!(entry("2200").amount.amount, dec!(1250.00));
    assert_eq!(entry("2200").side, Side::Credit);
    assert_eq!(booking.posting_date.to_string(), "2026-03-15");

    // All monetary fields reached full consensus.
    let review = stack.store.review(booking_id).unwrap();
    let verified = review.verified.expect("review context saved");
    for field in ["net", "vat", "gross"] {
        assert_eq!(
            verified.verification[field].agreement,
            Agreement::ThreeOfThree,
            "{field}"
        );
    }
    assert!(review.blockers.is_empty());

    // Approve and export.
    let session = accountant(&stack, "mira");
    let status = stack.approval.approve(booking_id, &session).await.unwrap();
    assert_eq!(status, BookingStatus::Approved);

    let receipt = stack.export.export(booking_id, "synesis").await.unwrap();
    assert!(receipt.filename.starts_with("knjizba-K1-"));
    assert_eq!(
        stack.store.get(booking_id).unwrap().status,
        BookingStatus::Exported
    );

    // The artifact on disk hashes to the receipt.
    let artifact = std::fs::read(
        stack
            .export_dir
            .path()
            .join("xml")
            .join(&receipt.filename),
    )
    .unwrap();
    assert_eq!(knj_core::sha256_hex(&artifact), receipt.bytes_hash);
}

#[tokio::test]
async fn duplicate_upload_dedupes_to_prior_booking() {
    let stack = stack().await;
    let (_, first) = stack
        .pipeline
        .ingest(
            "K1",
            DOMESTIC_INVOICE_XML.as_bytes(),
            "application/xml",
            DocClass::InvoiceIn,
        )
        .unwrap();
    let (_, second) = stack
        .pipeline
        .ingest(
            "K1",
            DOMESTIC_INVOICE_XML.as_bytes(),
            "application/xml",
            DocClass::InvoiceIn,
        )
        .unwrap();
    assert_eq!(first, second);

    // A different client gets its own booking for the same bytes.
    let (_, other_client) = stack
        .pipeline
        .ingest(
            "K2",
            DOMESTIC_INVOICE_XML.as_bytes(),
            "application/xml",
            DocClass::InvoiceIn,
        )
        .unwrap();
    assert_ne!(first, other_client);
}

#[tokio::test]
async fn unextractable_upload_stays_ingested() {
    let stack = stack().await;
    let (_, booking_id) = stack
        .pipeline
        .ingest("K1", b"garbage bytes", "application/octet-stream", DocClass::InvoiceIn)
        .unwrap();
    let err = stack.pipeline.run(booking_id).await.unwrap_err();
    assert!(matches!(err, knj_pipeline::PipelineError::Unextractable { .. }));
    assert_eq!(
        stack.store.get(booking_id).unwrap().status,
        BookingStatus::Ingested
    );
    // The failure itself is audited.
    let last = stack.audit.last_seq().unwrap();
    let events = stack.audit.events(1, last).unwrap();
    assert!(events
        .iter()
        .any(|e| e.kind == knj_audit::AuditKind::PipelineFailure));
}

#[tokio::test]
async fn listing_filters_by_status() {
    let stack = stack().await;
    let (_, booking_id) = stack
        .pipeline
        .ingest(
            "K1",
            DOMESTIC_INVOICE_XML.as_bytes(),
            "application/xml",
            DocClass::InvoiceIn,
        )
        .unwrap();
    stack.pipeline.run(booking_id).await.unwrap();

    let proposed = stack
        .store
        .list(&BookingFilter {
            status: Some(BookingStatus::Proposed),
            client_id: Some("K1".into()),
        })
        .unwrap();
    assert_eq!(proposed.len(), 1);
    assert_eq!(proposed[0].id, booking_id);
}
