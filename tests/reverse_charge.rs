// SPDX-License-Identifier: MIT OR Apache-2.0
//! Cross-border reverse-charge bookings and their citations.

mod common;

use common::{seed_reverse_charge_chunk, stack, EU_INVOICE_XML};
use knj_core::{BookingStatus, DocClass, Side, VatClass};
use rust_decimal_macros::dec;

#[tokio::test]
async fn eu_invoice_self_assesses_at_standard_rate() {
    let stack = stack().await;
    seed_reverse_charge_chunk(&stack).await;

    let (_, booking_id) = stack
        .pipeline
        .ingest(
            "K1",
            EU_INVOICE_XML.as_bytes(),
            "application/xml",
            DocClass::InvoiceEu,
        )
        .unwrap();
    let status = stack.pipeline.run(booking_id).await.unwrap();
    assert_eq!(status, BookingStatus::Proposed);

    let booking = stack.store.get(booking_id).unwrap();
    assert!(booking.is_balanced());

    // Pretax debit and VAT-obligation credit, both at 25 % of net.
    let input_vat = booking
        .entries
        .iter()
        .find(|e| e.account == "1400")
        .expect("pretax debit");
    let output_vat = booking
        .entries
        .iter()
        .find(|e| e.account == "2400")
        .expect("vat obligation credit");
    assert_eq!(input_vat.side, Side::Debit);
    assert_eq!(output_vat.side, Side::Credit);
    assert_eq!(input_vat.amount.amount, dec!(1250.00));
    assert_eq!(output_vat.amount.amount, dec!(1250.00));

    assert_eq!(
        booking.vat_breakdown.lines[0].class,
        VatClass::ReverseCharge
    );

    // The classification cites the reverse-charge article, in force on
    // the posting date.
    assert_eq!(booking.posting_date.to_string(), "2026-03-20");
    let citation = booking
        .citations
        .iter()
        .find(|c| c.law_code == "ZPDV" && c.article == 75)
        .expect("reverse-charge citation attached");
    assert_eq!(citation.effective_on, booking.posting_date);
}

#[tokio::test]
async fn posting_date_governs_which_version_is_cited() {
    let stack = stack().await;
    seed_reverse_charge_chunk(&stack).await;

    // Supersede the article effective 2026-01-01.
    let old = stack.rag.quarantined().unwrap();
    assert!(old.is_empty(), "chunk was confirmed in seeding");
    let hits = stack
        .rag
        .search("obrnuta porezna obveza", "2026-03-20".parse().unwrap(), 1)
        .await
        .unwrap();
    let old_id = hits[0].chunk.id;

    let new_version = knj_rag::LegalChunk {
        id: 0,
        corpus_id: "nn".into(),
        law_code: "ZPDV".into(),
        article: 75,
        paragraph: Some(2),
        text: "Obrnuta porezna obveza, izmijenjeni uvjeti za stjecanje dobara.".into(),
        gazette_ref: "NN 152/25".into(),
        effective_from: "2026-01-01".parse().unwrap(),
        effective_to: None,
        supersedes: None,
    };
    stack
        .rag
        .supersede(old_id, &new_version, "user:admin")
        .await
        .unwrap();

    // A 2025 event cites the old gazette; a 2026 event the new one.
    let before = stack
        .rag
        .search("obrnuta porezna obveza", "2025-12-31".parse().unwrap(), 1)
        .await
        .unwrap();
    assert_eq!(before[0].chunk.gazette_ref, "NN 73/13");

    let after = stack
        .rag
        .search("obrnuta porezna obveza", "2026-02-01".parse().unwrap(), 1)
        .await
        .unwrap();
    assert_eq!(after[0].chunk.gazette_ref, "NN 152/25");
}
