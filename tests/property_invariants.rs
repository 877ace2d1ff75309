// SPDX-License-Identifier: MIT OR Apache-2.0
//! Property tests over the core invariants: balance, canonical
//! fingerprints, decimal parsing, and audit chain integrity.

use chrono::Utc;
use knj_audit::{AuditKind, AuditLog, NewAuditEvent};
use knj_core::{
    parse_localized_decimal, Booking, BookingStatus, Currency, DocClass, Entry, Money, Proposer,
    Side, VatBreakdown,
};
use proptest::prelude::*;
use rust_decimal::Decimal;
use std::collections::BTreeSet;
use uuid::Uuid;

fn booking_with_entries(entries: Vec<Entry>) -> Booking {
    Booking {
        id: Uuid::new_v4(),
        client_id: "K1".into(),
        source: None,
        class: DocClass::InvoiceIn,
        entries,
        vat_breakdown: VatBreakdown::default(),
        posting_date: "2026-03-01".parse().unwrap(),
        narrative: "test".into(),
        citations: BTreeSet::new(),
        status: BookingStatus::Proposed,
        proposed_by: Proposer::Pipeline,
        approved_by: None,
        corrected_from: None,
        created_at: Utc::now(),
        finalized_at: None,
    }
}

fn cents() -> impl Strategy<Value = Decimal> {
    // Amounts up to ~10M with two decimals.
    (1i64..1_000_000_000).prop_map(|c| Decimal::new(c, 2))
}

proptest! {
    #[test]
    fn mirrored_entries_always_balance(amounts in proptest::collection::vec(cents(), 1..8)) {
        let eur = Currency::eur();
        let mut entries = Vec::new();
        for amount in &amounts {
            entries.push(Entry::debit("4000", Money::new(*amount, eur.clone())));
            entries.push(Entry::credit("2200", Money::new(*amount, eur.clone())));
        }
        let booking = booking_with_entries(entries);
        prop_assert!(booking.is_balanced());
    }

    #[test]
    fn skewed_entries_never_balance(amount in cents(), skew in 1i64..1_000_000) {
        let eur = Currency::eur();
        let booking = booking_with_entries(vec![
            Entry::debit("4000", Money::new(amount, eur.clone())),
            Entry::credit("2200", Money::new(amount + Decimal::new(skew, 2), eur)),
        ]);
        prop_assert!(!booking.is_balanced());
    }

    #[test]
    fn fingerprint_ignores_every_volatile_field(amount in cents(), narrative in "[a-z ]{0,40}") {
        let eur = Currency::eur();
        let mut a = booking_with_entries(vec![
            Entry::debit("4000", Money::new(amount, eur.clone())),
            Entry::credit("2200", Money::new(amount, eur)),
        ]);
        a.narrative = narrative;
        let mut b = a.clone();
        b.id = Uuid::new_v4();
        b.status = BookingStatus::Approved;
        b.approved_by = Some("mira".into());
        b.created_at = Utc::now();
        b.finalized_at = Some(Utc::now());
        prop_assert_eq!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
    }

    #[test]
    fn croatian_grouping_parses_exactly(whole in 0i64..10_000_000, frac in 0i64..100) {
        // Render with dot grouping and comma decimals, then parse back.
        let expected = Decimal::new(whole * 100 + frac, 2);
        let grouped = format!("{}", whole)
            .as_bytes()
            .rchunks(3)
            .rev()
            .map(|c| std::str::from_utf8(c).unwrap())
            .collect::<Vec<_>>()
            .join(".");
        let rendered = format!("{grouped},{frac:02}");
        prop_assert_eq!(parse_localized_decimal(&rendered).unwrap(), expected);
    }

    #[test]
    fn audit_chain_verifies_for_arbitrary_payloads(payloads in proptest::collection::vec("[ -~]{0,40}", 1..12)) {
        let log = AuditLog::open(knj_audit::open_db_in_memory().unwrap()).unwrap();
        for payload in &payloads {
            log.append(NewAuditEvent {
                actor: "pipeline".into(),
                kind: AuditKind::StateTransition,
                subject_id: "b".into(),
                payload: serde_json::json!({ "note": payload }),
            }).unwrap();
        }
        let last = log.last_seq().unwrap();
        prop_assert!(log.verify(1, last).is_ok());
    }
}

#[test]
fn entries_preserve_order_and_sides_through_serde() {
    let eur = Currency::eur();
    let booking = booking_with_entries(vec![
        Entry::debit("4000", Money::new(Decimal::new(100_000, 2), eur.clone())),
        Entry::debit("1400", Money::new(Decimal::new(25_000, 2), eur.clone())),
        Entry::credit("2200", Money::new(Decimal::new(125_000, 2), eur)),
    ]);
    let json = serde_json::to_string(&booking).unwrap();
    let back: Booking = serde_json::from_str(&json).unwrap();
    assert_eq!(back.entries.len(), 3);
    assert_eq!(back.entries[0].account, "4000");
    assert_eq!(back.entries[2].side, Side::Credit);
    // Decimal round-trips as an exact string, never a float.
    assert!(json.contains("\"1000.00\""));
}
