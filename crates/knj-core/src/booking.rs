// SPDX-License-Identifier: MIT OR Apache-2.0
//! Double-entry bookings and their approval state machine.

use crate::canonical::{canonical_json, sha256_hex, Fingerprint};
use crate::citation::CitationRef;
use crate::doc::{BlobId, DocClass};
use crate::money::{Currency, Money};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

/// Ledger side of an entry line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    /// Debit.
    Debit,
    /// Credit.
    Credit,
}

/// One line of a double-entry posting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// Chart-of-accounts number, e.g. `"4000"`.
    pub account: String,
    /// Debit or credit.
    pub side: Side,
    /// Amount with currency (and FX date when cross-currency).
    pub amount: Money,
}

impl Entry {
    /// Construct a debit line.
    #[must_use]
    pub fn debit(account: &str, amount: Money) -> Self {
        Self {
            account: account.to_string(),
            side: Side::Debit,
            amount,
        }
    }

    /// Construct a credit line.
    #[must_use]
    pub fn credit(account: &str, amount: Money) -> Self {
        Self {
            account: account.to_string(),
            side: Side::Credit,
            amount,
        }
    }
}

// ---------------------------------------------------------------------------
// VAT
// ---------------------------------------------------------------------------

/// VAT treatment classes recognised by the rule table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VatClass {
    /// Standard rate, 25 %.
    Standard25,
    /// Reduced rate, 13 %.
    Reduced13,
    /// Reduced rate, 5 %.
    Reduced5,
    /// Zero-rated supply.
    Zero,
    /// Exempt supply (no input VAT deduction).
    Exempt,
    /// Intra-EU reverse charge: recipient accounts for VAT.
    ReverseCharge,
}

impl VatClass {
    /// The nominal rate as an exact decimal fraction.
    #[must_use]
    pub fn rate(&self) -> Decimal {
        match self {
            VatClass::Standard25 => Decimal::new(25, 2),
            VatClass::Reduced13 => Decimal::new(13, 2),
            VatClass::Reduced5 => Decimal::new(5, 2),
            VatClass::Zero | VatClass::Exempt | VatClass::ReverseCharge => Decimal::ZERO,
        }
    }

    /// Rate applied on the recipient side. Reverse charge self-assesses at
    /// the standard rate.
    #[must_use]
    pub fn self_assessed_rate(&self) -> Decimal {
        match self {
            VatClass::ReverseCharge => VatClass::Standard25.rate(),
            other => other.rate(),
        }
    }
}

impl fmt::Display for VatClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VatClass::Standard25 => "standard_25",
            VatClass::Reduced13 => "reduced_13",
            VatClass::Reduced5 => "reduced_5",
            VatClass::Zero => "zero",
            VatClass::Exempt => "exempt",
            VatClass::ReverseCharge => "reverse_charge",
        };
        f.write_str(s)
    }
}

/// One VAT block of an invoice (multi-rate invoices carry several).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VatLine {
    /// VAT class of this block.
    pub class: VatClass,
    /// Taxable base.
    pub base: Money,
    /// VAT amount on the base.
    pub vat: Money,
}

/// The VAT breakdown of a booking.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VatBreakdown {
    /// VAT lines, in document order.
    pub lines: Vec<VatLine>,
}

impl VatBreakdown {
    /// Sum of the taxable bases. `None` when lines span currencies.
    #[must_use]
    pub fn total_base(&self) -> Option<Money> {
        sum_money(self.lines.iter().map(|l| &l.base))
    }

    /// Sum of the VAT amounts. `None` when lines span currencies.
    #[must_use]
    pub fn total_vat(&self) -> Option<Money> {
        sum_money(self.lines.iter().map(|l| &l.vat))
    }
}

fn sum_money<'a, I: Iterator<Item = &'a Money>>(mut it: I) -> Option<Money> {
    let first = it.next()?.clone();
    it.try_fold(first, |acc, m| acc.checked_add(m).ok())
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Booking lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    /// The source blob is stored; extraction has not run.
    Ingested,
    /// Extraction succeeded.
    Extracted,
    /// Verification ran; consensus is attached.
    Verified,
    /// Consensus or an invariant requires operator attention.
    NeedsReview,
    /// Machine proposal awaiting operator decision.
    Proposed,
    /// An operator-corrected successor awaiting re-verification.
    Corrected,
    /// Operator approved; awaiting export.
    Approved,
    /// Operator rejected. Terminal.
    Rejected,
    /// Exported to an ERP target. Terminal.
    Exported,
    /// Stopped by a safety violation. Terminal, audit-only.
    Blocked,
}

impl BookingStatus {
    /// Returns `true` for terminal states; terminal bookings are immutable.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exported | Self::Rejected | Self::Blocked)
    }

    /// Returns the set of statuses that are valid successors of `self`.
    #[must_use]
    pub fn valid_transitions(&self) -> &'static [BookingStatus] {
        match self {
            Self::Ingested => &[Self::Extracted, Self::Rejected, Self::Blocked],
            Self::Extracted => &[Self::Verified, Self::Blocked],
            Self::Verified => &[Self::Proposed, Self::NeedsReview, Self::Blocked],
            Self::NeedsReview => &[Self::Rejected, Self::Blocked],
            Self::Proposed => &[Self::Approved, Self::Rejected, Self::Blocked],
            Self::Corrected => &[Self::Proposed, Self::NeedsReview, Self::Blocked],
            Self::Approved => &[Self::Exported, Self::Blocked],
            Self::Exported | Self::Rejected | Self::Blocked => &[],
        }
    }

    /// Returns `true` if transitioning from `self` to `next` is valid.
    #[must_use]
    pub fn can_transition_to(&self, next: BookingStatus) -> bool {
        self.valid_transitions().contains(&next)
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ingested => "ingested",
            Self::Extracted => "extracted",
            Self::Verified => "verified",
            Self::NeedsReview => "needs_review",
            Self::Proposed => "proposed",
            Self::Corrected => "corrected",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Exported => "exported",
            Self::Blocked => "blocked",
        };
        f.write_str(s)
    }
}

/// Who proposed a booking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Proposer {
    /// The machine pipeline.
    Pipeline,
    /// A named operator.
    User(String),
}

// ---------------------------------------------------------------------------
// Booking
// ---------------------------------------------------------------------------

/// A proposed or finalized accounting record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    /// Unique booking identifier.
    pub id: Uuid,
    /// Client the booking belongs to.
    pub client_id: String,
    /// Source document blob, absent for manual bookings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<BlobId>,
    /// Document class that produced the booking.
    pub class: DocClass,
    /// Ordered entry lines.
    pub entries: Vec<Entry>,
    /// VAT breakdown.
    pub vat_breakdown: VatBreakdown,
    /// Business-event date governing legal applicability and FX.
    pub posting_date: NaiveDate,
    /// Free-text narrative, including discrepancy flags.
    pub narrative: String,
    /// Legal citations backing the classification.
    pub citations: BTreeSet<CitationRef>,
    /// Lifecycle status.
    pub status: BookingStatus,
    /// Who proposed it.
    pub proposed_by: Proposer,
    /// Operator who approved, once approved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    /// Predecessor booking when this one is a correction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corrected_from: Option<Uuid>,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
    /// Instant of reaching a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalized_at: Option<DateTime<Utc>>,
}

impl Booking {
    /// Per-currency sums of debits and credits.
    #[must_use]
    pub fn balance_by_currency(&self) -> BTreeMap<Currency, (Decimal, Decimal)> {
        let mut out: BTreeMap<Currency, (Decimal, Decimal)> = BTreeMap::new();
        for entry in &self.entries {
            let slot = out
                .entry(entry.amount.currency.clone())
                .or_insert((Decimal::ZERO, Decimal::ZERO));
            match entry.side {
                Side::Debit => slot.0 += entry.amount.amount,
                Side::Credit => slot.1 += entry.amount.amount,
            }
        }
        out
    }

    /// Returns `true` when debits equal credits exactly in every currency.
    #[must_use]
    pub fn is_balanced(&self) -> bool {
        self.balance_by_currency()
            .values()
            .all(|(dr, cr)| dr == cr)
    }

    /// Canonical encoding with volatile fields nulled.
    ///
    /// The id, status, approver, and timestamps are forced to fixed values
    /// so that re-proposing the same document reproduces the encoding.
    pub fn canonical_value(&self) -> Result<serde_json::Value, serde_json::Error> {
        let mut v = serde_json::to_value(self)?;
        if let serde_json::Value::Object(map) = &mut v {
            for volatile in ["id", "status", "approved_by", "created_at", "finalized_at"] {
                map.insert(volatile.to_string(), serde_json::Value::Null);
            }
        }
        Ok(v)
    }

    /// Fingerprint over the canonical encoding; the dedup key.
    pub fn fingerprint(&self) -> Result<Fingerprint, serde_json::Error> {
        let canonical = canonical_json(&self.canonical_value()?)?;
        Ok(Fingerprint(sha256_hex(canonical.as_bytes())))
    }

    /// Canonical encoding with model-derived fields additionally masked.
    ///
    /// Accounts and VAT classes may legitimately differ between model
    /// generations; everything else must reproduce after a model swap.
    pub fn deterministic_value(&self) -> Result<serde_json::Value, serde_json::Error> {
        let mut v = self.canonical_value()?;
        if let serde_json::Value::Object(map) = &mut v {
            if let Some(serde_json::Value::Array(entries)) = map.get_mut("entries") {
                for entry in entries {
                    if let serde_json::Value::Object(e) = entry {
                        e.insert("account".to_string(), serde_json::Value::Null);
                    }
                }
            }
        }
        Ok(v)
    }

    /// Total gross value in the booking's dominant currency, if uniform.
    #[must_use]
    pub fn gross_total(&self) -> Option<Money> {
        let balances = self.balance_by_currency();
        if balances.len() != 1 {
            return None;
        }
        let (currency, (dr, _)) = balances.into_iter().next()?;
        Some(Money::new(dr, currency))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn eur(amount: Decimal) -> Money {
        Money::new(amount, Currency::eur())
    }

    fn sample_booking() -> Booking {
        Booking {
            id: Uuid::new_v4(),
            client_id: "K1".into(),
            source: Some(BlobId("ab".into())),
            class: DocClass::InvoiceIn,
            entries: vec![
                Entry::debit("4000", eur(dec!(1000.00))),
                Entry::debit("1400", eur(dec!(250.00))),
                Entry::credit("2200", eur(dec!(1250.00))),
            ],
            vat_breakdown: VatBreakdown {
                lines: vec![VatLine {
                    class: VatClass::Standard25,
                    base: eur(dec!(1000.00)),
                    vat: eur(dec!(250.00)),
                }],
            },
            posting_date: NaiveDate::from_ymd_opt(2026, 3, 15).unwrap(),
            narrative: "uredski materijal".into(),
            citations: BTreeSet::new(),
            status: BookingStatus::Proposed,
            proposed_by: Proposer::Pipeline,
            approved_by: None,
            corrected_from: None,
            created_at: Utc::now(),
            finalized_at: None,
        }
    }

    #[test]
    fn balanced_booking_balances() {
        let b = sample_booking();
        assert!(b.is_balanced());
        let balances = b.balance_by_currency();
        let (dr, cr) = balances.get(&Currency::eur()).unwrap();
        assert_eq!(*dr, dec!(1250.00));
        assert_eq!(*cr, dec!(1250.00));
    }

    #[test]
    fn unbalanced_booking_detected() {
        let mut b = sample_booking();
        b.entries[0].amount.amount = dec!(999.99);
        assert!(!b.is_balanced());
    }

    #[test]
    fn fingerprint_ignores_volatile_fields() {
        let mut a = sample_booking();
        let mut b = a.clone();
        b.id = Uuid::new_v4();
        b.status = BookingStatus::Approved;
        b.approved_by = Some("mira".into());
        b.created_at = Utc::now();
        assert_eq!(a.fingerprint().unwrap(), b.fingerprint().unwrap());

        a.narrative = "different".into();
        assert_ne!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
    }

    #[test]
    fn deterministic_value_masks_accounts() {
        let a = sample_booking();
        let mut b = a.clone();
        b.entries[0].account = "4090".into();
        assert_ne!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
        assert_eq!(
            a.deterministic_value().unwrap(),
            b.deterministic_value().unwrap()
        );
    }

    #[test]
    fn terminal_states_have_no_successors() {
        for status in [
            BookingStatus::Exported,
            BookingStatus::Rejected,
            BookingStatus::Blocked,
        ] {
            assert!(status.is_terminal());
            assert!(status.valid_transitions().is_empty());
        }
    }

    #[test]
    fn transition_table_matches_lifecycle() {
        use BookingStatus::*;
        assert!(Ingested.can_transition_to(Extracted));
        assert!(Verified.can_transition_to(Proposed));
        assert!(Verified.can_transition_to(NeedsReview));
        assert!(Proposed.can_transition_to(Approved));
        assert!(Proposed.can_transition_to(Rejected));
        assert!(Corrected.can_transition_to(Proposed));
        assert!(Approved.can_transition_to(Exported));
        assert!(!Approved.can_transition_to(Proposed));
        assert!(!Exported.can_transition_to(Approved));
        // Every pre-terminal state can be blocked by a safety violation.
        for s in [Ingested, Extracted, Verified, NeedsReview, Proposed, Corrected, Approved] {
            assert!(s.can_transition_to(Blocked));
        }
    }

    #[test]
    fn reverse_charge_self_assesses_standard_rate() {
        assert_eq!(VatClass::ReverseCharge.rate(), Decimal::ZERO);
        assert_eq!(VatClass::ReverseCharge.self_assessed_rate(), dec!(0.25));
    }

    #[test]
    fn vat_breakdown_totals() {
        let b = sample_booking();
        assert_eq!(
            b.vat_breakdown.total_base().unwrap().amount,
            dec!(1000.00)
        );
        assert_eq!(b.vat_breakdown.total_vat().unwrap().amount, dec!(250.00));
    }
}
