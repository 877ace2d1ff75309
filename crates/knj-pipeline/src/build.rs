// SPDX-License-Identifier: MIT OR Apache-2.0
//! Deterministic booking construction.
//!
//! The model only ever classifies: it suggests an expense account and a
//! VAT class. Every monetary amount in the entries below is recomputed
//! from the verified extraction, so no amount originates from an AI text
//! channel.

use knj_core::{
    Currency, DocClass, Entry, Money, VatBreakdown, VatClass, VatLine, VerifiedDoc,
};
use rust_decimal::Decimal;
use serde::Deserialize;

/// Default chart-of-accounts postings per role.
pub mod accounts {
    /// Operating expenses.
    pub const EXPENSE: &str = "4000";
    /// Input VAT (pretporez).
    pub const INPUT_VAT: &str = "1400";
    /// Trade payables.
    pub const PAYABLES: &str = "2200";
    /// Output VAT obligation.
    pub const OUTPUT_VAT: &str = "2400";
    /// Trade receivables.
    pub const RECEIVABLES: &str = "1200";
    /// Revenue.
    pub const REVENUE: &str = "7600";
    /// Cash register.
    pub const CASH: &str = "1020";
    /// Bank account.
    pub const BANK: &str = "1000";
    /// Gross salaries.
    pub const SALARIES: &str = "4700";
    /// Salary liabilities.
    pub const SALARY_LIABILITIES: &str = "2300";
    /// Travel expenses.
    pub const TRAVEL: &str = "4130";
    /// Liabilities to employees.
    pub const EMPLOYEE_LIABILITIES: &str = "2310";
}

/// The model's classification reply. Parsed leniently: a malformed reply
/// falls back to the rule table.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Classification {
    /// Suggested expense/revenue account.
    #[serde(default)]
    pub account: Option<String>,
    /// Suggested VAT class tag (serde form, e.g. `"standard_25"`).
    #[serde(default)]
    pub vat_class: Option<String>,
}

impl Classification {
    /// Parse the model's JSON reply; unknown shapes become the default.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        serde_json::from_str(text).unwrap_or_default()
    }

    /// The suggested VAT class, if the tag parses.
    #[must_use]
    pub fn vat_class(&self) -> Option<VatClass> {
        let tag = self.vat_class.as_deref()?;
        serde_json::from_value(serde_json::Value::String(tag.to_string())).ok()
    }
}

/// Derive the VAT class from the extracted amounts — the rule-table side
/// of the classification cross-check.
#[must_use]
pub fn vat_class_from_amounts(doc: &VerifiedDoc) -> VatClass {
    let net = doc.doc.money("net").map(|m| m.amount).unwrap_or(Decimal::ZERO);
    let vat = doc.doc.money("vat").map(|m| m.amount).unwrap_or(Decimal::ZERO);

    if vat.is_zero() {
        return if doc.doc.doc_class == DocClass::InvoiceEu {
            VatClass::ReverseCharge
        } else {
            VatClass::Zero
        };
    }
    if net.is_zero() {
        return VatClass::Standard25;
    }
    let ratio = vat / net;
    let candidates = [
        (VatClass::Standard25, Decimal::new(25, 2)),
        (VatClass::Reduced13, Decimal::new(13, 2)),
        (VatClass::Reduced5, Decimal::new(5, 2)),
    ];
    let tolerance = Decimal::new(1, 2);
    for (class, rate) in candidates {
        if (ratio - rate).abs() <= tolerance {
            return class;
        }
    }
    VatClass::Standard25
}

/// Built entries plus the VAT breakdown.
#[derive(Debug, Clone)]
pub struct BuiltPosting {
    /// Balanced entry lines.
    pub entries: Vec<Entry>,
    /// VAT breakdown.
    pub vat_breakdown: VatBreakdown,
}

/// Build the double-entry lines for a verified document.
///
/// Returns `None` when the document lacks the monetary fields its class
/// requires; the pipeline then parks the booking in review.
#[must_use]
pub fn build_posting(
    doc: &VerifiedDoc,
    vat_class: VatClass,
    expense_account: &str,
    home_currency: &Currency,
) -> Option<BuiltPosting> {
    match doc.doc.doc_class {
        DocClass::InvoiceIn | DocClass::InvoiceEu => {
            build_purchase(doc, vat_class, expense_account)
        }
        DocClass::InvoiceOut => build_sale(doc, vat_class),
        DocClass::CashRegister => build_cash(doc),
        DocClass::BankStmt => build_bank(doc, home_currency),
        DocClass::PayrollInput => build_simple(
            doc,
            accounts::SALARIES,
            accounts::SALARY_LIABILITIES,
        ),
        DocClass::TravelOrder => build_simple(
            doc,
            accounts::TRAVEL,
            accounts::EMPLOYEE_LIABILITIES,
        ),
    }
}

fn build_purchase(
    doc: &VerifiedDoc,
    vat_class: VatClass,
    expense_account: &str,
) -> Option<BuiltPosting> {
    let net = doc.doc.money("net")?.clone();
    let vat = doc.doc.money("vat").cloned();
    let gross = doc.doc.money("gross").cloned();

    if vat_class == VatClass::ReverseCharge {
        // The recipient self-assesses VAT at the standard rate: input and
        // output VAT cancel, the supplier is owed the net.
        let rate = VatClass::ReverseCharge.self_assessed_rate();
        let assessed = Money {
            amount: (net.amount * rate).round_dp(2),
            currency: net.currency.clone(),
            fx_date: net.fx_date,
        };
        let entries = vec![
            Entry::debit(expense_account, net.clone()),
            Entry::debit(accounts::INPUT_VAT, assessed.clone()),
            Entry::credit(accounts::OUTPUT_VAT, assessed.clone()),
            Entry::credit(accounts::PAYABLES, net.clone()),
        ];
        return Some(BuiltPosting {
            entries,
            vat_breakdown: VatBreakdown {
                lines: vec![VatLine {
                    class: VatClass::ReverseCharge,
                    base: net,
                    vat: assessed,
                }],
            },
        });
    }

    let vat = vat.unwrap_or_else(|| Money {
        amount: Decimal::ZERO,
        currency: net.currency.clone(),
        fx_date: net.fx_date,
    });
    let gross = match gross {
        Some(g) => g,
        None => net.checked_add(&vat).ok()?,
    };

    let mut entries = vec![Entry::debit(expense_account, net.clone())];
    if !vat.amount.is_zero() {
        entries.push(Entry::debit(accounts::INPUT_VAT, vat.clone()));
    }
    entries.push(Entry::credit(accounts::PAYABLES, gross));

    Some(BuiltPosting {
        entries,
        vat_breakdown: vat_lines_of(doc, vat_class, &net, &vat),
    })
}

fn build_sale(doc: &VerifiedDoc, vat_class: VatClass) -> Option<BuiltPosting> {
    let net = doc.doc.money("net")?.clone();
    let vat = doc.doc.money("vat").cloned().unwrap_or_else(|| Money {
        amount: Decimal::ZERO,
        currency: net.currency.clone(),
        fx_date: net.fx_date,
    });
    let gross = match doc.doc.money("gross") {
        Some(g) => g.clone(),
        None => net.checked_add(&vat).ok()?,
    };

    let mut entries = vec![Entry::debit(accounts::RECEIVABLES, gross)];
    entries.push(Entry::credit(accounts::REVENUE, net.clone()));
    if !vat.amount.is_zero() {
        entries.push(Entry::credit(accounts::OUTPUT_VAT, vat.clone()));
    }
    Some(BuiltPosting {
        entries,
        vat_breakdown: vat_lines_of(doc, vat_class, &net, &vat),
    })
}

fn build_cash(doc: &VerifiedDoc) -> Option<BuiltPosting> {
    let gross = doc.doc.money("gross")?.clone();
    let vat = doc.doc.money("vat").cloned().unwrap_or_else(|| Money {
        amount: Decimal::ZERO,
        currency: gross.currency.clone(),
        fx_date: gross.fx_date,
    });
    let net = match doc.doc.money("net") {
        Some(n) => n.clone(),
        None => Money {
            amount: gross.amount - vat.amount,
            currency: gross.currency.clone(),
            fx_date: gross.fx_date,
        },
    };

    let mut entries = vec![Entry::debit(accounts::CASH, gross)];
    entries.push(Entry::credit(accounts::REVENUE, net.clone()));
    if !vat.amount.is_zero() {
        entries.push(Entry::credit(accounts::OUTPUT_VAT, vat.clone()));
    }
    Some(BuiltPosting {
        entries,
        vat_breakdown: vat_lines_of(doc, vat_class_from_amounts(doc), &net, &vat),
    })
}

/// One balanced pair per bank transaction row.
fn build_bank(doc: &VerifiedDoc, _home_currency: &Currency) -> Option<BuiltPosting> {
    let mut entries = Vec::new();
    let mut i = 0usize;
    loop {
        let amount_key = format!("txn[{i}].amount");
        let Some(amount) = doc.doc.money(&amount_key) else {
            break;
        };
        let direction = doc
            .doc
            .text(&format!("txn[{i}].direction"))
            .unwrap_or("debit");
        if direction == "debit" {
            // Outgoing payment: clears a payable.
            entries.push(Entry::debit(accounts::PAYABLES, amount.clone()));
            entries.push(Entry::credit(accounts::BANK, amount.clone()));
        } else {
            // Incoming payment: clears a receivable.
            entries.push(Entry::debit(accounts::BANK, amount.clone()));
            entries.push(Entry::credit(accounts::RECEIVABLES, amount.clone()));
        }
        i += 1;
    }
    if entries.is_empty() {
        return None;
    }
    Some(BuiltPosting {
        entries,
        vat_breakdown: VatBreakdown::default(),
    })
}

/// Gross-only classes: one debit, one credit.
fn build_simple(doc: &VerifiedDoc, debit: &str, credit: &str) -> Option<BuiltPosting> {
    let gross = doc
        .doc
        .money("gross")
        .or_else(|| doc.doc.money("net"))?
        .clone();
    Some(BuiltPosting {
        entries: vec![
            Entry::debit(debit, gross.clone()),
            Entry::credit(credit, gross),
        ],
        vat_breakdown: VatBreakdown::default(),
    })
}

/// VAT breakdown from explicit `vat_lines[i]` fields, falling back to the
/// document-level totals.
fn vat_lines_of(doc: &VerifiedDoc, vat_class: VatClass, net: &Money, vat: &Money) -> VatBreakdown {
    let mut lines = Vec::new();
    let mut i = 0usize;
    loop {
        let base = doc.doc.money(&format!("vat_lines[{i}].base"));
        let amount = doc.doc.money(&format!("vat_lines[{i}].vat"));
        let (Some(base), Some(amount)) = (base, amount) else {
            break;
        };
        let rate = doc
            .doc
            .fields
            .get(&format!("vat_lines[{i}].rate"))
            .and_then(|f| match &f.value {
                knj_core::FieldData::Decimal(d) => Some(*d),
                _ => None,
            })
            .unwrap_or(Decimal::ZERO);
        lines.push(VatLine {
            class: class_for_rate(rate).unwrap_or(vat_class),
            base: base.clone(),
            vat: amount.clone(),
        });
        i += 1;
    }
    if lines.is_empty() {
        lines.push(VatLine {
            class: vat_class,
            base: net.clone(),
            vat: vat.clone(),
        });
    }
    VatBreakdown { lines }
}

fn class_for_rate(rate_percent: Decimal) -> Option<VatClass> {
    if rate_percent == Decimal::new(25, 0) {
        Some(VatClass::Standard25)
    } else if rate_percent == Decimal::new(13, 0) {
        Some(VatClass::Reduced13)
    } else if rate_percent == Decimal::new(5, 0) {
        Some(VatClass::Reduced5)
    } else if rate_percent.is_zero() {
        None
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use knj_core::{
        BlobId, ExtractedDoc, FieldData, FieldValue, SourceTier,
    };
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;

    fn eur(d: Decimal) -> Money {
        Money::new(d, Currency::eur())
    }

    fn doc(class: DocClass, fields: Vec<(&str, FieldData)>) -> VerifiedDoc {
        let mut map = BTreeMap::new();
        for (name, value) in fields {
            map.insert(
                name.to_string(),
                FieldValue::certain(value, SourceTier::StructuredXml, "xml.invoice"),
            );
        }
        VerifiedDoc {
            doc: ExtractedDoc {
                blob_id: BlobId("00".into()),
                doc_class: class,
                fields: map,
                source_tier: SourceTier::StructuredXml,
                language: "hr".into(),
                currency: Currency::eur(),
                shadows: vec![],
            },
            verification: BTreeMap::new(),
        }
    }

    #[test]
    fn domestic_invoice_builds_classic_posting() {
        let doc = doc(
            DocClass::InvoiceIn,
            vec![
                ("net", FieldData::Money(eur(dec!(1000.00)))),
                ("vat", FieldData::Money(eur(dec!(250.00)))),
                ("gross", FieldData::Money(eur(dec!(1250.00)))),
            ],
        );
        let posting =
            build_posting(&doc, VatClass::Standard25, accounts::EXPENSE, &Currency::eur()).unwrap();
        assert_eq!(posting.entries.len(), 3);
        assert_eq!(posting.entries[0].account, "4000");
        assert_eq!(posting.entries[1].account, "1400");
        assert_eq!(posting.entries[2].account, "2200");
        let dr: Decimal = posting
            .entries
            .iter()
            .filter(|e| matches!(e.side, knj_core::Side::Debit))
            .map(|e| e.amount.amount)
            .sum();
        let cr: Decimal = posting
            .entries
            .iter()
            .filter(|e| matches!(e.side, knj_core::Side::Credit))
            .map(|e| e.amount.amount)
            .sum();
        assert_eq!(dr, cr);
    }

    #[test]
    fn reverse_charge_self_assesses_both_sides() {
        let doc = doc(
            DocClass::InvoiceEu,
            vec![
                ("net", FieldData::Money(eur(dec!(5000.00)))),
                ("vat", FieldData::Money(eur(dec!(0.00)))),
                ("gross", FieldData::Money(eur(dec!(5000.00)))),
            ],
        );
        assert_eq!(vat_class_from_amounts(&doc), VatClass::ReverseCharge);
        let posting =
            build_posting(&doc, VatClass::ReverseCharge, accounts::EXPENSE, &Currency::eur())
                .unwrap();
        let input = posting
            .entries
            .iter()
            .find(|e| e.account == accounts::INPUT_VAT)
            .unwrap();
        let output = posting
            .entries
            .iter()
            .find(|e| e.account == accounts::OUTPUT_VAT)
            .unwrap();
        assert_eq!(input.amount.amount, dec!(1250.00));
        assert_eq!(output.amount.amount, dec!(1250.00));
    }

    #[test]
    fn vat_class_derived_from_ratio() {
        let doc13 = doc(
            DocClass::InvoiceIn,
            vec![
                ("net", FieldData::Money(eur(dec!(100.00)))),
                ("vat", FieldData::Money(eur(dec!(13.00)))),
            ],
        );
        assert_eq!(vat_class_from_amounts(&doc13), VatClass::Reduced13);
    }

    #[test]
    fn multi_vat_invoice_keeps_per_rate_lines() {
        let doc = doc(
            DocClass::InvoiceIn,
            vec![
                ("net", FieldData::Money(eur(dec!(300.00)))),
                ("vat", FieldData::Money(eur(dec!(63.00)))),
                ("gross", FieldData::Money(eur(dec!(363.00)))),
                ("vat_lines[0].rate", FieldData::Decimal(dec!(25))),
                ("vat_lines[0].base", FieldData::Money(eur(dec!(200.00)))),
                ("vat_lines[0].vat", FieldData::Money(eur(dec!(50.00)))),
                ("vat_lines[1].rate", FieldData::Decimal(dec!(13))),
                ("vat_lines[1].base", FieldData::Money(eur(dec!(100.00)))),
                ("vat_lines[1].vat", FieldData::Money(eur(dec!(13.00)))),
            ],
        );
        let posting =
            build_posting(&doc, VatClass::Standard25, accounts::EXPENSE, &Currency::eur()).unwrap();
        assert_eq!(posting.vat_breakdown.lines.len(), 2);
        assert_eq!(posting.vat_breakdown.lines[1].class, VatClass::Reduced13);
        assert_eq!(
            posting.vat_breakdown.total_vat().unwrap().amount,
            dec!(63.00)
        );
    }

    #[test]
    fn bank_statement_builds_pair_per_row() {
        let doc = doc(
            DocClass::BankStmt,
            vec![
                ("txn[0].amount", FieldData::Money(eur(dec!(100.00)))),
                ("txn[0].direction", FieldData::Text("debit".into())),
                ("txn[1].amount", FieldData::Money(eur(dec!(40.00)))),
                ("txn[1].direction", FieldData::Text("credit".into())),
            ],
        );
        let posting =
            build_posting(&doc, VatClass::Zero, accounts::EXPENSE, &Currency::eur()).unwrap();
        assert_eq!(posting.entries.len(), 4);
    }

    #[test]
    fn classification_parses_leniently() {
        let c = Classification::parse(r#"{"account":"4090","vat_class":"reduced_13"}"#);
        assert_eq!(c.account.as_deref(), Some("4090"));
        assert_eq!(c.vat_class(), Some(VatClass::Reduced13));

        let junk = Classification::parse("i think account 4000 fits");
        assert!(junk.account.is_none());
        assert!(junk.vat_class().is_none());
    }
}
