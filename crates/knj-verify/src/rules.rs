// SPDX-License-Identifier: MIT OR Apache-2.0
//! Domain rule predicates: checksums, syntax, cross-field identities.

use knj_core::{ExtractedDoc, FieldData};
use rust_decimal::Decimal;

/// Result of running one rule predicate against a field.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleOutcome {
    /// Whether the predicate held.
    pub ok: bool,
    /// The value the rule recomputed or expected, when it has one.
    pub expected: Option<FieldData>,
    /// Diagnostic for failures.
    pub diagnostic: Option<String>,
}

impl RuleOutcome {
    pub(crate) fn pass() -> Self {
        Self {
            ok: true,
            expected: None,
            diagnostic: None,
        }
    }

    pub(crate) fn fail(diagnostic: impl Into<String>) -> Self {
        Self {
            ok: false,
            expected: None,
            diagnostic: Some(diagnostic.into()),
        }
    }
}

/// A registered rule check. The registry is an explicit table built at
/// startup; nothing is discovered by scanning.
pub struct RuleCheckDef {
    /// Stable identifier recorded in provenance and diagnostics.
    pub id: &'static str,
    /// Does this rule apply to the named field of this document?
    pub applies: fn(field: &str, value: &FieldData) -> bool,
    /// Run the predicate.
    pub run: fn(doc: &ExtractedDoc, field: &str, value: &FieldData) -> RuleOutcome,
}

/// The built-in rule table.
pub fn default_rules() -> Vec<RuleCheckDef> {
    vec![
        RuleCheckDef {
            id: "rule.oib_checksum",
            applies: |field, value| {
                matches!(value, FieldData::Text(_))
                    && (field.ends_with("oib") || field == "fiscal_id")
            },
            run: |_, _, value| match value {
                FieldData::Text(s) => {
                    if oib_checksum_ok(s) {
                        RuleOutcome::pass()
                    } else {
                        RuleOutcome::fail(format!("OIB checksum failed for '{s}'"))
                    }
                }
                _ => RuleOutcome::fail("OIB field is not text"),
            },
        },
        RuleCheckDef {
            id: "rule.iban_mod97",
            applies: |field, value| matches!(value, FieldData::Text(_)) && field.ends_with("iban"),
            run: |_, _, value| match value {
                FieldData::Text(s) => {
                    if iban_mod97_ok(s) {
                        RuleOutcome::pass()
                    } else {
                        RuleOutcome::fail(format!("IBAN mod-97 failed for '{s}'"))
                    }
                }
                _ => RuleOutcome::fail("IBAN field is not text"),
            },
        },
        RuleCheckDef {
            id: "rule.vat_id_syntax",
            applies: |field, value| {
                matches!(value, FieldData::Text(_)) && field.ends_with("vat_id")
            },
            run: |_, _, value| match value {
                FieldData::Text(s) => {
                    if vat_id_syntax_ok(s) {
                        RuleOutcome::pass()
                    } else {
                        RuleOutcome::fail(format!("VAT id syntax failed for '{s}'"))
                    }
                }
                _ => RuleOutcome::fail("VAT id field is not text"),
            },
        },
        RuleCheckDef {
            id: "rule.vat_identity",
            applies: |field, value| {
                matches!(value, FieldData::Money(_)) && matches!(field, "net" | "vat" | "gross")
            },
            run: vat_identity,
        },
        RuleCheckDef {
            id: "rule.vat_line_identity",
            applies: |field, value| {
                matches!(value, FieldData::Money(_)) && parse_vat_line_field(field).is_some()
            },
            run: vat_line_identity,
        },
        RuleCheckDef {
            id: "rule.rate_range",
            applies: |_, value| matches!(value, FieldData::Decimal(_)),
            run: |_, _, value| match value {
                FieldData::Decimal(d) => {
                    if (Decimal::ZERO..=Decimal::new(100, 0)).contains(d) {
                        RuleOutcome::pass()
                    } else {
                        RuleOutcome::fail(format!("rate {d} outside [0, 100]"))
                    }
                }
                _ => RuleOutcome::fail("not a decimal"),
            },
        },
        RuleCheckDef {
            id: "rule.date_sane",
            applies: |_, value| matches!(value, FieldData::Date(_)),
            run: |_, _, value| match value {
                FieldData::Date(d) => {
                    // Bookkeeping horizon: nothing before 2000, nothing more
                    // than a year ahead.
                    let year = chrono_year(*d);
                    if (2000..=chrono_year(today()) + 1).contains(&year) {
                        RuleOutcome::pass()
                    } else {
                        RuleOutcome::fail(format!("date {d} outside plausible range"))
                    }
                }
                _ => RuleOutcome::fail("not a date"),
            },
        },
        RuleCheckDef {
            id: "rule.text_nonempty",
            applies: |field, value| {
                matches!(value, FieldData::Text(_))
                    && !field.ends_with("oib")
                    && field != "fiscal_id"
                    && !field.ends_with("iban")
                    && !field.ends_with("vat_id")
            },
            run: |_, _, value| match value {
                FieldData::Text(s) if !s.trim().is_empty() => RuleOutcome::pass(),
                _ => RuleOutcome::fail("empty text"),
            },
        },
        RuleCheckDef {
            id: "rule.amount_nonnegative",
            applies: |field, value| {
                matches!(value, FieldData::Money(_)) && !matches!(field, "net" | "vat" | "gross")
            },
            run: |_, _, value| match value {
                FieldData::Money(m) if m.amount >= Decimal::ZERO => RuleOutcome::pass(),
                FieldData::Money(m) => RuleOutcome::fail(format!("negative amount {}", m.amount)),
                _ => RuleOutcome::fail("not money"),
            },
        },
    ]
}

/// `net + vat = gross`, within the monetary tolerance. The tolerance is
/// applied by the caller; the rule reports the exact recomputed value.
fn vat_identity(doc: &ExtractedDoc, field: &str, _value: &FieldData) -> RuleOutcome {
    let (Some(net), Some(vat), Some(gross)) =
        (doc.money("net"), doc.money("vat"), doc.money("gross"))
    else {
        return RuleOutcome::fail("net/vat/gross triplet incomplete");
    };
    if net.currency != vat.currency || vat.currency != gross.currency {
        return RuleOutcome::fail("net/vat/gross currencies differ");
    }
    let recomputed = match field {
        "net" => gross.amount - vat.amount,
        "vat" => gross.amount - net.amount,
        "gross" => net.amount + vat.amount,
        _ => return RuleOutcome::fail("vat identity on unknown field"),
    };
    let mut money = net.clone();
    money.amount = recomputed;
    RuleOutcome {
        // Definitive ok is decided against tolerance by the verifier.
        ok: true,
        expected: Some(FieldData::Money(money)),
        diagnostic: None,
    }
}

/// `"vat_lines[3].base"` → `(3, "base")`.
fn parse_vat_line_field(field: &str) -> Option<(usize, &str)> {
    let rest = field.strip_prefix("vat_lines[")?;
    let close = rest.find(']')?;
    let index: usize = rest[..close].parse().ok()?;
    let part = rest[close + 1..].strip_prefix('.')?;
    match part {
        "base" | "vat" => Some((index, part)),
        _ => None,
    }
}

/// Per-VAT-block identities: `vat = base × rate / 100`, and the bases
/// reconcile against the document net (`base_i = net − Σ other bases`).
fn vat_line_identity(doc: &ExtractedDoc, field: &str, _value: &FieldData) -> RuleOutcome {
    let Some((index, part)) = parse_vat_line_field(field) else {
        return RuleOutcome::fail("not a vat line field");
    };
    let line_money = |i: usize, part: &str| doc.money(&format!("vat_lines[{i}].{part}"));
    let rate = doc
        .fields
        .get(&format!("vat_lines[{index}].rate"))
        .and_then(|f| match &f.value {
            FieldData::Decimal(d) => Some(*d),
            _ => None,
        });

    match part {
        "vat" => {
            let (Some(base), Some(rate)) = (line_money(index, "base"), rate) else {
                return RuleOutcome::fail("vat line base or rate missing");
            };
            let mut expected = base.clone();
            expected.amount = (base.amount * rate / Decimal::new(100, 0)).round_dp(2);
            RuleOutcome {
                ok: true,
                expected: Some(FieldData::Money(expected)),
                diagnostic: None,
            }
        }
        "base" => {
            let Some(net) = doc.money("net") else {
                return RuleOutcome::fail("document net missing");
            };
            let mut other_sum = Decimal::ZERO;
            let mut j = 0usize;
            while let Some(base) = line_money(j, "base") {
                if j != index {
                    other_sum += base.amount;
                }
                j += 1;
            }
            let mut expected = net.clone();
            expected.amount = net.amount - other_sum;
            RuleOutcome {
                ok: true,
                expected: Some(FieldData::Money(expected)),
                diagnostic: None,
            }
        }
        _ => RuleOutcome::fail("not a vat line field"),
    }
}

// ---------------------------------------------------------------------------
// Checksums
// ---------------------------------------------------------------------------

/// ISO 7064 MOD 11,10 check over an eleven-digit Croatian OIB.
#[must_use]
pub fn oib_checksum_ok(oib: &str) -> bool {
    let digits: Vec<u32> = oib.chars().filter_map(|c| c.to_digit(10)).collect();
    if digits.len() != 11 || oib.len() != 11 {
        return false;
    }
    let mut a: u32 = 10;
    for &d in &digits[..10] {
        a = (a + d) % 10;
        if a == 0 {
            a = 10;
        }
        a = (a * 2) % 11;
    }
    let control = (11 - a) % 10;
    control == digits[10]
}

/// IBAN mod-97 check (ISO 13616).
#[must_use]
pub fn iban_mod97_ok(iban: &str) -> bool {
    let cleaned: String = iban.chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.len() < 15 || cleaned.len() > 34 {
        return false;
    }
    if !cleaned.chars().all(|c| c.is_ascii_alphanumeric()) {
        return false;
    }
    let rearranged = format!("{}{}", &cleaned[4..], &cleaned[..4]);
    let mut remainder: u32 = 0;
    for c in rearranged.chars() {
        let value = match c.to_digit(36) {
            Some(v) => v,
            None => return false,
        };
        if value < 10 {
            remainder = (remainder * 10 + value) % 97;
        } else {
            remainder = (remainder * 100 + value) % 97;
        }
    }
    remainder == 1
}

/// Country-prefixed VAT id syntax. Croatian ids also pass the OIB check.
#[must_use]
pub fn vat_id_syntax_ok(vat_id: &str) -> bool {
    let cleaned: String = vat_id.chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.len() < 4 {
        return false;
    }
    let (prefix, rest) = cleaned.split_at(2);
    if !prefix.chars().all(|c| c.is_ascii_uppercase()) {
        return false;
    }
    match prefix {
        "DE" => rest.len() == 9 && rest.chars().all(|c| c.is_ascii_digit()),
        "HR" => oib_checksum_ok(rest),
        "AT" => rest.len() == 9 && rest.starts_with('U'),
        "SI" => rest.len() == 8 && rest.chars().all(|c| c.is_ascii_digit()),
        "IT" | "LV" => rest.len() == 11 && rest.chars().all(|c| c.is_ascii_digit()),
        _ => (2..=12).contains(&rest.len()) && rest.chars().all(|c| c.is_ascii_alphanumeric()),
    }
}

fn chrono_year(d: chrono::NaiveDate) -> i32 {
    use chrono::Datelike;
    d.year()
}

fn today() -> chrono::NaiveDate {
    chrono::Utc::now().date_naive()
}
