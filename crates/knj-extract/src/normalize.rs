// SPDX-License-Identifier: MIT OR Apache-2.0
//! Text, number, and date normalization shared by all extraction tiers.

use chrono::NaiveDate;
use unicode_normalization::UnicodeNormalization;

/// NFC-normalize and collapse whitespace runs to single spaces.
#[must_use]
pub fn normalize_text(raw: &str) -> String {
    let nfc: String = raw.nfc().collect();
    nfc.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Outcome of parsing a possibly ambiguous date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedDate {
    /// The parsed date under the applied convention.
    pub date: NaiveDate,
    /// Set when day-first and month-first readings both parse to
    /// different dates; the caller must flag the field low-confidence.
    pub ambiguous: bool,
}

/// Parse a date string, resolving numeric ambiguity with `day_first`.
///
/// ISO dates and dotted Croatian dates (`15.03.2026.`) are never
/// ambiguous. Slash dates like `03/04/2026` parse under the hint but are
/// marked ambiguous whenever the other convention is also valid and
/// yields a different day.
#[must_use]
pub fn parse_date(raw: &str, day_first: bool) -> Option<ParsedDate> {
    let s = raw.trim().trim_end_matches('.');

    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(ParsedDate {
            date,
            ambiguous: false,
        });
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%d.%m.%Y") {
        return Some(ParsedDate {
            date,
            ambiguous: false,
        });
    }

    let day_first_parse = NaiveDate::parse_from_str(s, "%d/%m/%Y").ok();
    let month_first_parse = NaiveDate::parse_from_str(s, "%m/%d/%Y").ok();
    match (day_first_parse, month_first_parse) {
        (Some(df), Some(mf)) => {
            let date = if day_first { df } else { mf };
            Some(ParsedDate {
                date,
                ambiguous: df != mf,
            })
        }
        (Some(df), None) => Some(ParsedDate {
            date: df,
            ambiguous: false,
        }),
        (None, Some(mf)) => Some(ParsedDate {
            date: mf,
            ambiguous: false,
        }),
        (None, None) => None,
    }
}
