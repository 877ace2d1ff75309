// SPDX-License-Identifier: MIT OR Apache-2.0
//! Triple-check consensus records attached to verified documents.

use crate::doc::{ExtractedDoc, FieldData};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Which of the three independent sources produced a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckSource {
    /// The primary (AI-side) extractor's value.
    Ai,
    /// An independent extractor or closed-form recomputation.
    Algo,
    /// A domain predicate: checksum, range, cross-field identity.
    Rule,
}

impl fmt::Display for CheckSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ai => "ai",
            Self::Algo => "algo",
            Self::Rule => "rule",
        };
        f.write_str(s)
    }
}

/// One of the three checks run for a field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Check {
    /// Source that produced this check.
    pub source: CheckSource,
    /// The value this source arrived at, if it produced one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<FieldData>,
    /// Whether this check agrees with the admitted value / predicate.
    pub ok: bool,
    /// Diagnostic when `ok` is false or the source was missing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
}

/// How many of the three checks agreed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Agreement {
    /// All three checks agree; the field is admitted.
    ThreeOfThree,
    /// Two agree, one differs; admitted with a warning.
    TwoOfThree,
    /// No majority; the field is rejected.
    OneOfThree,
    /// No check produced a usable value.
    None,
}

impl Agreement {
    /// Returns `true` if the field may enter a booking.
    #[must_use]
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::ThreeOfThree | Self::TwoOfThree)
    }

    /// Returns `true` if the approval UI must surface a warning.
    #[must_use]
    pub fn has_warning(&self) -> bool {
        matches!(self, Self::TwoOfThree)
    }
}

/// Consensus over a single field: the checks, the agreement, the score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Consensus {
    /// The checks in source order (ai, algo, rule).
    pub checks: Vec<Check>,
    /// Agreement level.
    pub agreement: Agreement,
    /// Score in `[0, 1]`; gates pipeline auto-advance.
    pub score: f64,
    /// Whether the field may enter a booking.
    ///
    /// Usually follows the agreement level, with one exception: a failed
    /// rule check on a monetary or identifier field rejects the field
    /// even at 2-of-3 — a checksum does not lose a majority vote.
    pub admitted: bool,
}

impl Consensus {
    /// Returns `true` if this field blocks auto-advance.
    #[must_use]
    pub fn is_blocking(&self) -> bool {
        !self.admitted
    }
}

/// An extracted document with per-field consensus attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifiedDoc {
    /// The underlying extraction.
    pub doc: ExtractedDoc,
    /// Consensus per field name.
    pub verification: BTreeMap<String, Consensus>,
}

impl VerifiedDoc {
    /// Lowest per-field score, or 1.0 for an empty map.
    #[must_use]
    pub fn min_score(&self) -> f64 {
        self.verification
            .values()
            .map(|c| c.score)
            .fold(1.0, f64::min)
    }

    /// Lowest score among monetary fields, or 1.0 when there are none.
    ///
    /// This is the auto-advance gate: monetary fields always carry a
    /// closed-form recomputation and can reach 3-of-3, while descriptive
    /// fields without an independent extraction top out at 2-of-3 and
    /// surface as warnings instead of blocking.
    #[must_use]
    pub fn monetary_min_score(&self) -> f64 {
        self.verification
            .iter()
            .filter(|(name, _)| {
                self.doc
                    .fields
                    .get(*name)
                    .map(|f| matches!(f.value, FieldData::Money(_)))
                    .unwrap_or(false)
            })
            .map(|(_, c)| c.score)
            .fold(1.0, f64::min)
    }

    /// Field names whose consensus blocks auto-advance.
    pub fn blocking_fields(&self) -> impl Iterator<Item = &String> {
        self.verification
            .iter()
            .filter(|(_, c)| c.is_blocking())
            .map(|(name, _)| name)
    }

    /// Field names admitted with a warning (2of3).
    pub fn warned_fields(&self) -> impl Iterator<Item = &String> {
        self.verification
            .iter()
            .filter(|(_, c)| c.agreement.has_warning())
            .map(|(name, _)| name)
    }
}
