// SPDX-License-Identifier: MIT OR Apache-2.0
//! Legal citations attached to bookings.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A provenance citation: which law, which article, in force when.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CitationRef {
    /// Short law code, e.g. `"ZPDV"` for the VAT act.
    pub law_code: String,
    /// Article number.
    pub article: u32,
    /// Paragraph number, when the citation is paragraph-precise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paragraph: Option<u32>,
    /// Official gazette reference, e.g. `"NN 73/13"`.
    pub gazette_ref: String,
    /// Business-event date on which this version was in force.
    pub effective_on: NaiveDate,
}

impl fmt::Display for CitationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} čl. {}", self.law_code, self.article)?;
        if let Some(p) = self.paragraph {
            write!(f, " st. {p}")?;
        }
        write!(f, " ({})", self.gazette_ref)
    }
}
