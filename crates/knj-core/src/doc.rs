// SPDX-License-Identifier: MIT OR Apache-2.0
//! Extracted documents: classes, tiers, fields, provenance.

use crate::money::{Currency, Money};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Content address of an uploaded blob (hex SHA-256 of its bytes).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobId(pub String);

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical catalog of supported document classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocClass {
    /// Domestic purchase invoice.
    InvoiceIn,
    /// Outgoing sales invoice.
    InvoiceOut,
    /// Intra-EU purchase invoice (reverse charge territory).
    InvoiceEu,
    /// Bank account statement.
    BankStmt,
    /// Payroll input sheet.
    PayrollInput,
    /// Travel order with per-diem lines.
    TravelOrder,
    /// Cash register daily report.
    CashRegister,
}

impl DocClass {
    /// All supported classes, in catalog order.
    pub const ALL: &'static [DocClass] = &[
        DocClass::InvoiceIn,
        DocClass::InvoiceOut,
        DocClass::InvoiceEu,
        DocClass::BankStmt,
        DocClass::PayrollInput,
        DocClass::TravelOrder,
        DocClass::CashRegister,
    ];

    /// Day-first date parsing hint for ambiguous numeric dates.
    ///
    /// Every class in the catalog originates from day-first locales; the
    /// hint exists so a future class can opt out without touching parsers.
    #[must_use]
    pub fn day_first_dates(&self) -> bool {
        true
    }

    /// Returns `true` for classes that produce invoice-like bookings.
    #[must_use]
    pub fn is_invoice_like(&self) -> bool {
        matches!(
            self,
            DocClass::InvoiceIn | DocClass::InvoiceOut | DocClass::InvoiceEu
        )
    }
}

impl fmt::Display for DocClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DocClass::InvoiceIn => "invoice_in",
            DocClass::InvoiceOut => "invoice_out",
            DocClass::InvoiceEu => "invoice_eu",
            DocClass::BankStmt => "bank_stmt",
            DocClass::PayrollInput => "payroll_input",
            DocClass::TravelOrder => "travel_order",
            DocClass::CashRegister => "cash_register",
        };
        f.write_str(s)
    }
}

/// Extraction tier, ordered by fidelity. Higher tiers are tried first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceTier {
    /// Operator-entered values.
    Manual,
    /// OCR via the vision model.
    VisionOcr,
    /// Regex / line-grammar over plain text.
    Regex,
    /// Layout template match.
    TemplateMatch,
    /// Structured XML with a known schema.
    StructuredXml,
}

impl SourceTier {
    /// Tiers in fallback order, highest fidelity first.
    pub const FALLBACK_ORDER: &'static [SourceTier] = &[
        SourceTier::StructuredXml,
        SourceTier::TemplateMatch,
        SourceTier::Regex,
        SourceTier::VisionOcr,
    ];
}

/// Where a field value came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    /// Tier that produced the value.
    pub tier: SourceTier,
    /// Registered extractor or check identifier.
    pub extractor_id: String,
    /// Optional byte span in the source text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span: Option<(usize, usize)>,
}

/// A typed field value. The closed set of shapes a field may take.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldData {
    /// Free text (already NFC-normalized).
    Text(String),
    /// A non-monetary decimal (rate, quantity).
    Decimal(Decimal),
    /// A calendar date.
    Date(NaiveDate),
    /// A monetary amount with currency.
    Money(Money),
}

impl FieldData {
    /// Returns the contained money, if this is a monetary field.
    #[must_use]
    pub fn as_money(&self) -> Option<&Money> {
        match self {
            FieldData::Money(m) => Some(m),
            _ => None,
        }
    }

    /// Returns the contained text, if any.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldData::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the contained date, if any.
    #[must_use]
    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            FieldData::Date(d) => Some(*d),
            _ => None,
        }
    }
}

/// A field with its extraction confidence and provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldValue {
    /// The typed value.
    pub value: FieldData,
    /// Extractor confidence in `[0, 1]`.
    pub confidence: f64,
    /// Which extractor produced it, and where from.
    pub provenance: Provenance,
}

impl FieldValue {
    /// A full-confidence value from the given tier and extractor.
    #[must_use]
    pub fn certain(value: FieldData, tier: SourceTier, extractor_id: &str) -> Self {
        Self {
            value,
            confidence: 1.0,
            provenance: Provenance {
                tier,
                extractor_id: extractor_id.to_string(),
                span: None,
            },
        }
    }

    /// Same value with a reduced confidence.
    #[must_use]
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }
}

/// A lower-tier extraction retained for the verifier's algorithmic check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShadowExtraction {
    /// Tier of the shadow extractor.
    pub tier: SourceTier,
    /// Registered extractor identifier.
    pub extractor_id: String,
    /// The fields it produced.
    pub fields: BTreeMap<String, FieldValue>,
}

/// Normalized output of the extractor fabric for one blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedDoc {
    /// Content address of the source blob.
    pub blob_id: BlobId,
    /// Document class the fabric settled on.
    pub doc_class: DocClass,
    /// Extracted fields by canonical field name.
    pub fields: BTreeMap<String, FieldValue>,
    /// Tier of the winning extractor.
    pub source_tier: SourceTier,
    /// BCP-47 language tag of the document text.
    pub language: String,
    /// Document currency.
    pub currency: Currency,
    /// Lower-tier extractions kept for cross-checking.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shadows: Vec<ShadowExtraction>,
}

impl ExtractedDoc {
    /// Field names of every monetary field, in key order.
    pub fn monetary_fields(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.fields
            .iter()
            .filter(|(_, fv)| matches!(fv.value, FieldData::Money(_)))
    }

    /// Look up a field's money value.
    #[must_use]
    pub fn money(&self, name: &str) -> Option<&Money> {
        self.fields.get(name).and_then(|fv| fv.value.as_money())
    }

    /// Look up a field's text value.
    #[must_use]
    pub fn text(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(|fv| fv.value.as_text())
    }

    /// Look up a field's date value.
    #[must_use]
    pub fn date(&self, name: &str) -> Option<NaiveDate> {
        self.fields.get(name).and_then(|fv| fv.value.as_date())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn tiers_fall_back_in_fidelity_order() {
        let order = SourceTier::FALLBACK_ORDER;
        assert_eq!(order[0], SourceTier::StructuredXml);
        assert_eq!(order[order.len() - 1], SourceTier::VisionOcr);
        // Ord agrees with fallback priority.
        assert!(SourceTier::StructuredXml > SourceTier::Regex);
    }

    #[test]
    fn monetary_fields_are_filtered() {
        let mut fields = BTreeMap::new();
        fields.insert(
            "net".to_string(),
            FieldValue::certain(
                FieldData::Money(Money::new(dec!(100), Currency::eur())),
                SourceTier::StructuredXml,
                "xml",
            ),
        );
        fields.insert(
            "narrative".to_string(),
            FieldValue::certain(
                FieldData::Text("uredski materijal".into()),
                SourceTier::StructuredXml,
                "xml",
            ),
        );
        let doc = ExtractedDoc {
            blob_id: BlobId("ab".into()),
            doc_class: DocClass::InvoiceIn,
            fields,
            source_tier: SourceTier::StructuredXml,
            language: "hr".into(),
            currency: Currency::eur(),
            shadows: vec![],
        };
        assert_eq!(doc.monetary_fields().count(), 1);
        assert!(doc.money("net").is_some());
        assert!(doc.money("narrative").is_none());
    }

    #[test]
    fn doc_class_serde_tags_are_snake_case() {
        let v = serde_json::to_value(DocClass::InvoiceEu).unwrap();
        assert_eq!(v, serde_json::json!("invoice_eu"));
        assert_eq!(DocClass::InvoiceEu.to_string(), "invoice_eu");
    }
}
