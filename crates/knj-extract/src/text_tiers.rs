// SPDX-License-Identifier: MIT OR Apache-2.0
//! Text-based extraction tiers: layout templates and regex grammar.
//!
//! Both tiers work over normalized plain text. The template tier matches
//! known supplier layouts by anchor labels; the regex tier is the
//! last-resort grammar before the vision model, and it is also reused to
//! structure OCR output.

use crate::normalize::{normalize_text, parse_date};
use crate::{ExtractInput, ExtractOutcome, Extractor};
use async_trait::async_trait;
use knj_core::{
    parse_localized_decimal, Currency, DocClass, ExtractedDoc, FieldData, FieldValue, Money,
    SourceTier,
};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Template tier
// ---------------------------------------------------------------------------

/// One anchor of a layout template: a label introducing a field value.
pub struct TemplateAnchor {
    /// Field name the anchor feeds.
    pub field: &'static str,
    /// Label text that precedes the value on its line.
    pub label: &'static str,
    /// How to interpret the value text.
    pub kind: AnchorKind,
}

/// Value interpretation for a template anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnchorKind {
    /// Plain text.
    Text,
    /// Localized decimal treated as money in the document currency.
    Money,
    /// A calendar date.
    Date,
}

/// A known supplier layout.
pub struct LayoutTemplate {
    /// Stable template identifier.
    pub id: &'static str,
    /// Text that must appear for this template to apply.
    pub marker: &'static str,
    /// Anchors to scan for.
    pub anchors: Vec<TemplateAnchor>,
}

/// Built-in layouts for the invoice prints the office receives most.
pub fn default_templates() -> Vec<LayoutTemplate> {
    vec![LayoutTemplate {
        id: "template.invoice_hr",
        marker: "RAČUN",
        anchors: vec![
            TemplateAnchor {
                field: "supplier_oib",
                label: "OIB:",
                kind: AnchorKind::Text,
            },
            TemplateAnchor {
                field: "invoice_number",
                label: "Račun br:",
                kind: AnchorKind::Text,
            },
            TemplateAnchor {
                field: "issue_date",
                label: "Datum:",
                kind: AnchorKind::Date,
            },
            TemplateAnchor {
                field: "net",
                label: "Osnovica:",
                kind: AnchorKind::Money,
            },
            TemplateAnchor {
                field: "vat",
                label: "PDV:",
                kind: AnchorKind::Money,
            },
            TemplateAnchor {
                field: "gross",
                label: "Ukupno:",
                kind: AnchorKind::Money,
            },
        ],
    }]
}

/// Template-match tier over plain text documents.
pub struct TemplateExtractor {
    templates: Vec<LayoutTemplate>,
    home_currency: Currency,
}

impl TemplateExtractor {
    /// Build with an explicit template table.
    #[must_use]
    pub fn new(templates: Vec<LayoutTemplate>, home_currency: Currency) -> Self {
        Self {
            templates,
            home_currency,
        }
    }
}

#[async_trait]
impl Extractor for TemplateExtractor {
    fn id(&self) -> &'static str {
        "template.match"
    }

    fn tier(&self) -> SourceTier {
        SourceTier::TemplateMatch
    }

    fn accepts(&self, input: &ExtractInput) -> bool {
        input.media_type.starts_with("text/plain")
    }

    async fn extract(&self, input: &ExtractInput) -> ExtractOutcome {
        let Ok(text) = std::str::from_utf8(&input.bytes) else {
            return ExtractOutcome::no_match("template.match: not utf-8");
        };
        let Some(template) = self
            .templates
            .iter()
            .find(|t| text.to_uppercase().contains(t.marker))
        else {
            return ExtractOutcome::no_match("template.match: no marker matched");
        };

        match extract_text_fields(
            text,
            &template.anchors,
            template.id,
            SourceTier::TemplateMatch,
            &self.home_currency,
        ) {
            Some(fields) if fields.contains_key("gross") || fields.contains_key("net") => {
                ExtractOutcome::Extracted(ExtractedDoc {
                    blob_id: input.blob_id.clone(),
                    doc_class: input.doc_class_hint.unwrap_or(DocClass::InvoiceIn),
                    fields,
                    source_tier: SourceTier::TemplateMatch,
                    language: "hr".into(),
                    currency: self.home_currency.clone(),
                    shadows: vec![],
                })
            }
            _ => ExtractOutcome::no_match(format!("{}: anchors missing", template.id)),
        }
    }
}

/// Scan `text` line by line for anchor labels.
pub(crate) fn extract_text_fields(
    text: &str,
    anchors: &[TemplateAnchor],
    extractor_id: &str,
    tier: SourceTier,
    currency: &Currency,
) -> Option<BTreeMap<String, FieldValue>> {
    let mut fields = BTreeMap::new();
    for line in text.lines() {
        let line = normalize_text(line);
        for anchor in anchors {
            if fields.contains_key(anchor.field) {
                continue;
            }
            let Some(idx) = line.find(anchor.label) else {
                continue;
            };
            let value_text = line[idx + anchor.label.len()..].trim();
            if value_text.is_empty() {
                continue;
            }
            let field = match anchor.kind {
                AnchorKind::Text => Some(FieldValue::certain(
                    FieldData::Text(value_text.to_string()),
                    tier,
                    extractor_id,
                )),
                AnchorKind::Money => parse_localized_decimal(value_text).ok().map(|amount| {
                    FieldValue::certain(
                        FieldData::Money(Money::new(amount, currency.clone())),
                        tier,
                        extractor_id,
                    )
                }),
                AnchorKind::Date => parse_date(value_text, true).map(|parsed| {
                    let fv = FieldValue::certain(
                        FieldData::Date(parsed.date),
                        tier,
                        extractor_id,
                    );
                    if parsed.ambiguous {
                        fv.with_confidence(0.4)
                    } else {
                        fv
                    }
                }),
            };
            if let Some(field_value) = field {
                fields.insert(anchor.field.to_string(), field_value);
            }
        }
    }
    if fields.is_empty() {
        None
    } else {
        Some(fields)
    }
}

// ---------------------------------------------------------------------------
// Regex tier
// ---------------------------------------------------------------------------

static RE_OIB: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bOIB[:\s]*(\d{11})\b").expect("oib regex"));
static RE_IBAN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b([A-Z]{2}\d{2}[A-Z0-9]{11,30})\b").expect("iban regex"));
static RE_GROSS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:ukupno|za\s+platiti|total)[:\s]*([0-9][0-9 .,]*)").expect("gross regex")
});
static RE_NET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?:osnovica|neto|net)[:\s]*([0-9][0-9 .,]*)").expect("net regex"));
static RE_VAT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?:pdv|vat)[:\s]*([0-9][0-9 .,]*)").expect("vat regex"));
static RE_DATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(\d{1,2}[./]\d{1,2}[./]\d{4}\.?|\d{4}-\d{2}-\d{2})\b").expect("date regex")
});

/// Regex / line-grammar tier: the last text tier before vision OCR.
pub struct RegexExtractor {
    home_currency: Currency,
}

impl RegexExtractor {
    /// Build with the deployment's home currency.
    #[must_use]
    pub fn new(home_currency: Currency) -> Self {
        Self { home_currency }
    }

    /// Extract fields from already-obtained text. Shared with the vision
    /// tier, which structures OCR output through the same grammar.
    #[must_use]
    pub fn extract_from_text(
        &self,
        text: &str,
        extractor_id: &str,
        tier: SourceTier,
    ) -> BTreeMap<String, FieldValue> {
        let text = normalize_text(text);
        let mut fields = BTreeMap::new();

        let mut capture_money = |re: &Regex, name: &str, confidence: f64| {
            if let Some(cap) = re.captures(&text)
                && let Ok(amount) = parse_localized_decimal(cap[1].trim())
            {
                fields.insert(
                    name.to_string(),
                    FieldValue::certain(
                        FieldData::Money(Money::new(amount, self.home_currency.clone())),
                        tier,
                        extractor_id,
                    )
                    .with_confidence(confidence),
                );
            }
        };
        capture_money(&RE_NET, "net", 0.8);
        capture_money(&RE_VAT, "vat", 0.8);
        capture_money(&RE_GROSS, "gross", 0.8);

        if let Some(cap) = RE_OIB.captures(&text) {
            fields.insert(
                "supplier_oib".to_string(),
                FieldValue::certain(FieldData::Text(cap[1].to_string()), tier, extractor_id)
                    .with_confidence(0.9),
            );
        }
        if let Some(cap) = RE_IBAN.captures(&text) {
            fields.insert(
                "supplier_iban".to_string(),
                FieldValue::certain(FieldData::Text(cap[1].to_string()), tier, extractor_id)
                    .with_confidence(0.85),
            );
        }
        if let Some(cap) = RE_DATE.captures(&text)
            && let Some(parsed) = parse_date(&cap[1], true)
        {
            let confidence = if parsed.ambiguous { 0.4 } else { 0.75 };
            fields.insert(
                "issue_date".to_string(),
                FieldValue::certain(FieldData::Date(parsed.date), tier, extractor_id)
                    .with_confidence(confidence),
            );
        }
        fields
    }
}

#[async_trait]
impl Extractor for RegexExtractor {
    fn id(&self) -> &'static str {
        "regex.grammar"
    }

    fn tier(&self) -> SourceTier {
        SourceTier::Regex
    }

    fn accepts(&self, input: &ExtractInput) -> bool {
        input.media_type.starts_with("text/plain")
    }

    async fn extract(&self, input: &ExtractInput) -> ExtractOutcome {
        let Ok(text) = std::str::from_utf8(&input.bytes) else {
            return ExtractOutcome::no_match("regex.grammar: not utf-8");
        };
        let fields = self.extract_from_text(text, "regex.grammar", SourceTier::Regex);
        if fields.contains_key("gross") || fields.contains_key("net") {
            ExtractOutcome::Extracted(ExtractedDoc {
                blob_id: input.blob_id.clone(),
                doc_class: input.doc_class_hint.unwrap_or(DocClass::InvoiceIn),
                fields,
                source_tier: SourceTier::Regex,
                language: "hr".into(),
                currency: self.home_currency.clone(),
                shadows: vec![],
            })
        } else {
            ExtractOutcome::no_match("regex.grammar: no monetary total found")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use knj_core::BlobId;
    use rust_decimal_macros::dec;

    const PRINTED: &str = "\
RAČUN br. 2026-0042
Tvrtka d.o.o., OIB: 12345678903
Datum: 15.03.2026.
Osnovica: 1.000,00
PDV: 250,00
Ukupno: 1.250,00
";

    fn input(text: &str) -> ExtractInput {
        ExtractInput {
            blob_id: BlobId("ef".into()),
            media_type: "text/plain".into(),
            bytes: text.as_bytes().to_vec(),
            doc_class_hint: Some(DocClass::InvoiceIn),
        }
    }

    #[tokio::test]
    async fn regex_tier_reads_printed_invoice() {
        let ex = RegexExtractor::new(Currency::eur());
        let ExtractOutcome::Extracted(doc) = ex.extract(&input(PRINTED)).await else {
            panic!("expected extraction");
        };
        assert_eq!(doc.money("gross").unwrap().amount, dec!(1250.00));
        assert_eq!(doc.money("net").unwrap().amount, dec!(1000.00));
        assert_eq!(doc.text("supplier_oib"), Some("12345678903"));
        assert!(doc.fields["net"].confidence < 1.0);
    }

    #[tokio::test]
    async fn template_tier_wins_on_known_layout() {
        let ex = TemplateExtractor::new(default_templates(), Currency::eur());
        let sample = PRINTED.replace("RAČUN br. 2026-0042", "RAČUN\nRačun br: 2026-0042");
        let ExtractOutcome::Extracted(doc) = ex.extract(&input(&sample)).await else {
            panic!("expected extraction");
        };
        assert_eq!(doc.source_tier, SourceTier::TemplateMatch);
        assert_eq!(doc.text("invoice_number"), Some("2026-0042"));
        assert_eq!(doc.money("vat").unwrap().amount, dec!(250.00));
    }

    #[tokio::test]
    async fn unknown_text_is_no_match() {
        let ex = RegexExtractor::new(Currency::eur());
        let outcome = ex.extract(&input("nothing to see here")).await;
        assert!(matches!(outcome, ExtractOutcome::NoMatch { .. }));
    }

    #[test]
    fn ambiguous_date_lowers_confidence() {
        let ex = RegexExtractor::new(Currency::eur());
        let fields =
            ex.extract_from_text("Ukupno: 100,00 dana 03/04/2026", "regex.grammar", SourceTier::Regex);
        assert!(fields["issue_date"].confidence < 0.5);
    }
}
