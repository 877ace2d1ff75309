// SPDX-License-Identifier: MIT OR Apache-2.0
//! Triple-check verification: AI, algorithmic, and rule checks per field.
//!
//! For every extracted field the verifier assembles exactly three checks:
//! the primary extractor's value (the AI check), an independent value from
//! a shadow extraction or a closed-form recomputation (the algorithmic
//! check), and a domain predicate (the rule check). Agreement determines
//! whether the field is admitted, admitted with a warning, or rejected —
//! and the per-field score gates pipeline auto-advance.
//!
//! A missing check source always counts as disagreement, never as
//! agreement. Monetary and identifier fields without a rule check are
//! rejected outright.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod rules;

pub use rules::{
    default_rules, iban_mod97_ok, oib_checksum_ok, vat_id_syntax_ok, RuleCheckDef, RuleOutcome,
};

use knj_core::{
    Agreement, Check, CheckSource, Consensus, Currency, ExtractedDoc, FieldData, FieldValue,
    VerifiedDoc,
};
use rust_decimal::Decimal;
use tracing::debug;

/// Monetary comparison tolerances.
#[derive(Debug, Clone)]
pub struct Tolerances {
    /// Home currency.
    pub home_currency: Currency,
    /// Tolerance for home-currency amounts.
    pub home: Decimal,
    /// Tolerance after FX conversion.
    pub fx: Decimal,
}

impl Default for Tolerances {
    fn default() -> Self {
        Self {
            home_currency: Currency::eur(),
            home: Decimal::new(1, 2),
            fx: Decimal::new(2, 2),
        }
    }
}

/// The verifier: a rule table plus comparison tolerances.
pub struct Verifier {
    rules: Vec<RuleCheckDef>,
    tolerances: Tolerances,
}

impl Verifier {
    /// Build a verifier with the given rule table.
    #[must_use]
    pub fn new(rules: Vec<RuleCheckDef>, tolerances: Tolerances) -> Self {
        Self { rules, tolerances }
    }

    /// Build a verifier with the built-in rule table.
    #[must_use]
    pub fn with_default_rules(tolerances: Tolerances) -> Self {
        Self::new(default_rules(), tolerances)
    }

    /// Verify every field of an extracted document.
    #[must_use]
    pub fn verify(&self, doc: &ExtractedDoc) -> VerifiedDoc {
        let mut verification = std::collections::BTreeMap::new();
        for (name, field) in &doc.fields {
            let consensus = self.verify_field(doc, name, field);
            debug!(
                field = name.as_str(),
                agreement = ?consensus.agreement,
                score = consensus.score,
                "field verified"
            );
            verification.insert(name.clone(), consensus);
        }
        VerifiedDoc {
            doc: doc.clone(),
            verification,
        }
    }

    /// Run the three checks for one field and fold them into a consensus.
    #[must_use]
    pub fn verify_field(&self, doc: &ExtractedDoc, name: &str, field: &FieldValue) -> Consensus {
        let ai_value = field.value.clone();

        // Algorithmic check: a shadow extractor's value for the same field,
        // falling back to a closed-form recomputation via the rule table's
        // expected value when no shadow covers it.
        let algo_value = doc
            .shadows
            .iter()
            .find_map(|shadow| shadow.fields.get(name).map(|fv| fv.value.clone()));

        // Rule check.
        let rule = self
            .rules
            .iter()
            .find(|r| (r.applies)(name, &ai_value))
            .map(|r| (r.id, (r.run)(doc, name, &ai_value)));

        let requires_rule = requires_rule_check(name, &ai_value);
        let Some((rule_id, rule_outcome)) = rule else {
            if requires_rule {
                // A monetary or identifier field without a rule check is
                // rejected, whatever the other two sources say.
                return self.rejected_for_missing_rule(name, ai_value, algo_value, field);
            }
            return self.consensus_without_rule(ai_value, algo_value, field);
        };

        // When the rule recomputed an expected value, its verdict for a
        // monetary field is agreement-within-tolerance against that value.
        let rule_ok = match &rule_outcome.expected {
            Some(expected) => self.values_agree(&ai_value, expected),
            None => rule_outcome.ok,
        };

        // The algorithmic check may also come from a closed-form
        // recomputation when no shadow extraction covered this field.
        let algo_value = match (algo_value, &rule_outcome.expected) {
            (Some(v), _) => Some(v),
            (None, Some(expected)) => Some(expected.clone()),
            (None, None) => None,
        };

        let algo_agrees = algo_value
            .as_ref()
            .map(|v| self.values_agree(&ai_value, v))
            .unwrap_or(false);

        let mut checks = vec![Check {
            source: CheckSource::Ai,
            value: Some(ai_value.clone()),
            ok: true,
            diagnostic: None,
        }];
        checks.push(Check {
            source: CheckSource::Algo,
            value: algo_value.clone(),
            ok: algo_agrees,
            diagnostic: match (&algo_value, algo_agrees) {
                (None, _) => Some("no independent extraction".to_string()),
                (Some(_), false) => Some("independent value disagrees".to_string()),
                _ => None,
            },
        });
        checks.push(Check {
            source: CheckSource::Rule,
            value: rule_outcome.expected.clone(),
            ok: rule_ok,
            diagnostic: if rule_ok {
                None
            } else {
                rule_outcome
                    .diagnostic
                    .clone()
                    .or_else(|| Some(format!("{rule_id} failed")))
            },
        });

        let agreeing = 1 + usize::from(algo_agrees) + usize::from(rule_ok);
        let (agreement, score) = self.grade(agreeing, field.confidence);
        // A failed checksum or identity on a monetary / identifier field
        // rejects the field even when the shadow extraction concurs.
        let admitted = agreement.is_admitted() && (rule_ok || !requires_rule);
        Consensus {
            checks,
            agreement,
            score,
            admitted,
        }
    }

    fn rejected_for_missing_rule(
        &self,
        _name: &str,
        ai_value: FieldData,
        algo_value: Option<FieldData>,
        field: &FieldValue,
    ) -> Consensus {
        let checks = vec![
            Check {
                source: CheckSource::Ai,
                value: Some(ai_value),
                ok: true,
                diagnostic: None,
            },
            Check {
                source: CheckSource::Algo,
                value: algo_value,
                ok: false,
                diagnostic: Some("not evaluated: rule check missing".to_string()),
            },
            Check {
                source: CheckSource::Rule,
                value: None,
                ok: false,
                diagnostic: Some("required rule check unavailable".to_string()),
            },
        ];
        Consensus {
            checks,
            agreement: Agreement::OneOfThree,
            score: 0.35 * field.confidence.min(1.0),
            admitted: false,
        }
    }

    fn consensus_without_rule(
        &self,
        ai_value: FieldData,
        algo_value: Option<FieldData>,
        field: &FieldValue,
    ) -> Consensus {
        let algo_agrees = algo_value
            .as_ref()
            .map(|v| self.values_agree(&ai_value, v))
            .unwrap_or(false);
        let checks = vec![
            Check {
                source: CheckSource::Ai,
                value: Some(ai_value),
                ok: true,
                diagnostic: None,
            },
            Check {
                source: CheckSource::Algo,
                value: algo_value,
                ok: algo_agrees,
                diagnostic: if algo_agrees {
                    None
                } else {
                    Some("no agreeing independent extraction".to_string())
                },
            },
            Check {
                source: CheckSource::Rule,
                value: None,
                ok: false,
                diagnostic: Some("no applicable rule".to_string()),
            },
        ];
        let agreeing = 1 + usize::from(algo_agrees);
        let (agreement, score) = self.grade(agreeing, field.confidence);
        let admitted = agreement.is_admitted();
        Consensus {
            checks,
            agreement,
            score,
            admitted,
        }
    }

    fn grade(&self, agreeing: usize, confidence: f64) -> (Agreement, f64) {
        let confidence = confidence.clamp(0.0, 1.0);
        match agreeing {
            3 => (Agreement::ThreeOfThree, 1.0),
            2 => (Agreement::TwoOfThree, 0.70 + 0.24 * confidence),
            1 => (Agreement::OneOfThree, 0.35 * confidence),
            _ => (Agreement::None, 0.0),
        }
    }

    /// Tolerance-aware value comparison. Strings compare exactly after
    /// normalization (extraction already normalized); money compares within
    /// the home or FX tolerance.
    #[must_use]
    pub fn values_agree(&self, a: &FieldData, b: &FieldData) -> bool {
        match (a, b) {
            (FieldData::Money(x), FieldData::Money(y)) => {
                if x.currency != y.currency {
                    return false;
                }
                let tolerance = if x.currency == self.tolerances.home_currency
                    && x.fx_date.is_none()
                {
                    self.tolerances.home
                } else {
                    self.tolerances.fx
                };
                (x.amount - y.amount).abs() <= tolerance
            }
            (FieldData::Decimal(x), FieldData::Decimal(y)) => x == y,
            (FieldData::Date(x), FieldData::Date(y)) => x == y,
            (FieldData::Text(x), FieldData::Text(y)) => x == y,
            _ => false,
        }
    }
}

/// Monetary and identifier fields must carry a rule check.
fn requires_rule_check(name: &str, value: &FieldData) -> bool {
    matches!(value, FieldData::Money(_))
        || name.ends_with("oib")
        || name == "fiscal_id"
        || name.ends_with("iban")
        || name.ends_with("vat_id")
}

#[cfg(test)]
mod tests {
    use super::*;
    use knj_core::{BlobId, DocClass, Money, Provenance, ShadowExtraction, SourceTier};
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;

    fn eur(amount: Decimal) -> Money {
        Money::new(amount, Currency::eur())
    }

    fn money_field(amount: Decimal) -> FieldValue {
        FieldValue::certain(
            FieldData::Money(eur(amount)),
            SourceTier::StructuredXml,
            "xml.invoice",
        )
    }

    fn text_field(s: &str) -> FieldValue {
        FieldValue::certain(
            FieldData::Text(s.to_string()),
            SourceTier::StructuredXml,
            "xml.invoice",
        )
    }

    fn invoice_doc(net: Decimal, vat: Decimal, gross: Decimal) -> ExtractedDoc {
        let mut fields = BTreeMap::new();
        fields.insert("net".to_string(), money_field(net));
        fields.insert("vat".to_string(), money_field(vat));
        fields.insert("gross".to_string(), money_field(gross));
        fields.insert("supplier_oib".to_string(), text_field("12345678903"));
        ExtractedDoc {
            blob_id: BlobId("00".into()),
            doc_class: DocClass::InvoiceIn,
            fields,
            source_tier: SourceTier::StructuredXml,
            language: "hr".into(),
            currency: Currency::eur(),
            shadows: vec![],
        }
    }

    fn verifier() -> Verifier {
        Verifier::with_default_rules(Tolerances::default())
    }

    #[test]
    fn happy_invoice_gets_three_of_three_on_money() {
        let doc = invoice_doc(dec!(1000.00), dec!(250.00), dec!(1250.00));
        let verified = verifier().verify(&doc);
        for field in ["net", "vat", "gross"] {
            let c = &verified.verification[field];
            assert_eq!(c.agreement, Agreement::ThreeOfThree, "{field}");
            assert!((c.score - 1.0).abs() < f64::EPSILON);
        }
        assert_eq!(
            verified.verification["supplier_oib"].agreement,
            Agreement::TwoOfThree
        );
    }

    #[test]
    fn broken_vat_identity_rejects_fields() {
        // 1000 + 250 != 1500: every member of the triplet disagrees with
        // its recomputation.
        let doc = invoice_doc(dec!(1000.00), dec!(250.00), dec!(1500.00));
        let verified = verifier().verify(&doc);
        let gross = &verified.verification["gross"];
        assert_eq!(gross.agreement, Agreement::OneOfThree);
        assert!(gross.score < 0.70);
        assert!(gross.is_blocking());
    }

    #[test]
    fn tolerance_admits_cent_rounding() {
        let doc = invoice_doc(dec!(1000.00), dec!(250.01), dec!(1250.00));
        let verified = verifier().verify(&doc);
        assert_eq!(
            verified.verification["vat"].agreement,
            Agreement::ThreeOfThree
        );
    }

    #[test]
    fn bad_oib_fails_rule_check() {
        let mut doc = invoice_doc(dec!(100), dec!(25), dec!(125));
        doc.fields
            .insert("supplier_oib".to_string(), text_field("12345678900"));
        let verified = verifier().verify(&doc);
        let c = &verified.verification["supplier_oib"];
        let rule = c
            .checks
            .iter()
            .find(|ch| ch.source == CheckSource::Rule)
            .unwrap();
        assert!(!rule.ok);
        // ai + nothing else: rejected.
        assert_eq!(c.agreement, Agreement::OneOfThree);
        assert!(c.is_blocking());
    }

    #[test]
    fn agreeing_shadow_lifts_identifier_to_three_of_three() {
        let mut doc = invoice_doc(dec!(100), dec!(25), dec!(125));
        let mut shadow_fields = BTreeMap::new();
        shadow_fields.insert(
            "supplier_oib".to_string(),
            FieldValue::certain(
                FieldData::Text("12345678903".into()),
                SourceTier::Regex,
                "regex.invoice",
            ),
        );
        doc.shadows.push(ShadowExtraction {
            tier: SourceTier::Regex,
            extractor_id: "regex.invoice".into(),
            fields: shadow_fields,
        });
        let verified = verifier().verify(&doc);
        assert_eq!(
            verified.verification["supplier_oib"].agreement,
            Agreement::ThreeOfThree
        );
    }

    #[test]
    fn disagreeing_shadow_on_money_is_two_of_three_with_warning() {
        let mut doc = invoice_doc(dec!(1000.00), dec!(250.00), dec!(1250.00));
        let mut shadow_fields = BTreeMap::new();
        shadow_fields.insert(
            "net".to_string(),
            FieldValue::certain(
                FieldData::Money(eur(dec!(100.00))),
                SourceTier::VisionOcr,
                "vision.ocr",
            ),
        );
        doc.shadows.push(ShadowExtraction {
            tier: SourceTier::VisionOcr,
            extractor_id: "vision.ocr".into(),
            fields: shadow_fields,
        });
        let verified = verifier().verify(&doc);
        let net = &verified.verification["net"];
        // ai agrees with rule recomputation; the shadow disagrees.
        assert_eq!(net.agreement, Agreement::TwoOfThree);
        assert!(net.agreement.has_warning());
        assert!((0.70..=0.94).contains(&net.score));
    }

    #[test]
    fn missing_rule_for_monetary_field_rejects() {
        // A lone monetary field outside the net/vat/gross triplet with a
        // negative amount exercises amount_nonnegative instead; remove all
        // applicable rules to simulate a missing-rule registry.
        let doc = invoice_doc(dec!(100), dec!(25), dec!(125));
        let bare = Verifier::new(vec![], Tolerances::default());
        let verified = bare.verify(&doc);
        assert_eq!(
            verified.verification["net"].agreement,
            Agreement::OneOfThree
        );
    }

    #[test]
    fn confidence_scales_two_of_three_score() {
        let mut doc = invoice_doc(dec!(100), dec!(25), dec!(125));
        let field = doc.fields.get_mut("supplier_oib").unwrap();
        *field = text_field("12345678903").with_confidence(0.5);
        let verified = verifier().verify(&doc);
        let c = &verified.verification["supplier_oib"];
        assert_eq!(c.agreement, Agreement::TwoOfThree);
        assert!((c.score - 0.82).abs() < 1e-9);
    }

    #[test]
    fn provenance_of_checks_is_never_ai_for_rule() {
        let doc = invoice_doc(dec!(100), dec!(25), dec!(125));
        let verified = verifier().verify(&doc);
        for c in verified.verification.values() {
            assert_eq!(c.checks.len(), 3);
            assert_eq!(c.checks[0].source, CheckSource::Ai);
            assert_eq!(c.checks[1].source, CheckSource::Algo);
            assert_eq!(c.checks[2].source, CheckSource::Rule);
        }
        let _ = Provenance {
            tier: SourceTier::StructuredXml,
            extractor_id: "xml.invoice".into(),
            span: None,
        };
    }
}
