// SPDX-License-Identifier: MIT OR Apache-2.0
//! Structured XML invoice extractor (e-invoice schema, highest tier).

use crate::normalize::{normalize_text, parse_date};
use crate::{ExtractInput, ExtractOutcome, Extractor};
use async_trait::async_trait;
use knj_core::{
    Currency, DocClass, ExtractedDoc, FieldData, FieldValue, Money, SourceTier,
};
use quick_xml::events::Event;
use quick_xml::Reader;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::str::FromStr;
use tracing::debug;

/// Extracts the in-house e-invoice XML schema.
///
/// The schema is a flat invoice document: supplier identity, dates,
/// per-rate VAT lines, and totals. Anything that does not parse as this
/// schema is a `NoMatch`, which sends the blob down the tier ladder.
pub struct XmlInvoiceExtractor {
    home_currency: Currency,
}

impl XmlInvoiceExtractor {
    /// Build with the deployment's home currency, used to decide which
    /// amounts need an FX date.
    #[must_use]
    pub fn new(home_currency: Currency) -> Self {
        Self { home_currency }
    }
}

#[async_trait]
impl Extractor for XmlInvoiceExtractor {
    fn id(&self) -> &'static str {
        "xml.invoice"
    }

    fn tier(&self) -> SourceTier {
        SourceTier::StructuredXml
    }

    fn accepts(&self, input: &ExtractInput) -> bool {
        let class_ok = input
            .doc_class_hint
            .map(|c| c.is_invoice_like())
            .unwrap_or(true);
        let media_ok = matches!(input.media_type.as_str(), "application/xml" | "text/xml");
        class_ok && media_ok
    }

    async fn extract(&self, input: &ExtractInput) -> ExtractOutcome {
        let Ok(text) = std::str::from_utf8(&input.bytes) else {
            return ExtractOutcome::no_match("xml.invoice: not utf-8");
        };
        match parse_invoice_xml(text) {
            Ok(parsed) => self.build_doc(input, parsed),
            Err(reason) => ExtractOutcome::no_match(format!("xml.invoice: {reason}")),
        }
    }
}

impl XmlInvoiceExtractor {
    fn build_doc(&self, input: &ExtractInput, parsed: ParsedInvoice) -> ExtractOutcome {
        let Some(currency) = parsed.currency.clone() else {
            return ExtractOutcome::no_match("xml.invoice: missing currency");
        };
        let issue_date = parsed.issue_date;
        let foreign = currency != self.home_currency;
        let money = |amount: Decimal| {
            let mut m = Money::new(amount, currency.clone());
            if foreign && let Some(d) = issue_date {
                m = m.with_fx_date(d);
            }
            m
        };

        let mut fields: BTreeMap<String, FieldValue> = BTreeMap::new();
        let certain = |value: FieldData| FieldValue::certain(value, SourceTier::StructuredXml, "xml.invoice");

        for (name, text) in [
            ("supplier_name", parsed.supplier_name),
            ("supplier_oib", parsed.supplier_oib),
            ("supplier_iban", parsed.supplier_iban),
            ("supplier_vat_id", parsed.supplier_vat_id),
            ("invoice_number", parsed.number),
        ] {
            if let Some(text) = text {
                fields.insert(name.to_string(), certain(FieldData::Text(text)));
            }
        }
        if let Some(d) = parsed.issue_date {
            fields.insert("issue_date".into(), certain(FieldData::Date(d)));
        }
        if let Some(d) = parsed.due_date {
            fields.insert("due_date".into(), certain(FieldData::Date(d)));
        }
        for (name, amount) in [
            ("net", parsed.net),
            ("vat", parsed.vat),
            ("gross", parsed.gross),
        ] {
            if let Some(amount) = amount {
                fields.insert(name.to_string(), certain(FieldData::Money(money(amount))));
            }
        }
        for (i, line) in parsed.vat_lines.iter().enumerate() {
            fields.insert(
                format!("vat_lines[{i}].rate"),
                certain(FieldData::Decimal(line.rate)),
            );
            fields.insert(
                format!("vat_lines[{i}].base"),
                certain(FieldData::Money(money(line.base))),
            );
            fields.insert(
                format!("vat_lines[{i}].vat"),
                certain(FieldData::Money(money(line.vat))),
            );
        }

        if !fields.contains_key("net") || !fields.contains_key("gross") {
            return ExtractOutcome::no_match("xml.invoice: totals missing");
        }

        debug!(fields = fields.len(), "xml invoice extracted");
        ExtractOutcome::Extracted(ExtractedDoc {
            blob_id: input.blob_id.clone(),
            doc_class: input.doc_class_hint.unwrap_or(DocClass::InvoiceIn),
            fields,
            source_tier: SourceTier::StructuredXml,
            language: "hr".into(),
            currency,
            shadows: vec![],
        })
    }
}

#[derive(Debug, Default)]
struct ParsedVatLine {
    rate: Decimal,
    base: Decimal,
    vat: Decimal,
}

#[derive(Debug, Default)]
struct ParsedInvoice {
    supplier_name: Option<String>,
    supplier_oib: Option<String>,
    supplier_iban: Option<String>,
    supplier_vat_id: Option<String>,
    number: Option<String>,
    issue_date: Option<chrono::NaiveDate>,
    due_date: Option<chrono::NaiveDate>,
    currency: Option<Currency>,
    net: Option<Decimal>,
    vat: Option<Decimal>,
    gross: Option<Decimal>,
    vat_lines: Vec<ParsedVatLine>,
}

fn parse_invoice_xml(text: &str) -> Result<ParsedInvoice, String> {
    let mut reader = Reader::from_str(text);
    let mut path: Vec<String> = Vec::new();
    let mut out = ParsedInvoice::default();
    let mut pending_rate: Option<Decimal> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if path.is_empty() && name != "Invoice" {
                    return Err(format!("unexpected root element <{name}>"));
                }
                if name == "VatLine" {
                    pending_rate = None;
                    for attr in e.attributes().flatten() {
                        if attr.key.as_ref() == b"rate"
                            && let Ok(v) = attr.unescape_value()
                            && let Ok(rate) = Decimal::from_str(v.trim())
                        {
                            pending_rate = Some(rate);
                        }
                    }
                    out.vat_lines.push(ParsedVatLine {
                        rate: pending_rate.unwrap_or(Decimal::ZERO),
                        ..Default::default()
                    });
                }
                path.push(name);
            }
            Ok(Event::Text(t)) => {
                let raw = t.unescape().map_err(|e| e.to_string())?;
                let text = normalize_text(&raw);
                if text.is_empty() {
                    continue;
                }
                apply_text(&mut out, &path, &text)?;
            }
            Ok(Event::End(_)) => {
                path.pop();
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(e.to_string()),
            Ok(_) => {}
        }
    }

    if out.gross.is_none() && out.net.is_none() {
        return Err("no totals found".into());
    }
    Ok(out)
}

fn apply_text(out: &mut ParsedInvoice, path: &[String], text: &str) -> Result<(), String> {
    let joined = path.join("/");
    let decimal = || Decimal::from_str(text).map_err(|_| format!("bad decimal at {joined}"));
    match joined.as_str() {
        "Invoice/Supplier/Name" => out.supplier_name = Some(text.to_string()),
        "Invoice/Supplier/Oib" => out.supplier_oib = Some(text.replace(' ', "")),
        "Invoice/Supplier/Iban" => out.supplier_iban = Some(text.replace(' ', "")),
        "Invoice/Supplier/VatId" => out.supplier_vat_id = Some(text.replace(' ', "")),
        "Invoice/Number" => out.number = Some(text.to_string()),
        "Invoice/IssueDate" => {
            out.issue_date = parse_date(text, true).map(|p| p.date);
        }
        "Invoice/DueDate" => {
            out.due_date = parse_date(text, true).map(|p| p.date);
        }
        "Invoice/Currency" => {
            out.currency = Currency::from_str(text).ok();
        }
        "Invoice/Totals/Net" => out.net = Some(decimal()?),
        "Invoice/Totals/Vat" => out.vat = Some(decimal()?),
        "Invoice/Totals/Gross" => out.gross = Some(decimal()?),
        "Invoice/Lines/VatLine/Base" => {
            if let Some(line) = out.vat_lines.last_mut() {
                line.base = decimal()?;
            }
        }
        "Invoice/Lines/VatLine/Amount" => {
            if let Some(line) = out.vat_lines.last_mut() {
                line.vat = decimal()?;
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use knj_core::BlobId;
    use rust_decimal_macros::dec;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Invoice>
  <Supplier>
    <Name>Tvrtka d.o.o.</Name>
    <Oib>12345678903</Oib>
    <Iban>HR1723600001101234565</Iban>
  </Supplier>
  <Number>2026-0042</Number>
  <IssueDate>2026-03-15</IssueDate>
  <DueDate>2026-04-14</DueDate>
  <Currency>EUR</Currency>
  <Lines>
    <VatLine rate="25.00"><Base>1000.00</Base><Amount>250.00</Amount></VatLine>
  </Lines>
  <Totals><Net>1000.00</Net><Vat>250.00</Vat><Gross>1250.00</Gross></Totals>
</Invoice>"#;

    fn input(bytes: &[u8], media: &str) -> ExtractInput {
        ExtractInput {
            blob_id: BlobId("ab".into()),
            media_type: media.to_string(),
            bytes: bytes.to_vec(),
            doc_class_hint: Some(DocClass::InvoiceIn),
        }
    }

    #[tokio::test]
    async fn extracts_sample_invoice() {
        let ex = XmlInvoiceExtractor::new(Currency::eur());
        let outcome = ex.extract(&input(SAMPLE.as_bytes(), "application/xml")).await;
        let ExtractOutcome::Extracted(doc) = outcome else {
            panic!("expected extraction");
        };
        assert_eq!(doc.source_tier, SourceTier::StructuredXml);
        assert_eq!(doc.money("net").unwrap().amount, dec!(1000.00));
        assert_eq!(doc.money("vat").unwrap().amount, dec!(250.00));
        assert_eq!(doc.money("gross").unwrap().amount, dec!(1250.00));
        assert_eq!(doc.text("supplier_oib"), Some("12345678903"));
        assert_eq!(doc.money("net").unwrap().fx_date, None);
        assert!(doc.fields.contains_key("vat_lines[0].base"));
    }

    #[tokio::test]
    async fn foreign_currency_amounts_carry_fx_date() {
        let xml = SAMPLE.replace("EUR", "USD");
        let ex = XmlInvoiceExtractor::new(Currency::eur());
        let ExtractOutcome::Extracted(doc) =
            ex.extract(&input(xml.as_bytes(), "application/xml")).await
        else {
            panic!("expected extraction");
        };
        assert!(doc.money("net").unwrap().fx_date.is_some());
    }

    #[tokio::test]
    async fn non_invoice_xml_is_no_match() {
        let ex = XmlInvoiceExtractor::new(Currency::eur());
        let outcome = ex
            .extract(&input(b"<Ledger><Row/></Ledger>", "application/xml"))
            .await;
        assert!(matches!(outcome, ExtractOutcome::NoMatch { .. }));
    }

    #[tokio::test]
    async fn binary_payload_is_no_match() {
        let ex = XmlInvoiceExtractor::new(Currency::eur());
        let outcome = ex.extract(&input(&[0xff, 0xfe, 0x00], "application/xml")).await;
        assert!(matches!(outcome, ExtractOutcome::NoMatch { .. }));
    }
}
