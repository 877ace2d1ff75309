// SPDX-License-Identifier: MIT OR Apache-2.0
//! Tabular bank-statement extractor (semicolon-delimited CSV).

use crate::normalize::{normalize_text, parse_date};
use crate::{ExtractInput, ExtractOutcome, Extractor};
use async_trait::async_trait;
use knj_core::{
    parse_localized_decimal, Currency, DocClass, ExtractedDoc, FieldData, FieldValue, Money,
    SourceTier,
};
use std::collections::BTreeMap;
use std::str::FromStr;
use tracing::debug;

/// Extracts semicolon-delimited bank statement exports.
///
/// Expected header: `date;iban;counterparty;description;amount;currency;direction`.
/// Each row becomes a `txn[i].*` field group; the statement IBAN and the
/// per-currency turnover totals are attached as document-level fields.
pub struct BankCsvExtractor {
    home_currency: Currency,
}

impl BankCsvExtractor {
    /// Build with the deployment's home currency.
    #[must_use]
    pub fn new(home_currency: Currency) -> Self {
        Self { home_currency }
    }
}

const EXPECTED_HEADER: [&str; 7] = [
    "date",
    "iban",
    "counterparty",
    "description",
    "amount",
    "currency",
    "direction",
];

#[async_trait]
impl Extractor for BankCsvExtractor {
    fn id(&self) -> &'static str {
        "csv.bank_stmt"
    }

    fn tier(&self) -> SourceTier {
        SourceTier::StructuredXml
    }

    fn accepts(&self, input: &ExtractInput) -> bool {
        let class_ok = input
            .doc_class_hint
            .map(|c| c == DocClass::BankStmt)
            .unwrap_or(true);
        let media_ok = matches!(input.media_type.as_str(), "text/csv" | "application/csv");
        class_ok && media_ok
    }

    async fn extract(&self, input: &ExtractInput) -> ExtractOutcome {
        let Ok(text) = std::str::from_utf8(&input.bytes) else {
            return ExtractOutcome::no_match("csv.bank_stmt: not utf-8");
        };
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b';')
            .trim(csv::Trim::All)
            .from_reader(text.as_bytes());

        match reader.headers() {
            Ok(headers) => {
                let got: Vec<String> =
                    headers.iter().map(|h| h.to_lowercase()).collect();
                if got != EXPECTED_HEADER {
                    return ExtractOutcome::no_match(format!(
                        "csv.bank_stmt: unexpected header {got:?}"
                    ));
                }
            }
            Err(e) => return ExtractOutcome::no_match(format!("csv.bank_stmt: {e}")),
        }

        let mut fields: BTreeMap<String, FieldValue> = BTreeMap::new();
        let certain =
            |value: FieldData| FieldValue::certain(value, SourceTier::StructuredXml, "csv.bank_stmt");
        let mut statement_iban: Option<String> = None;
        let mut statement_currency: Option<Currency> = None;
        let mut row_count = 0usize;

        for (i, record) in reader.records().enumerate() {
            let record = match record {
                Ok(r) => r,
                Err(e) => return ExtractOutcome::no_match(format!("csv.bank_stmt: row {i}: {e}")),
            };
            if record.len() != EXPECTED_HEADER.len() {
                return ExtractOutcome::no_match(format!(
                    "csv.bank_stmt: row {i} has {} columns",
                    record.len()
                ));
            }
            let Some(date) = parse_date(&record[0], true) else {
                return ExtractOutcome::no_match(format!("csv.bank_stmt: row {i}: bad date"));
            };
            let Ok(amount) = parse_localized_decimal(&record[4]) else {
                return ExtractOutcome::no_match(format!("csv.bank_stmt: row {i}: bad amount"));
            };
            let Ok(currency) = Currency::from_str(&record[5]) else {
                return ExtractOutcome::no_match(format!("csv.bank_stmt: row {i}: bad currency"));
            };
            let direction = record[6].to_lowercase();
            if direction != "debit" && direction != "credit" {
                return ExtractOutcome::no_match(format!(
                    "csv.bank_stmt: row {i}: direction '{direction}'"
                ));
            }

            let mut money = Money::new(amount, currency.clone());
            if currency != self.home_currency {
                money = money.with_fx_date(date.date);
            }

            statement_iban.get_or_insert_with(|| record[1].replace(' ', ""));
            statement_currency.get_or_insert_with(|| currency.clone());

            fields.insert(
                format!("txn[{i}].date"),
                certain(FieldData::Date(date.date)),
            );
            fields.insert(format!("txn[{i}].amount"), certain(FieldData::Money(money)));
            fields.insert(
                format!("txn[{i}].counterparty"),
                certain(FieldData::Text(normalize_text(&record[2]))),
            );
            fields.insert(
                format!("txn[{i}].description"),
                certain(FieldData::Text(normalize_text(&record[3]))),
            );
            fields.insert(
                format!("txn[{i}].direction"),
                certain(FieldData::Text(direction)),
            );
            row_count += 1;
        }

        if row_count == 0 {
            return ExtractOutcome::no_match("csv.bank_stmt: no rows");
        }
        if let Some(iban) = statement_iban {
            fields.insert("account_iban".into(), certain(FieldData::Text(iban)));
        }

        debug!(rows = row_count, "bank statement extracted");
        ExtractOutcome::Extracted(ExtractedDoc {
            blob_id: input.blob_id.clone(),
            doc_class: DocClass::BankStmt,
            fields,
            source_tier: SourceTier::StructuredXml,
            language: "hr".into(),
            currency: statement_currency.unwrap_or_else(|| self.home_currency.clone()),
            shadows: vec![],
        })
    }
}
