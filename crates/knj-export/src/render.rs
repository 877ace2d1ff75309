// SPDX-License-Identifier: MIT OR Apache-2.0
//! Deterministic artifact rendering.
//!
//! Same booking in, byte-identical artifact out: stable element and
//! column order, fixed two-decimal amounts, ISO dates, sorted citations.

use knj_core::{Booking, Side, CONTRACT_VERSION};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

/// Rendering failures are always permanent: the booking violates the
/// target schema and must be blocked, not retried.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    /// The booking cannot be expressed in the target format.
    #[error("booking violates target schema: {0}")]
    Schema(String),
    /// Writer failure (should not happen with in-memory sinks).
    #[error("render io: {0}")]
    Io(String),
}

/// Render the XML target artifact.
pub fn render_xml(booking: &Booking) -> Result<Vec<u8>, RenderError> {
    if booking.entries.is_empty() {
        return Err(RenderError::Schema("no entries".into()));
    }
    if !booking.is_balanced() {
        return Err(RenderError::Schema("unbalanced entries".into()));
    }

    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    let w = &mut writer;
    write_event(w, Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let mut root = BytesStart::new("Posting");
    root.push_attribute(("version", CONTRACT_VERSION));
    write_event(w, Event::Start(root))?;

    element(w, "Client", &booking.client_id)?;
    element(w, "DocumentClass", &booking.class.to_string())?;
    element(w, "PostingDate", &booking.posting_date.to_string())?;
    element(w, "Narrative", &booking.narrative)?;

    write_event(w, Event::Start(BytesStart::new("Entries")))?;
    for entry in &booking.entries {
        let mut line = BytesStart::new("Entry");
        line.push_attribute(("account", entry.account.as_str()));
        line.push_attribute((
            "side",
            match entry.side {
                Side::Debit => "debit",
                Side::Credit => "credit",
            },
        ));
        line.push_attribute(("currency", entry.amount.currency.as_str()));
        write_event(w, Event::Start(line))?;
        write_event(
            w,
            Event::Text(BytesText::new(&entry.amount.format_2dp())),
        )?;
        write_event(w, Event::End(BytesEnd::new("Entry")))?;
    }
    write_event(w, Event::End(BytesEnd::new("Entries")))?;

    write_event(w, Event::Start(BytesStart::new("VatBreakdown")))?;
    for line in &booking.vat_breakdown.lines {
        let mut el = BytesStart::new("VatLine");
        el.push_attribute(("class", line.class.to_string().as_str()));
        el.push_attribute(("base", line.base.format_2dp().as_str()));
        el.push_attribute(("vat", line.vat.format_2dp().as_str()));
        write_event(w, Event::Empty(el))?;
    }
    write_event(w, Event::End(BytesEnd::new("VatBreakdown")))?;

    write_event(w, Event::Start(BytesStart::new("Citations")))?;
    for citation in &booking.citations {
        // BTreeSet iteration keeps citation order stable.
        element(w, "Citation", &citation.to_string())?;
    }
    write_event(w, Event::End(BytesEnd::new("Citations")))?;

    write_event(w, Event::End(BytesEnd::new("Posting")))?;
    Ok(writer.into_inner())
}

/// Render the CSV target artifact (semicolon-delimited, one entry line
/// per row).
pub fn render_csv(booking: &Booking) -> Result<Vec<u8>, RenderError> {
    if booking.entries.is_empty() {
        return Err(RenderError::Schema("no entries".into()));
    }
    if !booking.is_balanced() {
        return Err(RenderError::Schema("unbalanced entries".into()));
    }

    let mut writer = csv::WriterBuilder::new()
        .delimiter(b';')
        .from_writer(Vec::new());
    writer
        .write_record([
            "client",
            "posting_date",
            "doc_class",
            "account",
            "side",
            "amount",
            "currency",
            "narrative",
        ])
        .map_err(|e| RenderError::Io(e.to_string()))?;
    for entry in &booking.entries {
        writer
            .write_record([
                booking.client_id.as_str(),
                &booking.posting_date.to_string(),
                &booking.class.to_string(),
                entry.account.as_str(),
                match entry.side {
                    Side::Debit => "debit",
                    Side::Credit => "credit",
                },
                &entry.amount.format_2dp(),
                entry.amount.currency.as_str(),
                booking.narrative.as_str(),
            ])
            .map_err(|e| RenderError::Io(e.to_string()))?;
    }
    writer
        .into_inner()
        .map_err(|e| RenderError::Io(e.to_string()))
}

/// Render the JSON body for HTTP delivery: the canonical booking form,
/// which is key-sorted and therefore byte-stable.
pub fn render_json(booking: &Booking) -> Result<Vec<u8>, RenderError> {
    if !booking.is_balanced() {
        return Err(RenderError::Schema("unbalanced entries".into()));
    }
    let value = booking
        .canonical_value()
        .map_err(|e| RenderError::Io(e.to_string()))?;
    serde_json::to_vec(&value).map_err(|e| RenderError::Io(e.to_string()))
}

fn element<W: std::io::Write>(
    writer: &mut Writer<W>,
    name: &str,
    text: &str,
) -> Result<(), RenderError> {
    write_event(writer, Event::Start(BytesStart::new(name)))?;
    write_event(writer, Event::Text(BytesText::new(text)))?;
    write_event(writer, Event::End(BytesEnd::new(name)))
}

fn write_event<W: std::io::Write>(
    writer: &mut Writer<W>,
    event: Event<'_>,
) -> Result<(), RenderError> {
    writer
        .write_event(event)
        .map_err(|e| RenderError::Io(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};
    use knj_core::{
        BookingStatus, Currency, DocClass, Entry, Money, Proposer, VatBreakdown,
    };
    use rust_decimal_macros::dec;
    use std::collections::BTreeSet;
    use uuid::Uuid;

    fn booking() -> Booking {
        let eur = |d| Money::new(d, Currency::eur());
        Booking {
            id: Uuid::new_v4(),
            client_id: "K1".into(),
            source: None,
            class: DocClass::InvoiceIn,
            entries: vec![
                Entry::debit("4000", eur(dec!(1000.00))),
                Entry::debit("1400", eur(dec!(250.00))),
                Entry::credit("2200", eur(dec!(1250.00))),
            ],
            vat_breakdown: VatBreakdown::default(),
            posting_date: NaiveDate::from_ymd_opt(2026, 3, 15).unwrap(),
            narrative: "uredski materijal".into(),
            citations: BTreeSet::new(),
            status: BookingStatus::Approved,
            proposed_by: Proposer::Pipeline,
            approved_by: Some("mira".into()),
            corrected_from: None,
            created_at: Utc::now(),
            finalized_at: None,
        }
    }

    #[test]
    fn xml_is_byte_deterministic() {
        let b = booking();
        assert_eq!(render_xml(&b).unwrap(), render_xml(&b).unwrap());
    }

    #[test]
    fn xml_ignores_volatile_fields() {
        let a = booking();
        let mut b = a.clone();
        b.id = Uuid::new_v4();
        b.created_at = Utc::now();
        assert_eq!(render_xml(&a).unwrap(), render_xml(&b).unwrap());
    }

    #[test]
    fn xml_carries_fixed_decimals() {
        let xml = String::from_utf8(render_xml(&booking()).unwrap()).unwrap();
        assert!(xml.contains("1250.00"));
        assert!(xml.contains("account=\"4000\""));
        assert!(xml.contains("<PostingDate>2026-03-15</PostingDate>"));
    }

    #[test]
    fn csv_one_row_per_entry() {
        let csv = String::from_utf8(render_csv(&booking()).unwrap()).unwrap();
        // Header plus three entry rows.
        assert_eq!(csv.lines().count(), 4);
        assert!(csv.contains("4000;debit;1000.00;EUR"));
    }

    #[test]
    fn unbalanced_booking_is_schema_error() {
        let mut b = booking();
        b.entries.pop();
        assert!(matches!(render_xml(&b), Err(RenderError::Schema(_))));
        assert!(matches!(render_csv(&b), Err(RenderError::Schema(_))));
    }

    #[test]
    fn json_is_canonical() {
        let b = booking();
        assert_eq!(render_json(&b).unwrap(), render_json(&b).unwrap());
    }
}
