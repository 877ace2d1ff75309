// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = "Domain model for Knjižba: money, documents, consensus, bookings."]
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! The types in this crate are the closed record shapes that cross every
//! component boundary: extracted documents, verified fields, double-entry
//! bookings, and the citations that justify them. Monetary values are
//! [`rust_decimal::Decimal`] throughout; binary floats never appear in any
//! type that leaves this crate.

mod booking;
mod canonical;
mod citation;
mod consensus;
mod doc;
mod money;

pub use booking::{
    Booking, BookingStatus, Entry, Proposer, Side, VatBreakdown, VatClass, VatLine,
};
pub use canonical::{canonical_json, sha256_hex, Fingerprint};
pub use citation::CitationRef;
pub use consensus::{Agreement, Check, CheckSource, Consensus, VerifiedDoc};
pub use doc::{
    BlobId, DocClass, ExtractedDoc, FieldData, FieldValue, Provenance, ShadowExtraction,
    SourceTier,
};
pub use money::{parse_localized_decimal, Currency, Money, MoneyError};

/// Contract version stamped into exports and audit payloads.
pub const CONTRACT_VERSION: &str = "knjizba/1";
