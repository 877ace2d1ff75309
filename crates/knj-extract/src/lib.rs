// SPDX-License-Identifier: MIT OR Apache-2.0
//! Tiered document extraction fabric.
//!
//! One extractor per `(document class, tier)`, registered in an explicit
//! table at startup. The fabric routes a blob to the highest-fidelity
//! applicable extractor first and falls back tier by tier; a tier
//! returning [`ExtractOutcome::NoMatch`] simply selects the next one. The
//! winning extraction additionally carries lower text tiers' outputs as
//! shadow extractions so the verifier has an independent value per field.
//!
//! Per-tier failures (including panics) are caught and surfaced as
//! `NoMatch` with a diagnostic; only total tier exhaustion is an error.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod bank;
mod normalize;
mod text_tiers;
mod vision;
mod xml;

pub use bank::BankCsvExtractor;
pub use normalize::{normalize_text, parse_date, ParsedDate};
pub use text_tiers::{
    default_templates, AnchorKind, LayoutTemplate, RegexExtractor, TemplateAnchor,
    TemplateExtractor,
};
pub use vision::{OcrEngine, OcrError, VisionOcrExtractor};
pub use xml::XmlInvoiceExtractor;

use async_trait::async_trait;
use futures::FutureExt;
use knj_core::{BlobId, Currency, DocClass, ExtractedDoc, ShadowExtraction, SourceTier};
use std::sync::Arc;
use tracing::{debug, warn};

/// Input handed to every extractor.
#[derive(Debug, Clone)]
pub struct ExtractInput {
    /// Content address of the blob.
    pub blob_id: BlobId,
    /// Declared media type.
    pub media_type: String,
    /// Raw bytes.
    pub bytes: Vec<u8>,
    /// Operator-declared document class, when the upload carried one.
    pub doc_class_hint: Option<DocClass>,
}

/// Result of one extractor attempt. `NoMatch` is not an error; it selects
/// the next tier.
#[derive(Debug, Clone)]
pub enum ExtractOutcome {
    /// The extractor produced a normalized document.
    Extracted(ExtractedDoc),
    /// The extractor does not apply; fall through.
    NoMatch {
        /// Why this tier declined, for diagnostics.
        diagnostic: String,
    },
}

impl ExtractOutcome {
    /// Shorthand for a `NoMatch` with a diagnostic.
    #[must_use]
    pub fn no_match(diagnostic: impl Into<String>) -> Self {
        Self::NoMatch {
            diagnostic: diagnostic.into(),
        }
    }
}

/// Errors from the fabric.
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    /// Every tier declined; the document cannot be extracted.
    #[error("unextractable: {diagnostics:?}")]
    Unextractable {
        /// Per-tier diagnostics in the order tried.
        diagnostics: Vec<String>,
    },
}

/// One registered extractor.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Stable extractor identifier, recorded in provenance.
    fn id(&self) -> &'static str;
    /// The tier this extractor belongs to.
    fn tier(&self) -> SourceTier;
    /// Cheap applicability test over media type and class hint.
    fn accepts(&self, input: &ExtractInput) -> bool;
    /// Attempt the extraction.
    async fn extract(&self, input: &ExtractInput) -> ExtractOutcome;
}

/// The extractor registry and routing logic.
pub struct ExtractorFabric {
    extractors: Vec<Arc<dyn Extractor>>,
}

impl ExtractorFabric {
    /// Build a fabric from an explicit registry.
    #[must_use]
    pub fn new(extractors: Vec<Arc<dyn Extractor>>) -> Self {
        Self { extractors }
    }

    /// The standard registry: XML invoice, bank CSV, template, regex, and
    /// the vision tier over the given OCR engine.
    #[must_use]
    pub fn standard(home_currency: Currency, ocr: Arc<dyn OcrEngine>) -> Self {
        Self::new(vec![
            Arc::new(XmlInvoiceExtractor::new(home_currency.clone())),
            Arc::new(BankCsvExtractor::new(home_currency.clone())),
            Arc::new(TemplateExtractor::new(
                default_templates(),
                home_currency.clone(),
            )),
            Arc::new(RegexExtractor::new(home_currency.clone())),
            Arc::new(VisionOcrExtractor::new(ocr, home_currency)),
        ])
    }

    /// Route a blob through the tier ladder.
    ///
    /// Returns the winning extraction (with shadows attached) or
    /// [`ExtractError::Unextractable`] when every tier declined.
    pub async fn extract(&self, input: &ExtractInput) -> Result<ExtractedDoc, ExtractError> {
        let mut diagnostics = Vec::new();
        let mut winner: Option<ExtractedDoc> = None;
        let mut winner_tier: Option<SourceTier> = None;

        for &tier in SourceTier::FALLBACK_ORDER {
            for extractor in self.extractors.iter().filter(|e| e.tier() == tier) {
                if !extractor.accepts(input) {
                    continue;
                }
                match self.try_extract(extractor.as_ref(), input).await {
                    ExtractOutcome::Extracted(doc) => {
                        debug!(extractor = extractor.id(), tier = ?tier, "tier won");
                        winner = Some(doc);
                        winner_tier = Some(tier);
                        break;
                    }
                    ExtractOutcome::NoMatch { diagnostic } => {
                        debug!(extractor = extractor.id(), %diagnostic, "tier declined");
                        diagnostics.push(diagnostic);
                    }
                }
            }
            if winner.is_some() {
                break;
            }
        }

        let Some(mut doc) = winner else {
            return Err(ExtractError::Unextractable { diagnostics });
        };

        // Collect shadow extractions from the cheaper text tiers below the
        // winner. Vision is never run just for a shadow.
        let winner_tier = winner_tier.expect("tier recorded with winner");
        for &tier in SourceTier::FALLBACK_ORDER {
            if tier >= winner_tier || tier == SourceTier::VisionOcr {
                continue;
            }
            for extractor in self.extractors.iter().filter(|e| e.tier() == tier) {
                if !extractor.accepts(input) {
                    continue;
                }
                if let ExtractOutcome::Extracted(shadow) =
                    self.try_extract(extractor.as_ref(), input).await
                {
                    doc.shadows.push(ShadowExtraction {
                        tier,
                        extractor_id: extractor.id().to_string(),
                        fields: shadow.fields,
                    });
                }
            }
        }

        Ok(doc)
    }

    /// Run one extractor, converting panics into `NoMatch`.
    async fn try_extract(&self, extractor: &dyn Extractor, input: &ExtractInput) -> ExtractOutcome {
        match std::panic::AssertUnwindSafe(extractor.extract(input))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(extractor = extractor.id(), "extractor panicked");
                ExtractOutcome::no_match(format!("{}: panicked", extractor.id()))
            }
        }
    }
}
