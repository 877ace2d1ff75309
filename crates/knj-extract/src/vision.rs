// SPDX-License-Identifier: MIT OR Apache-2.0
//! Vision OCR tier: the last fallback for scans and photos.

use crate::text_tiers::RegexExtractor;
use crate::{ExtractInput, ExtractOutcome, Extractor};
use async_trait::async_trait;
use knj_core::{Currency, DocClass, ExtractedDoc, SourceTier};
use std::sync::Arc;
use tracing::debug;

/// Interface to the on-demand vision model.
///
/// The orchestrator implements this; the fabric stays decoupled from the
/// inference crate and the registry is still assembled explicitly at
/// startup.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    /// Run OCR over an image, returning the recognized plain text.
    async fn ocr(&self, bytes: &[u8], media_type: &str) -> Result<String, OcrError>;
}

/// Errors an OCR engine may report.
#[derive(Debug, thiserror::Error)]
pub enum OcrError {
    /// The vision backend could not be loaded; non-fatal for other tiers.
    #[error("vision backend unavailable: {0}")]
    Unavailable(String),
    /// The model ran but produced nothing usable.
    #[error("ocr produced no text")]
    Empty,
    /// Any other inference failure.
    #[error("ocr failed: {0}")]
    Failed(String),
}

/// Vision OCR tier: OCR the image, then structure the text through the
/// regex grammar.
pub struct VisionOcrExtractor {
    engine: Arc<dyn OcrEngine>,
    grammar: RegexExtractor,
    home_currency: Currency,
}

impl VisionOcrExtractor {
    /// Build over an OCR engine.
    #[must_use]
    pub fn new(engine: Arc<dyn OcrEngine>, home_currency: Currency) -> Self {
        Self {
            engine,
            grammar: RegexExtractor::new(home_currency.clone()),
            home_currency,
        }
    }
}

#[async_trait]
impl Extractor for VisionOcrExtractor {
    fn id(&self) -> &'static str {
        "vision.ocr"
    }

    fn tier(&self) -> SourceTier {
        SourceTier::VisionOcr
    }

    fn accepts(&self, input: &ExtractInput) -> bool {
        input.media_type.starts_with("image/") || input.media_type == "application/pdf"
    }

    async fn extract(&self, input: &ExtractInput) -> ExtractOutcome {
        let text = match self.engine.ocr(&input.bytes, &input.media_type).await {
            Ok(text) => text,
            Err(err) => return ExtractOutcome::no_match(format!("vision.ocr: {err}")),
        };
        let mut fields = self
            .grammar
            .extract_from_text(&text, "vision.ocr", SourceTier::VisionOcr);
        // OCR text is noisier than native text; cap the confidence.
        for field in fields.values_mut() {
            field.confidence = field.confidence.min(0.75);
        }
        if !fields.contains_key("gross") && !fields.contains_key("net") {
            return ExtractOutcome::no_match("vision.ocr: no monetary total recognized");
        }
        debug!(fields = fields.len(), "vision ocr extracted");
        ExtractOutcome::Extracted(ExtractedDoc {
            blob_id: input.blob_id.clone(),
            doc_class: input.doc_class_hint.unwrap_or(DocClass::InvoiceIn),
            fields,
            source_tier: SourceTier::VisionOcr,
            language: "hr".into(),
            currency: self.home_currency.clone(),
            shadows: vec![],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use knj_core::BlobId;

    struct FixedOcr(String);

    #[async_trait]
    impl OcrEngine for FixedOcr {
        async fn ocr(&self, _bytes: &[u8], _media_type: &str) -> Result<String, OcrError> {
            Ok(self.0.clone())
        }
    }

    struct DownOcr;

    #[async_trait]
    impl OcrEngine for DownOcr {
        async fn ocr(&self, _bytes: &[u8], _media_type: &str) -> Result<String, OcrError> {
            Err(OcrError::Unavailable("lazy load failed".into()))
        }
    }

    fn input() -> ExtractInput {
        ExtractInput {
            blob_id: BlobId("aa".into()),
            media_type: "image/png".into(),
            bytes: vec![0x89, 0x50],
            doc_class_hint: Some(DocClass::InvoiceIn),
        }
    }

    #[tokio::test]
    async fn ocr_text_is_structured_with_capped_confidence() {
        let ex = VisionOcrExtractor::new(
            Arc::new(FixedOcr("OIB: 12345678903 Ukupno: 1 000,00".into())),
            Currency::eur(),
        );
        let ExtractOutcome::Extracted(doc) = ex.extract(&input()).await else {
            panic!("expected extraction");
        };
        assert_eq!(doc.source_tier, SourceTier::VisionOcr);
        assert!(doc.fields["gross"].confidence <= 0.75);
    }

    #[tokio::test]
    async fn unavailable_engine_is_no_match_not_error() {
        let ex = VisionOcrExtractor::new(Arc::new(DownOcr), Currency::eur());
        let outcome = ex.extract(&input()).await;
        assert!(matches!(outcome, ExtractOutcome::NoMatch { .. }));
    }
}
