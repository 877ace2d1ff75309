// SPDX-License-Identifier: MIT OR Apache-2.0
//! Bridges the extractor fabric's OCR seam onto the orchestrator.

use async_trait::async_trait;
use knj_extract::{OcrEngine, OcrError};
use knj_infer::{InferError, InferKind, InferOutcome, InferRequest, Orchestrator};
use std::sync::Arc;
use std::time::Duration;

/// [`OcrEngine`] backed by the orchestrator's vision kind.
pub struct OrchestratorOcr {
    orchestrator: Arc<Orchestrator>,
    deadline: Duration,
}

impl OrchestratorOcr {
    /// Wrap the orchestrator for OCR calls with the given deadline.
    #[must_use]
    pub fn new(orchestrator: Arc<Orchestrator>, deadline: Duration) -> Self {
        Self {
            orchestrator,
            deadline,
        }
    }
}

#[async_trait]
impl OcrEngine for OrchestratorOcr {
    async fn ocr(&self, bytes: &[u8], media_type: &str) -> Result<String, OcrError> {
        let request = InferRequest {
            kind: InferKind::VisionOcr,
            user: "pipeline".into(),
            system_prompt: "Transcribe the document exactly. Output plain text only.".into(),
            prompt: "Read every printed value on this document.".into(),
            context: vec![],
            image: Some((bytes.to_vec(), media_type.to_string())),
            deadline: self.deadline,
        };
        match self.orchestrator.infer(request).await {
            Ok(InferOutcome::Completed { text, .. }) if text.trim().is_empty() => {
                Err(OcrError::Empty)
            }
            Ok(InferOutcome::Completed { text, .. }) => Ok(text),
            Ok(InferOutcome::Stream { .. }) => {
                Err(OcrError::Failed("vision call returned a stream".into()))
            }
            Err(InferError::VisionUnavailable(reason)) => Err(OcrError::Unavailable(reason)),
            Err(err) => Err(OcrError::Failed(err.to_string())),
        }
    }
}
