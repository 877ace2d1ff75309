// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = "Bounded-concurrency gateway to the local LLM and vision models."]
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! The orchestrator multiplexes up to `max_sessions` concurrent calls
//! onto one long-lived primary model and an on-demand vision model.
//! Admission is a bounded FIFO queue (`Overloaded` beyond it), then a
//! slot semaphore, then an advisory in-flight prompt-token budget.
//! Streams yield between tokens so concurrent chats interleave fairly;
//! there is no claim of thread-parallel model execution — the model host
//! batches under the hood, and ordering is guaranteed only within one
//! request.
//!
//! Cancellation is structural: a deadline or client disconnect fires the
//! call's [`CancelToken`], the stream ends with a `Cancelled` sentinel,
//! and the slot is released promptly.

mod backend;
mod budget;
mod cancel;
mod orchestrator;

pub use backend::{
    BackendError, BackendReply, BackendRequest, HttpModel, MockModel, ModelBackend, TokenEvent,
    Usage,
};
pub use budget::{estimate_tokens, BudgetReservation, PromptCache, TokenBudget};
pub use cancel::{CancelReason, CancelToken};
pub use orchestrator::{
    InferError, InferKind, InferOutcome, InferRequest, Orchestrator, OrchestratorConfig,
    VisionLoader,
};

use knj_config::ModelEndpoint;
use std::sync::Arc;
use std::time::Duration;

/// Loads the vision model over HTTP when first needed.
pub struct HttpVisionLoader {
    endpoint: ModelEndpoint,
    timeout: Duration,
}

impl HttpVisionLoader {
    /// Build a loader for the configured vision endpoint.
    #[must_use]
    pub fn new(endpoint: ModelEndpoint, timeout: Duration) -> Self {
        Self { endpoint, timeout }
    }
}

#[async_trait::async_trait]
impl VisionLoader for HttpVisionLoader {
    async fn load(&self) -> Result<Arc<dyn ModelBackend>, BackendError> {
        let backend = Arc::new(HttpModel::new(self.endpoint.clone(), self.timeout));
        // A probe at load time turns a dead endpoint into a clean
        // `VisionUnavailable` instead of a failing first request.
        backend.probe().await?;
        Ok(backend)
    }
}
