// SPDX-License-Identifier: MIT OR Apache-2.0
//! The inference orchestrator: admission, scheduling, vision lifecycle,
//! and model swaps.

use crate::backend::{
    BackendError, BackendReply, BackendRequest, ModelBackend, TokenEvent, Usage,
};
use crate::budget::{estimate_tokens, PromptCache, TokenBudget};
use crate::cancel::{CancelReason, CancelToken};
use async_trait::async_trait;
use rand::Rng;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, OwnedSemaphorePermit, RwLock, Semaphore};
use tracing::{info, warn};

/// What kind of call this is; budgets and routing differ per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InferKind {
    /// Interactive operator chat (streamed).
    Chat,
    /// Field extraction assistance.
    Extract,
    /// Account / VAT classification.
    Classify,
    /// OCR over a scanned document (vision model).
    VisionOcr,
}

impl InferKind {
    /// Maximum prompt tokens admitted for this kind.
    #[must_use]
    pub fn prompt_budget(&self) -> u64 {
        match self {
            InferKind::Chat => 4_000,
            InferKind::Extract => 6_000,
            InferKind::Classify => 3_000,
            InferKind::VisionOcr => 2_000,
        }
    }
}

/// A single inference request.
#[derive(Debug, Clone)]
pub struct InferRequest {
    /// Call kind.
    pub kind: InferKind,
    /// Requesting user (quota accounting upstream; logged here).
    pub user: String,
    /// System prompt — the cacheable prefix.
    pub system_prompt: String,
    /// User / pipeline prompt.
    pub prompt: String,
    /// Retrieval context lines.
    pub context: Vec<String>,
    /// Image payload for vision calls.
    pub image: Option<(Vec<u8>, String)>,
    /// Wall-clock deadline for the whole call.
    pub deadline: Duration,
}

/// Result of [`Orchestrator::infer`].
#[derive(Debug)]
pub enum InferOutcome {
    /// The call ran to completion.
    Completed {
        /// Generated text.
        text: String,
        /// Usage accounting.
        usage: Usage,
    },
    /// A token stream (chat). Ends with `Done` or `Cancelled`.
    Stream {
        /// Token receiver.
        tokens: mpsc::Receiver<TokenEvent>,
        /// Cancel handle for the caller (client disconnect).
        cancel: CancelToken,
    },
}

/// Errors surfaced to callers of the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum InferError {
    /// The queue is full; retry after the hint.
    #[error("inference overloaded, retry after {retry_after_secs}s")]
    Overloaded {
        /// Suggested client backoff.
        retry_after_secs: u64,
    },
    /// The prompt exceeds the per-kind budget.
    #[error("prompt exceeds budget for this call kind ({tokens} > {limit})")]
    PromptTooLarge {
        /// Estimated prompt tokens.
        tokens: u64,
        /// Budget for the kind.
        limit: u64,
    },
    /// Deadline elapsed or the caller cancelled.
    #[error("cancelled: {0:?}")]
    Cancelled(CancelReason),
    /// The vision backend could not be loaded; other kinds unaffected.
    #[error("vision unavailable: {0}")]
    VisionUnavailable(String),
    /// The call failed after its one retry.
    #[error("inference failed ({kind:?}): {reason}")]
    Failed {
        /// Call kind that failed.
        kind: InferKind,
        /// Failure detail.
        reason: String,
    },
}

/// Lazily loads the vision backend on first use.
#[async_trait]
pub trait VisionLoader: Send + Sync {
    /// Load (or reconnect to) the vision model.
    async fn load(&self) -> Result<Arc<dyn ModelBackend>, BackendError>;
}

struct VisionState {
    backend: Option<Arc<dyn ModelBackend>>,
    last_used: Instant,
}

/// Orchestrator tuning, fixed at construction.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Concurrent inference slots.
    pub max_sessions: usize,
    /// Queue length before `Overloaded`.
    pub queue_len: usize,
    /// Total in-flight prompt-token cap.
    pub token_budget: u64,
    /// Prompt-prefix cache capacity.
    pub prompt_cache_cap: usize,
    /// Vision idle-unload window.
    pub vision_idle: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_sessions: 4,
            queue_len: 32,
            token_budget: 24_000,
            prompt_cache_cap: 16,
            vision_idle: Duration::from_secs(600),
        }
    }
}

/// Multiplexes many callers onto one primary model and an on-demand
/// vision model, inside a bounded concurrency and memory envelope.
pub struct Orchestrator {
    primary: Arc<RwLock<Arc<dyn ModelBackend>>>,
    vision: tokio::sync::Mutex<VisionState>,
    vision_loader: Arc<dyn VisionLoader>,
    slots: Arc<Semaphore>,
    waiting: AtomicUsize,
    budget: Arc<TokenBudget>,
    cache: PromptCache,
    config: OrchestratorConfig,
    swap_count: AtomicU64,
}

impl Orchestrator {
    /// Build an orchestrator over the primary backend.
    #[must_use]
    pub fn new(
        primary: Arc<dyn ModelBackend>,
        vision_loader: Arc<dyn VisionLoader>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            primary: Arc::new(RwLock::new(primary)),
            vision: tokio::sync::Mutex::new(VisionState {
                backend: None,
                last_used: Instant::now(),
            }),
            vision_loader,
            slots: Arc::new(Semaphore::new(config.max_sessions)),
            waiting: AtomicUsize::new(0),
            budget: Arc::new(TokenBudget::new(config.token_budget)),
            cache: PromptCache::new(config.prompt_cache_cap),
            config,
            swap_count: AtomicU64::new(0),
        }
    }

    /// Number of callers currently queued for a slot.
    #[must_use]
    pub fn queue_depth(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Identifier of the current primary model.
    pub async fn primary_id(&self) -> String {
        self.primary.read().await.id()
    }

    /// How many swaps have completed.
    #[must_use]
    pub fn swap_count(&self) -> u64 {
        self.swap_count.load(Ordering::SeqCst)
    }

    /// Run one inference call. See the crate docs for the scheduling
    /// contract.
    pub async fn infer(&self, req: InferRequest) -> Result<InferOutcome, InferError> {
        let prompt_tokens = estimate_tokens(&req.system_prompt)
            + estimate_tokens(&req.prompt)
            + req.context.iter().map(|c| estimate_tokens(c)).sum::<u64>();
        let limit = req.kind.prompt_budget();
        if prompt_tokens > limit {
            return Err(InferError::PromptTooLarge {
                tokens: prompt_tokens,
                limit,
            });
        }

        // Bounded FIFO admission: reject when the queue is full.
        let waiting = self.waiting.fetch_add(1, Ordering::SeqCst);
        let _waiting_guard = WaitingGuard(&self.waiting);
        if waiting >= self.config.queue_len {
            let retry = 1 + (waiting / self.config.max_sessions.max(1)) as u64;
            return Err(InferError::Overloaded {
                retry_after_secs: retry,
            });
        }

        let cancel = CancelToken::new();
        let deadline = req.deadline;

        // Slot + token budget, both bounded by the deadline.
        let admission = tokio::time::timeout(deadline, async {
            let permit = Arc::clone(&self.slots)
                .acquire_owned()
                .await
                .expect("semaphore never closed");
            let reservation = self.budget.reserve(prompt_tokens).await;
            (permit, reservation)
        })
        .await;
        let Ok((permit, reservation)) = admission else {
            return Err(InferError::Cancelled(CancelReason::Deadline));
        };

        let cached_prefix = self.cache.touch(&req.system_prompt);

        let backend_req = BackendRequest {
            system_prompt: req.system_prompt.clone(),
            prompt: req.prompt.clone(),
            context: req.context.clone(),
            image: req.image.clone(),
            max_tokens: 1024,
        };

        match req.kind {
            InferKind::Chat => {
                self.run_stream(req, backend_req, cancel, permit, reservation, cached_prefix)
                    .await
            }
            InferKind::VisionOcr => {
                let backend = self.vision_backend().await?;
                let reply = self
                    .run_completed(req.kind, backend, backend_req, deadline, &cancel)
                    .await?;
                drop(reservation);
                drop(permit);
                Ok(completed(reply, cached_prefix))
            }
            InferKind::Extract | InferKind::Classify => {
                // Hold the primary read guard for the call so a swap drains us.
                let guard = self.primary.read().await;
                let backend = Arc::clone(&*guard);
                let reply = self
                    .run_completed(req.kind, backend, backend_req, deadline, &cancel)
                    .await?;
                drop(guard);
                drop(reservation);
                drop(permit);
                Ok(completed(reply, cached_prefix))
            }
        }
    }

    /// Swap the primary model: drain in-flight calls, replace the handle,
    /// verify liveness with a probe. On probe failure the old handle is
    /// restored and the error surfaced.
    pub async fn swap_to(&self, new_backend: Arc<dyn ModelBackend>) -> Result<(), InferError> {
        let new_id = new_backend.id();
        // Taking the write lock waits for every in-flight read guard.
        let mut guard = self.primary.write().await;
        let old = std::mem::replace(&mut *guard, Arc::clone(&new_backend));
        match new_backend.probe().await {
            Ok(()) => {
                self.cache.clear();
                self.swap_count.fetch_add(1, Ordering::SeqCst);
                info!(model = %new_id, "primary model swapped");
                Ok(())
            }
            Err(err) => {
                *guard = old;
                warn!(model = %new_id, error = %err, "swap probe failed, rolled back");
                Err(InferError::Failed {
                    kind: InferKind::Classify,
                    reason: format!("swap probe failed: {err}"),
                })
            }
        }
    }

    /// Unload the vision model if it has been idle past the window.
    /// Intended to be called from a periodic maintenance task.
    pub async fn maintain(&self) {
        let mut vision = self.vision.lock().await;
        if vision.backend.is_some() && vision.last_used.elapsed() > self.config.vision_idle {
            vision.backend = None;
            info!("vision model idle-unloaded");
        }
    }

    // --- internals ---

    async fn vision_backend(&self) -> Result<Arc<dyn ModelBackend>, InferError> {
        let mut vision = self.vision.lock().await;
        if let Some(backend) = vision.backend.clone() {
            vision.last_used = Instant::now();
            return Ok(backend);
        }
        match self.vision_loader.load().await {
            Ok(backend) => {
                info!(model = %backend.id(), "vision model lazy-loaded");
                vision.backend = Some(Arc::clone(&backend));
                vision.last_used = Instant::now();
                Ok(backend)
            }
            Err(err) => Err(InferError::VisionUnavailable(err.to_string())),
        }
    }

    async fn run_completed(
        &self,
        kind: InferKind,
        backend: Arc<dyn ModelBackend>,
        req: BackendRequest,
        deadline: Duration,
        cancel: &CancelToken,
    ) -> Result<BackendReply, InferError> {
        let attempt = tokio::time::timeout(deadline, backend.complete(&req)).await;
        let result = match attempt {
            Err(_) => {
                cancel.cancel(CancelReason::Deadline);
                return Err(InferError::Cancelled(CancelReason::Deadline));
            }
            Ok(Ok(reply)) => return Ok(reply),
            Ok(Err(err)) => err,
        };

        if !result.is_transient() {
            return Err(InferError::Failed {
                kind,
                reason: result.to_string(),
            });
        }

        // One retry with jittered backoff.
        let backoff = Duration::from_millis(rand::thread_rng().gen_range(100..400));
        tokio::time::sleep(backoff).await;
        match tokio::time::timeout(deadline, backend.complete(&req)).await {
            Err(_) => Err(InferError::Cancelled(CancelReason::Deadline)),
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(err)) => Err(InferError::Failed {
                kind,
                reason: err.to_string(),
            }),
        }
    }

    async fn run_stream(
        &self,
        req: InferRequest,
        backend_req: BackendRequest,
        cancel: CancelToken,
        permit: OwnedSemaphorePermit,
        reservation: crate::budget::BudgetReservation,
        cached_prefix: bool,
    ) -> Result<InferOutcome, InferError> {
        let (inner_tx, mut inner_rx) = mpsc::channel(64);
        let (outer_tx, outer_rx) = mpsc::channel(64);
        let guard = Arc::clone(&self.primary).read_owned().await;
        let stream_cancel = cancel.clone();
        let deadline = req.deadline;
        let user = req.user.clone();

        // Relay that stamps the prefix-cache flag onto the final usage.
        tokio::spawn(async move {
            while let Some(event) = inner_rx.recv().await {
                let event = match event {
                    TokenEvent::Done(mut usage) => {
                        usage.cached_prefix = cached_prefix;
                        TokenEvent::Done(usage)
                    }
                    other => other,
                };
                if outer_tx.send(event).await.is_err() {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            // The permit, budget reservation, and primary read guard live
            // exactly as long as the generation.
            let _permit = permit;
            let _reservation = reservation;
            let backend = Arc::clone(&*guard);

            let watchdog = stream_cancel.clone();
            let deadline_task = tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                watchdog.cancel(CancelReason::Deadline);
            });

            let result = backend.stream(&backend_req, inner_tx, &stream_cancel).await;
            deadline_task.abort();
            if let Err(err) = result {
                warn!(user = %user, error = %err, "chat stream ended abnormally");
            }
            drop(guard);
        });

        Ok(InferOutcome::Stream {
            tokens: outer_rx,
            cancel,
        })
    }
}

fn completed(reply: BackendReply, cached_prefix: bool) -> InferOutcome {
    let mut usage = reply.usage;
    usage.cached_prefix = cached_prefix;
    InferOutcome::Completed {
        text: reply.text,
        usage,
    }
}

struct WaitingGuard<'a>(&'a AtomicUsize);

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockModel;

    struct MockVision;

    #[async_trait]
    impl VisionLoader for MockVision {
        async fn load(&self) -> Result<Arc<dyn ModelBackend>, BackendError> {
            Ok(Arc::new(MockModel::new("vision-mock").with_reply("", "OIB: 12345678903")))
        }
    }

    struct BrokenVision;

    #[async_trait]
    impl VisionLoader for BrokenVision {
        async fn load(&self) -> Result<Arc<dyn ModelBackend>, BackendError> {
            Err(BackendError::Failed("model file missing".into()))
        }
    }

    fn orchestrator(config: OrchestratorConfig) -> Orchestrator {
        Orchestrator::new(
            Arc::new(MockModel::new("primary-mock").with_reply("classify", "{\"account\":\"4000\"}")),
            Arc::new(MockVision),
            config,
        )
    }

    fn request(kind: InferKind, prompt: &str) -> InferRequest {
        InferRequest {
            kind,
            user: "mira".into(),
            system_prompt: "bookkeeping system prompt".into(),
            prompt: prompt.into(),
            context: vec![],
            image: None,
            deadline: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn classify_completes_with_usage() {
        let orch = orchestrator(OrchestratorConfig::default());
        let outcome = orch
            .infer(request(InferKind::Classify, "classify this invoice"))
            .await
            .unwrap();
        let InferOutcome::Completed { text, usage } = outcome else {
            panic!("expected completion");
        };
        assert_eq!(text, "{\"account\":\"4000\"}");
        assert!(usage.prompt_tokens > 0);
    }

    #[tokio::test]
    async fn repeated_system_prompt_hits_prefix_cache() {
        let orch = orchestrator(OrchestratorConfig::default());
        let first = orch
            .infer(request(InferKind::Classify, "classify a"))
            .await
            .unwrap();
        let second = orch
            .infer(request(InferKind::Classify, "classify b"))
            .await
            .unwrap();
        let (InferOutcome::Completed { usage: u1, .. }, InferOutcome::Completed { usage: u2, .. }) =
            (first, second)
        else {
            panic!("expected completions");
        };
        assert!(!u1.cached_prefix);
        assert!(u2.cached_prefix);
    }

    #[tokio::test]
    async fn oversized_prompt_is_rejected_up_front() {
        let orch = orchestrator(OrchestratorConfig::default());
        let big = "x".repeat(40_000);
        let err = orch
            .infer(request(InferKind::Classify, &big))
            .await
            .unwrap_err();
        assert!(matches!(err, InferError::PromptTooLarge { .. }));
    }

    #[tokio::test]
    async fn chat_streams_tokens_in_order() {
        let orch = Orchestrator::new(
            Arc::new(MockModel::new("m").with_reply("chat", "jedan dva tri")),
            Arc::new(MockVision),
            OrchestratorConfig::default(),
        );
        let outcome = orch.infer(request(InferKind::Chat, "chat")).await.unwrap();
        let InferOutcome::Stream { mut tokens, .. } = outcome else {
            panic!("expected stream");
        };
        let mut collected = String::new();
        while let Some(ev) = tokens.recv().await {
            match ev {
                TokenEvent::Token(t) => collected.push_str(&t),
                TokenEvent::Done(_) => break,
                TokenEvent::Cancelled => panic!("unexpected cancellation"),
            }
        }
        assert_eq!(collected, "jedan dva tri");
    }

    #[tokio::test]
    async fn vision_failure_is_nonfatal_for_other_kinds() {
        let orch = Orchestrator::new(
            Arc::new(MockModel::new("m").with_reply("classify", "ok")),
            Arc::new(BrokenVision),
            OrchestratorConfig::default(),
        );
        let err = orch
            .infer(request(InferKind::VisionOcr, "read this scan"))
            .await
            .unwrap_err();
        assert!(matches!(err, InferError::VisionUnavailable(_)));

        // The primary path still works.
        assert!(orch.infer(request(InferKind::Classify, "classify")).await.is_ok());
    }

    #[tokio::test]
    async fn swap_replaces_handle_and_clears_cache() {
        let orch = orchestrator(OrchestratorConfig::default());
        assert_eq!(orch.primary_id().await, "primary-mock");
        orch.swap_to(Arc::new(MockModel::new("primary-v2")))
            .await
            .unwrap();
        assert_eq!(orch.primary_id().await, "primary-v2");
        assert_eq!(orch.swap_count(), 1);
    }

    struct DeadBackend;

    #[async_trait]
    impl ModelBackend for DeadBackend {
        fn id(&self) -> String {
            "dead".into()
        }
        async fn probe(&self) -> Result<(), BackendError> {
            Err(BackendError::Timeout)
        }
        async fn complete(&self, _: &BackendRequest) -> Result<BackendReply, BackendError> {
            Err(BackendError::Timeout)
        }
        async fn stream(
            &self,
            _: &BackendRequest,
            _: mpsc::Sender<TokenEvent>,
            _: &CancelToken,
        ) -> Result<Usage, BackendError> {
            Err(BackendError::Timeout)
        }
    }

    #[tokio::test]
    async fn failed_swap_probe_rolls_back() {
        let orch = orchestrator(OrchestratorConfig::default());
        let err = orch.swap_to(Arc::new(DeadBackend)).await.unwrap_err();
        assert!(matches!(err, InferError::Failed { .. }));
        assert_eq!(orch.primary_id().await, "primary-mock");
        assert_eq!(orch.swap_count(), 0);
    }

    #[tokio::test]
    async fn queue_overflow_returns_overloaded() {
        // A reply far larger than the stream channel capacity keeps the
        // generation (and its slot) alive while nobody drains the tokens.
        let long_reply = "w ".repeat(500);
        let orch = Arc::new(Orchestrator::new(
            Arc::new(MockModel::new("m").with_reply("chat", &long_reply)),
            Arc::new(MockVision),
            OrchestratorConfig {
                max_sessions: 1,
                queue_len: 1,
                ..Default::default()
            },
        ));

        // Occupy the only slot with a long-running stream.
        let outcome = orch
            .infer(InferRequest {
                deadline: Duration::from_secs(30),
                ..request(InferKind::Chat, "chat")
            })
            .await
            .unwrap();
        let InferOutcome::Stream { tokens, .. } = outcome else {
            panic!("expected stream");
        };
        // Do not drain: the slot stays held until the channel fills.

        // First waiter occupies the queue slot; run it in the background.
        let o2 = Arc::clone(&orch);
        let _waiter = tokio::spawn(async move {
            o2.infer(InferRequest {
                deadline: Duration::from_secs(30),
                ..request(InferKind::Classify, "classify")
            })
            .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Second waiter overflows the queue.
        let err = orch
            .infer(request(InferKind::Classify, "classify again"))
            .await
            .unwrap_err();
        assert!(matches!(err, InferError::Overloaded { .. }));
        drop(tokens);
    }
}
