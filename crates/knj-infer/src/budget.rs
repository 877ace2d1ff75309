// SPDX-License-Identifier: MIT OR Apache-2.0
//! In-flight prompt-token budgeting and the prompt-prefix cache.

use knj_core::sha256_hex;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;

/// Tracks the sum of reserved prompt tokens against a fixed cap.
///
/// Admission reserves before touching the model; if the reservation would
/// exceed the cap the caller waits until another call releases. This is
/// advisory backpressure — the underlying runtime does its own KV
/// management — but it keeps the daemon from queueing more context than
/// the model host can hold.
pub struct TokenBudget {
    cap: u64,
    used: Mutex<u64>,
    released: Notify,
}

impl TokenBudget {
    /// A budget with the given token cap.
    #[must_use]
    pub fn new(cap: u64) -> Self {
        Self {
            cap,
            used: Mutex::new(0),
            released: Notify::new(),
        }
    }

    /// Currently reserved tokens.
    #[must_use]
    pub fn used(&self) -> u64 {
        *self.used.lock()
    }

    /// Reserve `tokens`, waiting until they fit. Reservations larger than
    /// the whole cap are clamped so a single oversized request cannot
    /// deadlock admission.
    pub async fn reserve(self: &Arc<Self>, tokens: u64) -> BudgetReservation {
        let tokens = tokens.min(self.cap);
        loop {
            {
                let mut used = self.used.lock();
                if *used + tokens <= self.cap {
                    *used += tokens;
                    return BudgetReservation {
                        budget: Arc::clone(self),
                        tokens,
                    };
                }
            }
            self.released.notified().await;
        }
    }

    fn release(&self, tokens: u64) {
        let mut used = self.used.lock();
        *used = used.saturating_sub(tokens);
        drop(used);
        self.released.notify_waiters();
    }
}

/// RAII reservation; tokens return to the budget on drop.
pub struct BudgetReservation {
    budget: Arc<TokenBudget>,
    tokens: u64,
}

impl Drop for BudgetReservation {
    fn drop(&mut self) {
        self.budget.release(self.tokens);
    }
}

/// Rough token estimate for budgeting: four characters per token.
#[must_use]
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() as u64 / 4).max(1)
}

// ---------------------------------------------------------------------------
// Prompt-prefix cache
// ---------------------------------------------------------------------------

/// LRU cache of system-prompt prefixes already resident on the model host.
///
/// A hit means the runtime can skip prefill for the shared prefix, which
/// shortens time-to-first-token for the fixed prompts the pipeline reuses
/// on every call.
pub struct PromptCache {
    cap: usize,
    inner: Mutex<PromptCacheInner>,
}

struct PromptCacheInner {
    entries: HashMap<String, u64>,
    order: VecDeque<String>,
    hits: u64,
    misses: u64,
}

impl PromptCache {
    /// A cache holding at most `cap` distinct prefixes.
    #[must_use]
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            inner: Mutex::new(PromptCacheInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
                hits: 0,
                misses: 0,
            }),
        }
    }

    /// Record a prefix use. Returns `true` on a cache hit.
    pub fn touch(&self, system_prompt: &str) -> bool {
        let key = sha256_hex(system_prompt.as_bytes());
        let tokens = estimate_tokens(system_prompt);
        let mut inner = self.inner.lock();

        let hit = inner.entries.contains_key(&key);
        if hit {
            inner.hits += 1;
            // Refresh LRU position.
            inner.order.retain(|k| *k != key);
        } else {
            inner.misses += 1;
            inner.entries.insert(key.clone(), tokens);
            while inner.entries.len() > self.cap {
                if let Some(evicted) = inner.order.pop_front() {
                    inner.entries.remove(&evicted);
                } else {
                    break;
                }
            }
        }
        inner.order.push_back(key);
        hit
    }

    /// Hit / miss counters.
    #[must_use]
    pub fn stats(&self) -> (u64, u64) {
        let inner = self.inner.lock();
        (inner.hits, inner.misses)
    }

    /// Drop every cached prefix (model swap invalidates resident state).
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
    }
}
