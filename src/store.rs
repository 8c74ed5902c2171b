//! Correlation store.
//!
//! Maps correlation tokens to response payloads and wakes the one handler
//! waiting on each token. Responses are deposited by the subscribe loop with
//! [`CorrelationStore::put`] and consumed by connection handlers through a
//! [`Claim`] (or the one-shot [`CorrelationStore::wait_and_take`]).
//!
//! # Slots
//!
//! Each token maps to one slot:
//!
//! - `Waiting`: a handler claimed the token and awaits a `oneshot` receiver.
//!   `put` removes the slot and sends the payload straight to it.
//! - `Ready`: the payload arrived with nobody waiting (before the claim, or
//!   after the claimant gave up). The next claim takes it; otherwise the
//!   reaper removes it once the retention window has passed.
//!
//! Every operation is a single hash-map access under one mutex, with no
//! polling and no scans except the periodic reaper pass.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time;

use crate::{log_debug, log_info, BridgeError, CorrelationId, Result};

/// Acquire a mutex guard, intentionally ignoring poisoning.
///
/// The map holds no invariant spanning more than one entry; the worst outcome
/// of a panic mid-update is one lost or unreaped response.
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // ---
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

enum Slot {
    Waiting(oneshot::Sender<Bytes>),
    Ready { payload: Bytes, arrived_at: Instant },
}

/// Store counters, updated with relaxed atomics.
#[derive(Debug, Default)]
pub struct StoreStats {
    delivered: AtomicU64,
    unclaimed: AtomicU64,
    timed_out: AtomicU64,
    reaped: AtomicU64,
}

impl StoreStats {
    /// Responses handed to a claimant.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Responses that arrived with no claimant waiting.
    pub fn unclaimed(&self) -> u64 {
        self.unclaimed.load(Ordering::Relaxed)
    }

    /// Claims that hit their deadline.
    pub fn timed_out(&self) -> u64 {
        self.timed_out.load(Ordering::Relaxed)
    }

    /// Ready entries removed by the reaper.
    pub fn reaped(&self) -> u64 {
        self.reaped.load(Ordering::Relaxed)
    }
}

struct Shared {
    slots: Mutex<HashMap<CorrelationId, Slot>>,
    retention: Duration,
    stats: StoreStats,
}

/// Concurrent token → response store.
///
/// Cheap to clone (internally `Arc`-backed).
#[derive(Clone)]
pub struct CorrelationStore {
    shared: Arc<Shared>,
}

impl CorrelationStore {
    // ---

    /// Create an empty store whose unclaimed entries live for `retention`.
    pub fn new(retention: Duration) -> Self {
        // ---
        Self {
            shared: Arc::new(Shared {
                slots: Mutex::new(HashMap::new()),
                retention,
                stats: StoreStats::default(),
            }),
        }
    }

    /// Deposit a response for `id`.
    ///
    /// Wakes the claimant if one is waiting; otherwise stores (or overwrites)
    /// the payload for a later claim. Never blocks beyond the map lock.
    pub fn put(&self, id: CorrelationId, payload: Bytes) {
        // ---
        let mut slots = lock_ignore_poison(&self.shared.slots);

        match slots.remove(&id) {
            Some(Slot::Waiting(tx)) => {
                drop(slots);
                // Counted before the wake so the claimant never observes a stale count.
                self.shared.stats.delivered.fetch_add(1, Ordering::Relaxed);
                if tx.send(payload).is_err() {
                    // Claimant abandoned its wait between timeout and release.
                    self.shared.stats.delivered.fetch_sub(1, Ordering::Relaxed);
                    self.shared.stats.unclaimed.fetch_add(1, Ordering::Relaxed);
                    log_debug!("response for {id} arrived after its claimant left; discarded");
                }
            }
            Some(Slot::Ready { .. }) | None => {
                slots.insert(
                    id,
                    Slot::Ready {
                        payload,
                        arrived_at: Instant::now(),
                    },
                );
                self.shared.stats.unclaimed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Register as the single claimant of `id`.
    ///
    /// Claim *before* publishing the request so that a fast response can
    /// never slip past; the returned [`Claim`] is then awaited with
    /// [`Claim::wait`]. Dropping the claim unregisters it.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::AlreadyClaimed`] if another claim on `id` is live.
    pub fn claim(&self, id: CorrelationId) -> Result<Claim> {
        // ---
        let mut slots = lock_ignore_poison(&self.shared.slots);

        let state = match slots.remove(&id) {
            Some(Slot::Waiting(tx)) => {
                slots.insert(id.clone(), Slot::Waiting(tx));
                return Err(BridgeError::AlreadyClaimed(id.to_string()));
            }
            Some(Slot::Ready { payload, .. }) => ClaimState::Ready(payload),
            None => {
                let (tx, rx) = oneshot::channel();
                slots.insert(id.clone(), Slot::Waiting(tx));
                ClaimState::Pending(rx)
            }
        };

        Ok(Claim {
            id,
            store: self.clone(),
            state,
        })
    }

    /// Wait up to `timeout` for the response to `id`, removing it on success.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::CorrelationTimeout`] if nothing arrived in time
    /// - [`BridgeError::AlreadyClaimed`] if another caller waits on `id`
    pub async fn wait_and_take(&self, id: CorrelationId, timeout: Duration) -> Result<Bytes> {
        // ---
        self.claim(id)?.wait(timeout).await
    }

    /// Remove ready entries older than the retention window.
    ///
    /// Returns the number of entries removed.
    pub fn reap_expired(&self) -> usize {
        // ---
        let retention = self.shared.retention;
        let now = Instant::now();
        let mut removed = 0;

        {
            let mut slots = lock_ignore_poison(&self.shared.slots);
            slots.retain(|_, slot| match slot {
                Slot::Ready { arrived_at, .. } if now.duration_since(*arrived_at) >= retention => {
                    removed += 1;
                    false
                }
                _ => true,
            });
        }

        if removed > 0 {
            self.shared
                .stats
                .reaped
                .fetch_add(removed as u64, Ordering::Relaxed);
            log_debug!("reaped {removed} unclaimed responses");
        }
        removed
    }

    /// Run [`reap_expired`](Self::reap_expired) every `interval` until
    /// `shutdown` flips to `true` (or its sender is dropped).
    pub fn spawn_reaper(
        &self,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        // ---
        let store = self.clone();

        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        store.reap_expired();
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            log_info!("correlation store reaper stopped");
        })
    }

    /// Number of entries (waiting and ready) currently held.
    pub fn len(&self) -> usize {
        lock_ignore_poison(&self.shared.slots).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> &StoreStats {
        &self.shared.stats
    }

    /// Drop the waiting slot for `id`, leaving any ready payload to the reaper.
    fn release(&self, id: &CorrelationId) {
        // ---
        let mut slots = lock_ignore_poison(&self.shared.slots);
        if matches!(slots.get(id), Some(Slot::Waiting(_))) {
            slots.remove(id);
        }
    }
}

enum ClaimState {
    Ready(Bytes),
    Pending(oneshot::Receiver<Bytes>),
    Done,
}

/// Exclusive right to the response for one correlation token.
///
/// Exactly one claim can be live per token; it is consumed by
/// [`wait`](Claim::wait) and unregistered on drop.
pub struct Claim {
    id: CorrelationId,
    store: CorrelationStore,
    state: ClaimState,
}

impl Claim {
    pub fn id(&self) -> &CorrelationId {
        &self.id
    }

    /// Wait up to `timeout` for the response.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::CorrelationTimeout`] if the deadline passes first
    /// - [`BridgeError::Transport`] if the store was torn down underneath
    pub async fn wait(mut self, timeout: Duration) -> Result<Bytes> {
        // ---
        match std::mem::replace(&mut self.state, ClaimState::Done) {
            ClaimState::Ready(payload) => {
                self.store
                    .shared
                    .stats
                    .delivered
                    .fetch_add(1, Ordering::Relaxed);
                Ok(payload)
            }
            ClaimState::Pending(mut rx) => match time::timeout(timeout, &mut rx).await {
                Ok(Ok(payload)) => Ok(payload),
                Ok(Err(_)) => Err(BridgeError::Transport(format!(
                    "correlation slot for {} dropped",
                    self.id
                ))),
                Err(_elapsed) => {
                    // A put may have raced the deadline; take it if so.
                    if let Ok(payload) = rx.try_recv() {
                        return Ok(payload);
                    }
                    self.store
                        .shared
                        .stats
                        .timed_out
                        .fetch_add(1, Ordering::Relaxed);
                    Err(BridgeError::CorrelationTimeout)
                }
            },
            ClaimState::Done => Err(BridgeError::CorrelationTimeout),
        }
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.store.release(&self.id);
    }
}
