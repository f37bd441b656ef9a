/*!
 * Priority-aware concurrency limiter.
 *
 * Bounds how many translation jobs talk to the backend at once. Waiters
 * queue in two tiers: priority waiters ahead of everyone else, FIFO within
 * each tier. A released slot is handed straight to the head waiter under
 * the same lock that frees it, so a newcomer can never overtake the queue.
 *
 * `available` may go negative after the capacity shrinks while slots are
 * held; releases then pay off that debt before anyone is woken.
 */

use log::{debug, info};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::app_config::{keys, parse_usize, SettingsProvider};
use crate::errors::TranslationError;

#[derive(Debug)]
struct Waiter {
    id: u64,
    priority: bool,
    grant: oneshot::Sender<()>,
}

#[derive(Debug)]
struct LimiterState {
    max: usize,
    available: i64,
    waiters: VecDeque<Waiter>,
}

impl LimiterState {
    /// Hand free slots to waiters, head first; returns how many were woken
    fn dispatch(&mut self) -> usize {
        let mut woken = 0;
        while self.available > 0 {
            let Some(waiter) = self.waiters.pop_front() else {
                break;
            };
            // A closed receiver belongs to an acquire that is being dropped;
            // its guard finds itself gone from the queue and gives nothing back
            if waiter.grant.send(()).is_ok() {
                self.available -= 1;
                woken += 1;
            }
        }
        woken
    }
}

/// Snapshot of limiter counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterStats {
    /// Configured capacity
    pub max_concurrency: usize,
    /// Free slots (negative while paying off a shrink)
    pub available: i64,
    /// Queued waiters
    pub waiting: usize,
}

/// Bounded slot admission with a priority tier
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    state: Mutex<LimiterState>,
    reconfigure: tokio::sync::Mutex<()>,
    next_waiter_id: AtomicU64,
}

impl ConcurrencyLimiter {
    /// Create a limiter with `max_concurrency` slots (at least one)
    pub fn new(max_concurrency: usize) -> Self {
        let max = max_concurrency.max(1);
        Self {
            state: Mutex::new(LimiterState {
                max,
                available: max as i64,
                waiters: VecDeque::new(),
            }),
            reconfigure: tokio::sync::Mutex::new(()),
            next_waiter_id: AtomicU64::new(0),
        }
    }

    /// Wait for a slot
    ///
    /// Returns immediately when a slot is free and nobody is queued.
    /// Otherwise the caller queues (priority callers behind earlier priority
    /// callers, ahead of all others) until a slot is handed over or `cancel`
    /// fires. A cancelled waiter leaves the queue without waking anyone.
    pub async fn acquire(
        self: &Arc<Self>,
        is_priority: bool,
        cancel: &CancellationToken,
    ) -> Result<SlotGuard, TranslationError> {
        if cancel.is_cancelled() {
            return Err(TranslationError::Cancelled);
        }

        let (id, mut granted) = {
            let mut state = self.state.lock();

            if state.available > 0 && state.waiters.is_empty() {
                state.available -= 1;
                return Ok(SlotGuard::new(Arc::clone(self)));
            }

            let id = self.next_waiter_id.fetch_add(1, Ordering::Relaxed);
            let (grant, granted) = oneshot::channel();
            let index = if is_priority {
                state
                    .waiters
                    .iter()
                    .position(|w| !w.priority)
                    .unwrap_or(state.waiters.len())
            } else {
                state.waiters.len()
            };
            state.waiters.insert(index, Waiter { id, priority: is_priority, grant });
            debug!(
                "Queued {} waiter {} at position {} of {}",
                if is_priority { "priority" } else { "normal" },
                id,
                index,
                state.waiters.len()
            );
            (id, granted)
        };

        let mut pending = PendingWaiter {
            limiter: Arc::clone(self),
            id,
            armed: true,
        };

        tokio::select! {
            biased;
            result = &mut granted => {
                pending.armed = false;
                match result {
                    Ok(()) => Ok(SlotGuard::new(Arc::clone(self))),
                    Err(_) => Err(TranslationError::Cancelled),
                }
            }
            _ = cancel.cancelled() => {
                drop(pending);
                Err(TranslationError::Cancelled)
            }
        }
    }

    /// Change the capacity at runtime
    ///
    /// The value is clamped to at least one. Growing the capacity wakes
    /// queued waiters into the new slots, priority tier first. Returns the
    /// number of waiters woken.
    pub async fn set_max_concurrency(&self, max_concurrency: usize) -> usize {
        let _serialized = self.reconfigure.lock().await;
        let max = max_concurrency.max(1);

        let mut state = self.state.lock();
        if state.max == max {
            return 0;
        }

        let delta = max as i64 - state.max as i64;
        info!("Translation concurrency changed from {} to {}", state.max, max);
        state.max = max;
        state.available += delta;

        state.dispatch()
    }

    /// Re-read the capacity from settings
    pub async fn refresh_from_settings(&self, settings: &dyn SettingsProvider) -> anyhow::Result<usize> {
        let raw = settings.get_setting(keys::MAX_CONCURRENT_JOBS).await?;
        let max = parse_usize(raw.as_ref(), 1);
        self.set_max_concurrency(max).await;
        Ok(max.max(1))
    }

    fn release_slot(&self) {
        let mut state = self.state.lock();
        state.available += 1;
        state.dispatch();
    }

    /// Remove a waiter that gave up; returns false when it was already granted
    fn withdraw(&self, id: u64) -> bool {
        let mut state = self.state.lock();
        match state.waiters.iter().position(|w| w.id == id) {
            Some(index) => {
                state.waiters.remove(index);
                true
            }
            None => false,
        }
    }

    /// Configured capacity
    pub fn max_concurrency(&self) -> usize {
        self.state.lock().max
    }

    /// Current counters
    pub fn stats(&self) -> LimiterStats {
        let state = self.state.lock();
        LimiterStats {
            max_concurrency: state.max,
            available: state.available,
            waiting: state.waiters.len(),
        }
    }

    /// Number of queued waiters
    pub fn waiting(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Free slots
    pub fn available(&self) -> i64 {
        self.state.lock().available
    }
}

/// Cleans up a waiter whose acquire did not complete
struct PendingWaiter {
    limiter: Arc<ConcurrencyLimiter>,
    id: u64,
    armed: bool,
}

impl Drop for PendingWaiter {
    fn drop(&mut self) {
        if self.armed && !self.limiter.withdraw(self.id) {
            // The slot was handed over while we were giving up
            self.limiter.release_slot();
        }
    }
}

/// A held slot; released exactly once, at the latest on drop
#[derive(Debug)]
pub struct SlotGuard {
    limiter: Arc<ConcurrencyLimiter>,
    released: bool,
}

impl SlotGuard {
    fn new(limiter: Arc<ConcurrencyLimiter>) -> Self {
        Self { limiter, released: false }
    }

    /// Give the slot back; later calls do nothing
    pub fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.limiter.release_slot();
        }
    }

    /// Whether the slot was already given back
    pub fn is_released(&self) -> bool {
        self.released
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.release();
    }
}
