//! Timer bookkeeping for `setTimeout` / `setInterval`.
//!
//! Each timer is a tokio task that sleeps until its deadline and then pushes
//! the timer id onto the [`CallbackQueue`]. It never calls guest code itself.
//!
//! The active set is the only source of truth for liveness: a waking task
//! re-checks membership under the lock before it enqueues, so a cancel that
//! races with a firing either wins (nothing is queued) or loses (the entry is
//! queued and then discarded by the cancel).

use crate::callback::{CallbackQueue, PendingCallback};
use crate::error::{RuntimeError, RuntimeResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Smallest interval period. Keeps a zero-delay interval from spinning.
const MIN_INTERVAL_MS: u64 = 1;

/// Timer identifier, unique for the lifetime of a [`TimerManager`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

#[derive(Debug)]
struct TimerEntry {
    delay: Duration,
    repeating: bool,
    task: AbortHandle,
}

type ActiveTimers = Arc<Mutex<HashMap<TimerId, TimerEntry>>>;

/// Owns every scheduled timer.
pub struct TimerManager {
    handle: Handle,
    queue: Arc<CallbackQueue>,
    active: ActiveTimers,
    next_timer_id: AtomicU64,
}

impl TimerManager {
    pub fn new(queue: Arc<CallbackQueue>, handle: Handle) -> Self {
        Self {
            handle,
            queue,
            active: Arc::new(Mutex::new(HashMap::new())),
            next_timer_id: AtomicU64::new(1),
        }
    }

    /// Schedule a timer and return its id.
    ///
    /// The guest closure is not stored here; the caller registers it under the
    /// returned id before control returns to the dispatcher.
    pub fn create_timer(&self, delay_ms: i64, repeating: bool) -> RuntimeResult<TimerId> {
        if delay_ms < 0 {
            return Err(RuntimeError::InvalidDelay(delay_ms));
        }

        let mut delay_ms = delay_ms as u64;
        if repeating {
            delay_ms = delay_ms.max(MIN_INTERVAL_MS);
        }
        let delay = Duration::from_millis(delay_ms);
        let id = TimerId(self.next_timer_id.fetch_add(1, Ordering::Relaxed));

        // Insert under the same lock as the spawn so the task can never look
        // itself up before it is registered.
        let mut active = self.active.lock();
        let task = self
            .handle
            .spawn(run_timer(
                id,
                delay,
                repeating,
                self.active.clone(),
                self.queue.clone(),
            ))
            .abort_handle();
        active.insert(
            id,
            TimerEntry {
                delay,
                repeating,
                task,
            },
        );

        debug!(timer = id.0, delay_ms, repeating, "Timer created");
        Ok(id)
    }

    /// Cancel a timer. Idempotent: false if the id is unknown, already fired
    /// (one-shot) or already cancelled.
    ///
    /// Also drops a firing of this timer that is queued but not yet dispatched.
    pub fn cancel_timer(&self, id: TimerId) -> bool {
        let removed = self.active.lock().remove(&id);
        // Runs even for a fired one-shot, which is no longer active but may
        // still be queued
        if self.queue.discard_timer(id) {
            trace!(timer = id.0, "Discarded queued firing of cancelled timer");
        }
        let Some(entry) = removed else {
            return false;
        };
        entry.task.abort();
        debug!(timer = id.0, "Timer cancelled");
        true
    }

    /// Cancel every timer. Returns how many were live.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<(TimerId, TimerEntry)> = self.active.lock().drain().collect();
        for (id, entry) in &drained {
            entry.task.abort();
            self.queue.discard_timer(*id);
        }
        drained.len()
    }

    pub fn is_active(&self, id: TimerId) -> bool {
        self.active.lock().contains_key(&id)
    }

    /// Whether a live timer is repeating. None for unknown ids.
    pub fn is_repeating(&self, id: TimerId) -> Option<bool> {
        self.active.lock().get(&id).map(|entry| entry.repeating)
    }

    /// The effective period of a live timer.
    pub fn delay(&self, id: TimerId) -> Option<Duration> {
        self.active.lock().get(&id).map(|entry| entry.delay)
    }

    pub fn has_active_timers(&self) -> bool {
        !self.active.lock().is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }
}

impl Drop for TimerManager {
    fn drop(&mut self) {
        for (_, entry) in self.active.lock().drain() {
            entry.task.abort();
        }
    }
}

async fn run_timer(
    id: TimerId,
    delay: Duration,
    repeating: bool,
    active: ActiveTimers,
    queue: Arc<CallbackQueue>,
) {
    let mut deadline = Instant::now() + delay;
    loop {
        tokio::time::sleep_until(deadline).await;

        {
            let mut timers = active.lock();
            if !timers.contains_key(&id) {
                trace!(timer = id.0, "Timer no longer active at fire time");
                return;
            }
            if !repeating {
                timers.remove(&id);
            }
            queue.enqueue(PendingCallback::timer(id));
        }

        if !repeating {
            return;
        }

        // Re-armed only after this firing is queued. Missed periods are
        // skipped rather than fired in a burst.
        deadline += delay;
        let now = Instant::now();
        if deadline < now {
            deadline = now + delay;
        }
    }
}
