//! Ready-callback queue and its single-consumer dispatcher.
//!
//! ## Producers and the consumer
//!
//! Timer tasks, network completions and anything else running off the
//! interpreter thread only ever call [`CallbackQueue::enqueue`]. The
//! [`Dispatcher`] is bound to the interpreter thread when it is created and
//! refuses to run anywhere else, so guest code is never entered from two
//! threads.
//!
//! ## Ordering
//!
//! - FIFO within a drain pass
//! - A drain pass takes a snapshot; entries enqueued while it runs wait for
//!   the next pass
//! - A timer id is queued at most once at a time: a firing that finds its
//!   previous firing still undispatched is coalesced away
//!
//! ## Error handling
//!
//! A callback that raises is logged and counted; the rest of the pass still
//! runs.

use crate::error::{GuestError, RuntimeError, RuntimeResult};
use crate::guest::{GuestInterpreter, Invocation};
use crate::timers::TimerId;
use crossbeam_channel::{Receiver, Sender, bounded};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::ThreadId;
use tracing::{debug, trace, warn};

/// What a queued callback refers to on the guest side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackTarget {
    /// A timer or interval closure, keyed by timer id
    Timer(TimerId),
    /// A single-use completion closure (network operations)
    Completion(u64),
}

/// Data delivered with a successful completion.
#[derive(Debug, Clone, PartialEq)]
pub enum CallbackData {
    None,
    Bytes(Vec<u8>),
    Json(serde_json::Value),
}

/// Outcome passed to a completion closure.
#[derive(Debug, Clone, PartialEq)]
pub enum CallbackResult {
    Success(CallbackData),
    /// The operation is fine but nothing was available yet
    NoData,
    Failure(String),
}

impl CallbackResult {
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failure(_))
    }
}

/// A ready-to-run callback waiting for the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingCallback {
    pub target: CallbackTarget,
    pub result: Option<CallbackResult>,
}

impl PendingCallback {
    pub fn timer(id: TimerId) -> Self {
        Self {
            target: CallbackTarget::Timer(id),
            result: None,
        }
    }

    pub fn completion(id: u64, result: CallbackResult) -> Self {
        Self {
            target: CallbackTarget::Completion(id),
            result: Some(result),
        }
    }
}

#[derive(Default)]
struct QueueState {
    entries: VecDeque<PendingCallback>,
    queued_timers: HashSet<TimerId>,
}

/// Thread-safe FIFO of ready callbacks with a wake signal.
///
/// The wake signal is a capacity-1 channel: any number of enqueues between
/// two waits collapse into a single wake-up, and the consumer can `select`
/// on it together with other channels.
pub struct CallbackQueue {
    state: Mutex<QueueState>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    enqueued: AtomicU64,
    coalesced: AtomicU64,
}

impl Default for CallbackQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackQueue {
    pub fn new() -> Self {
        let (wake_tx, wake_rx) = bounded(1);
        Self {
            state: Mutex::new(QueueState::default()),
            wake_tx,
            wake_rx,
            enqueued: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
        }
    }

    /// Append a callback and wake the consumer.
    ///
    /// Returns false when the entry was coalesced because the same timer is
    /// already waiting to be dispatched.
    pub fn enqueue(&self, callback: PendingCallback) -> bool {
        {
            let mut state = self.state.lock();
            if let CallbackTarget::Timer(id) = callback.target {
                if !state.queued_timers.insert(id) {
                    self.coalesced.fetch_add(1, Ordering::Relaxed);
                    trace!(timer = id.0, "Timer firing coalesced, previous still queued");
                    return false;
                }
            }
            state.entries.push_back(callback);
        }
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        // Full means a wake-up is already pending
        let _ = self.wake_tx.try_send(());
        true
    }

    /// Take everything currently queued, in FIFO order.
    pub fn drain(&self) -> Vec<PendingCallback> {
        let mut state = self.state.lock();
        state.queued_timers.clear();
        state.entries.drain(..).collect()
    }

    /// Drop a queued entry for a cancelled timer. Returns true if one was removed.
    pub fn discard_timer(&self, id: TimerId) -> bool {
        let mut state = self.state.lock();
        if !state.queued_timers.remove(&id) {
            return false;
        }
        state
            .entries
            .retain(|entry| entry.target != CallbackTarget::Timer(id));
        true
    }

    /// Drop every queued entry.
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        state.queued_timers.clear();
        let dropped = state.entries.len();
        state.entries.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Wake signal for the consumer. Receives once per burst of enqueues.
    pub fn wake_receiver(&self) -> &Receiver<()> {
        &self.wake_rx
    }

    /// Total callbacks accepted since creation
    pub fn enqueued_total(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    /// Total timer firings dropped by coalescing
    pub fn coalesced_total(&self) -> u64 {
        self.coalesced.load(Ordering::Relaxed)
    }
}

struct ClosureEntry<T> {
    value: T,
    repeating: bool,
}

/// Guest-side table mapping callback targets to stored closures.
///
/// Lives on the interpreter thread. One-shot entries are removed when they are
/// resolved for invocation; interval entries stay until released.
pub struct ClosureTable<T> {
    entries: HashMap<CallbackTarget, ClosureEntry<T>>,
    next_completion_id: u64,
}

impl<T> Default for ClosureTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ClosureTable<T> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next_completion_id: 1,
        }
    }

    /// Store a timer closure under its timer id.
    pub fn insert_timer(&mut self, id: TimerId, value: T, repeating: bool) {
        self.entries
            .insert(CallbackTarget::Timer(id), ClosureEntry { value, repeating });
    }

    /// Store a single-use completion closure and return its id.
    pub fn insert_completion(&mut self, value: T) -> u64 {
        let id = self.next_completion_id;
        self.next_completion_id += 1;
        self.entries.insert(
            CallbackTarget::Completion(id),
            ClosureEntry {
                value,
                repeating: false,
            },
        );
        id
    }

    /// Look up the closure for a dispatch.
    ///
    /// One-shot entries are removed and handed back by value through
    /// `on_removed`; repeating entries are read through `on_retained`.
    pub fn resolve<R>(
        &mut self,
        target: CallbackTarget,
        on_retained: impl FnOnce(&T) -> R,
        on_removed: impl FnOnce(T) -> R,
    ) -> Option<R> {
        let repeating = self.entries.get(&target)?.repeating;
        if repeating {
            self.entries.get(&target).map(|entry| on_retained(&entry.value))
        } else {
            self.entries
                .remove(&target)
                .map(|entry| on_removed(entry.value))
        }
    }

    /// Remove an entry regardless of kind (cancellation).
    pub fn release(&mut self, target: CallbackTarget) -> Option<T> {
        self.entries.remove(&target).map(|entry| entry.value)
    }

    /// Remove every entry.
    pub fn drain(&mut self) -> Vec<T> {
        self.entries.drain().map(|(_, entry)| entry.value).collect()
    }

    pub fn contains(&self, target: CallbackTarget) -> bool {
        self.entries.contains_key(&target)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Counters from one drain pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    pub invoked: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl DispatchStats {
    pub fn total(&self) -> usize {
        self.invoked + self.skipped + self.failed
    }
}

/// Single consumer of the [`CallbackQueue`], pinned to one thread.
pub struct Dispatcher {
    queue: std::sync::Arc<CallbackQueue>,
    owner: ThreadId,
}

impl Dispatcher {
    /// Bind a dispatcher to the calling thread.
    pub fn for_current_thread(queue: std::sync::Arc<CallbackQueue>) -> Self {
        Self {
            queue,
            owner: std::thread::current().id(),
        }
    }

    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    pub fn queue(&self) -> &std::sync::Arc<CallbackQueue> {
        &self.queue
    }

    /// Run every callback queued at the time of the call.
    ///
    /// Errors raised by callbacks are logged and counted, never propagated.
    /// The only error returned is [`RuntimeError::WrongThread`].
    pub fn drain_and_dispatch<G: GuestInterpreter + ?Sized>(
        &self,
        guest: &mut G,
    ) -> RuntimeResult<DispatchStats> {
        if std::thread::current().id() != self.owner {
            return Err(RuntimeError::WrongThread);
        }

        let batch = self.queue.drain();
        let mut stats = DispatchStats::default();
        if batch.is_empty() {
            return Ok(stats);
        }

        debug!(count = batch.len(), "Dispatching callbacks");
        for callback in batch {
            let target = callback.target;
            match guest.invoke(callback) {
                Ok(Invocation::Invoked) => stats.invoked += 1,
                Ok(Invocation::Skipped) => {
                    trace!(?target, "No closure registered, callback skipped");
                    stats.skipped += 1;
                }
                Err(GuestError { message }) => {
                    warn!(?target, error = %message, "Callback failed");
                    stats.failed += 1;
                }
            }
        }

        Ok(stats)
    }
}
