//! Execution phases and the termination watchdog.
//!
//! The tracker decides when a script run is finished. It only ever looks at
//! an [`OperationTally`] snapshot, taken from a [`TallySource`], so tests can
//! drive it with a scripted source instead of live subsystems.

use crate::callback::CallbackQueue;
use crate::config::TrackerConfig;
use crate::error::{RuntimeError, RuntimeResult};
use crate::net::NetworkCoordinator;
use crate::tasks::BackgroundTasks;
use crate::timers::TimerManager;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Where the host is in its run of a script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPhase {
    Init,
    Fragments,
    Main,
    Tracking,
    /// Terminal. The tracker never signals termination from here.
    Interactive,
}

/// Snapshot of all outstanding asynchronous work.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OperationTally {
    pub background_tasks: usize,
    pub active_timers: usize,
    pub network_operations: usize,
    pub open_connections: usize,
    pub open_listeners: usize,
    pub queued_callbacks: usize,
}

impl OperationTally {
    pub fn total(&self) -> usize {
        self.background_tasks
            + self.active_timers
            + self.network_operations
            + self.open_connections
            + self.open_listeners
            + self.queued_callbacks
    }

    pub fn is_idle(&self) -> bool {
        self.total() == 0
    }
}

/// Anything that can report an [`OperationTally`].
pub trait TallySource: Send + Sync {
    fn tally(&self) -> OperationTally;
}

/// Tally over the live runtime subsystems.
///
/// Each subsystem is read under its own lock; the combined snapshot is not
/// atomic across subsystems, which only ever costs a debounce reset.
pub struct SubsystemTally {
    pub tasks: Arc<BackgroundTasks>,
    pub timers: Arc<TimerManager>,
    pub network: NetworkCoordinator,
    pub queue: Arc<CallbackQueue>,
}

impl TallySource for SubsystemTally {
    fn tally(&self) -> OperationTally {
        OperationTally {
            background_tasks: self.tasks.live_count(),
            active_timers: self.timers.active_count(),
            network_operations: self.network.active_operations(),
            open_connections: self.network.open_connections(),
            open_listeners: self.network.open_listeners(),
            queued_callbacks: self.queue.len(),
        }
    }
}

#[derive(Debug)]
struct TrackerState {
    phase: ExecutionPhase,
    daemon: bool,
    main_running: bool,
    last_tally: Option<OperationTally>,
    stable_polls: u32,
}

impl TrackerState {
    fn reset_stability(&mut self) {
        self.last_tally = None;
        self.stable_polls = 0;
    }
}

/// Phase state machine plus debounced termination check.
pub struct ExecutionTracker {
    source: Arc<dyn TallySource>,
    config: TrackerConfig,
    state: Mutex<TrackerState>,
}

impl ExecutionTracker {
    pub fn new(source: Arc<dyn TallySource>, config: TrackerConfig) -> Self {
        Self {
            source,
            config,
            state: Mutex::new(TrackerState {
                phase: ExecutionPhase::Init,
                daemon: false,
                main_running: false,
                last_tally: None,
                stable_polls: 0,
            }),
        }
    }

    pub fn phase(&self) -> ExecutionPhase {
        self.state.lock().phase
    }

    pub fn is_daemon(&self) -> bool {
        self.state.lock().daemon
    }

    /// Mark the run as a long-lived server. Termination is never signalled
    /// while set.
    pub fn set_daemon(&self, daemon: bool) {
        let mut state = self.state.lock();
        if state.daemon != daemon {
            info!(daemon, "Daemon mode changed");
        }
        state.daemon = daemon;
        state.reset_stability();
    }

    pub fn start_fragments(&self) {
        self.transition("start_fragments", |_| ExecutionPhase::Fragments);
    }

    /// Fragments done. Goes to `Main` if main work is pending or already
    /// running, otherwise straight to `Tracking`.
    pub fn complete_fragments(&self, main_pending: bool) {
        self.transition("complete_fragments", |state| {
            if main_pending || state.main_running {
                ExecutionPhase::Main
            } else {
                ExecutionPhase::Tracking
            }
        });
    }

    pub fn start_main(&self) {
        self.transition("start_main", |state| {
            state.main_running = true;
            ExecutionPhase::Main
        });
    }

    pub fn complete_main(&self) {
        self.transition("complete_main", |state| {
            state.main_running = false;
            ExecutionPhase::Tracking
        });
    }

    pub fn start_interactive(&self) {
        self.transition("start_interactive", |_| ExecutionPhase::Interactive);
    }

    fn transition(&self, name: &str, next: impl FnOnce(&mut TrackerState) -> ExecutionPhase) {
        let mut state = self.state.lock();
        if state.phase == ExecutionPhase::Interactive {
            warn!(transition = name, "Ignoring phase transition in interactive mode");
            return;
        }
        let from = state.phase;
        let to = next(&mut state);
        state.phase = to;
        state.reset_stability();
        debug!(transition = name, ?from, ?to, "Phase transition");
    }

    /// One watchdog poll.
    ///
    /// True only in `Tracking`, outside daemon mode, once the last
    /// `stability_threshold` consecutive polls all saw a zero tally.
    pub fn should_terminate(&self) -> bool {
        let mut state = self.state.lock();
        if state.daemon || state.phase != ExecutionPhase::Tracking {
            state.reset_stability();
            return false;
        }

        // Counts this poll too, so `stability_threshold` identical polls are
        // enough
        let tally = self.source.tally();
        if state.last_tally == Some(tally) {
            state.stable_polls = state.stable_polls.saturating_add(1);
        } else {
            state.stable_polls = 1;
        }
        state.last_tally = Some(tally);

        tally.is_idle() && state.stable_polls >= self.config.stability_threshold
    }

    /// Consecutive unchanged polls so far
    pub fn stable_polls(&self) -> u32 {
        self.state.lock().stable_polls
    }

    pub fn tally(&self) -> OperationTally {
        self.source.tally()
    }

    /// Poll [`Self::should_terminate`] every `poll_interval` until it holds.
    ///
    /// On timeout the caller is expected to force-shut the runtime down.
    pub async fn wait_for_termination(&self, timeout: Duration) -> RuntimeResult<()> {
        let poll = self.config.poll_interval();
        let wait = async {
            loop {
                if self.should_terminate() {
                    return;
                }
                tokio::time::sleep(poll).await;
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(()) => {
                debug!("All operations settled");
                Ok(())
            }
            Err(_) => {
                let tally = self.tally();
                warn!(
                    ?tally,
                    timeout_ms = timeout.as_millis() as u64,
                    "Operations still pending at shutdown deadline"
                );
                Err(RuntimeError::ShutdownTimeout(timeout))
            }
        }
    }
}
