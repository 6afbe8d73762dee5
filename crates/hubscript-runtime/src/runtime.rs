//! Runtime facade.
//!
//! A [`Runtime`] owns one interpreter thread and the subsystems around it.
//! Everything is constructed per instance and handed to the interpreter
//! explicitly; there is no process-wide state.
//!
//! # Example
//!
//! ```no_run
//! use hubscript_runtime::Runtime;
//!
//! #[tokio::main]
//! async fn main() {
//!     let runtime = Runtime::builder().build().unwrap();
//!
//!     let result = runtime.run_main("setTimeout(function() print('done') end, 10)", "main.lua").await;
//!     assert!(result.unwrap().success);
//!
//!     if runtime.wait_for_termination().await.is_err() {
//!         runtime.force_shutdown();
//!     }
//!     runtime.shutdown().await;
//! }
//! ```

use crate::bridge::{BridgeStats, ExecutionBridge, ExecutionResult, Job};
use crate::callback::CallbackQueue;
use crate::config::RuntimeConfig;
use crate::error::{RuntimeError, RuntimeResult};
use crate::guest::{GuestInterpreter, GuestServices};
use crate::lua::LuaInterpreter;
use crate::net::NetworkCoordinator;
use crate::tasks::BackgroundTasks;
use crate::timers::TimerManager;
use crate::tracker::{ExecutionPhase, ExecutionTracker, OperationTally, SubsystemTally};
use crate::worker::run_interpreter;
use crossbeam_channel::{Sender, bounded};
use serde::Serialize;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

/// Builder for creating a [`Runtime`] with custom configuration
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    daemon: bool,
    tokio_handle: Handle,
}

impl Default for RuntimeBuilder {
    /// Captures the current tokio handle. Panics outside a tokio runtime;
    /// use [`RuntimeBuilder::tokio_handle`] to supply one explicitly.
    fn default() -> Self {
        Self {
            config: RuntimeConfig::default(),
            daemon: false,
            tokio_handle: Handle::current(),
        }
    }
}

impl RuntimeBuilder {
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Long-running server mode: the tracker never signals termination.
    pub fn daemon(mut self, daemon: bool) -> Self {
        self.daemon = daemon;
        self
    }

    /// Set the tokio handle timers and network tasks run on
    pub fn tokio_handle(mut self, handle: Handle) -> Self {
        self.tokio_handle = handle;
        self
    }

    /// Start a runtime with the Lua guest
    pub fn build(self) -> RuntimeResult<Runtime> {
        self.build_with(LuaInterpreter::new)
    }

    /// Start a runtime with any guest. `factory` runs on the interpreter
    /// thread, so the guest itself does not need to be `Send`.
    pub fn build_with<G, F>(self, factory: F) -> RuntimeResult<Runtime>
    where
        G: GuestInterpreter + 'static,
        F: FnOnce(&GuestServices) -> RuntimeResult<G> + Send + 'static,
    {
        Runtime::start(self, Box::new(factory))
    }
}

/// What [`Runtime::force_shutdown`] tore down
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    pub cancelled_timers: usize,
    pub aborted_tasks: usize,
    pub closed_handles: usize,
    pub dropped_callbacks: usize,
}

/// Guest execution runtime with a single interpreter thread
pub struct Runtime {
    job_tx: Sender<Job>,
    interpreter: Option<JoinHandle<()>>,
    bridge: ExecutionBridge,
    services: GuestServices,
    tasks: Arc<BackgroundTasks>,
    tracker: Arc<ExecutionTracker>,
    stats: Arc<BridgeStats>,
}

impl Runtime {
    /// Create a runtime with default configuration
    pub fn new() -> RuntimeResult<Self> {
        Self::builder().build()
    }

    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }

    fn start<G: GuestInterpreter + 'static>(
        builder: RuntimeBuilder,
        factory: crate::worker::GuestFactory<G>,
    ) -> RuntimeResult<Self> {
        let RuntimeBuilder {
            config,
            daemon,
            tokio_handle,
        } = builder;

        let queue = Arc::new(CallbackQueue::new());
        let tasks = Arc::new(BackgroundTasks::new(tokio_handle.clone()));
        let timers = Arc::new(TimerManager::new(queue.clone(), tokio_handle));
        let network = NetworkCoordinator::new(queue.clone(), tasks.clone(), config.network.clone())?;

        let tracker = Arc::new(ExecutionTracker::new(
            Arc::new(SubsystemTally {
                tasks: tasks.clone(),
                timers: timers.clone(),
                network: network.clone(),
                queue: queue.clone(),
            }),
            config.tracker.clone(),
        ));
        tracker.set_daemon(daemon);

        let services = GuestServices {
            timers,
            network,
            queue,
            config: config.clone(),
        };

        let (job_tx, job_rx) = bounded::<Job>(config.job_queue_capacity.max(1));
        let (ready_tx, ready_rx) = bounded(1);
        let stats = Arc::new(BridgeStats::new());

        let worker_services = services.clone();
        let worker_stats = stats.clone();
        let interpreter = std::thread::Builder::new()
            .name("hubscript-interpreter".to_string())
            .spawn(move || {
                run_interpreter(factory, worker_services, job_rx, worker_stats, ready_tx);
            })
            .map_err(|e| RuntimeError::Startup(format!("Failed to spawn interpreter: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = interpreter.join();
                return Err(e);
            }
            Err(_) => {
                let _ = interpreter.join();
                return Err(RuntimeError::Startup(
                    "Interpreter thread exited during startup".to_string(),
                ));
            }
        }

        let bridge = ExecutionBridge::new(
            job_tx.clone(),
            interpreter.thread().id(),
            stats.clone(),
            config.execution_timeout(),
        );

        info!(daemon, "Runtime started");
        Ok(Self {
            job_tx,
            interpreter: Some(interpreter),
            bridge,
            services,
            tasks,
            tracker,
            stats,
        })
    }

    /// A cloneable handle for submitting executions from other threads
    pub fn bridge(&self) -> ExecutionBridge {
        self.bridge.clone()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.services.config
    }

    pub fn stats(&self) -> &BridgeStats {
        &self.stats
    }

    pub fn tracker(&self) -> &Arc<ExecutionTracker> {
        &self.tracker
    }

    pub fn timers(&self) -> &TimerManager {
        &self.services.timers
    }

    pub fn network(&self) -> &NetworkCoordinator {
        &self.services.network
    }

    pub fn phase(&self) -> ExecutionPhase {
        self.tracker.phase()
    }

    /// Run `code` on the interpreter thread and wait up to `timeout`.
    pub async fn submit_execution(
        &self,
        code: impl Into<String>,
        timeout: Duration,
    ) -> RuntimeResult<ExecutionResult> {
        self.bridge.submit_async(code, Some(timeout)).await
    }

    /// Run pre-script fragments (`-e` snippets) in order.
    ///
    /// Every fragment runs even if an earlier one raised; the caller inspects
    /// the results. `main_pending` says whether a main script follows.
    pub async fn run_fragments(
        &self,
        fragments: &[String],
        main_pending: bool,
    ) -> RuntimeResult<Vec<ExecutionResult>> {
        self.tracker.start_fragments();
        let mut results = Vec::with_capacity(fragments.len());
        for (index, fragment) in fragments.iter().enumerate() {
            let result = self
                .bridge
                .submit_named_async(fragment.as_str(), Some(format!("=fragment {}", index + 1)), None)
                .await?;
            results.push(result);
        }
        self.tracker.complete_fragments(main_pending);
        Ok(results)
    }

    /// Run the main script. The tracker moves to `Tracking` afterwards
    /// whatever the outcome.
    ///
    /// Bounded by `main_timeout_ms`, not the per-submission default, so a
    /// long-running script is not cut off at `execution_timeout_ms`.
    pub async fn run_main(
        &self,
        source: impl Into<String>,
        name: &str,
    ) -> RuntimeResult<ExecutionResult> {
        self.tracker.start_main();
        let result = self
            .bridge
            .submit_named_async(
                source,
                Some(format!("@{name}")),
                Some(self.services.config.main_timeout()),
            )
            .await;
        self.tracker.complete_main();
        result
    }

    pub fn start_interactive(&self) {
        self.tracker.start_interactive();
    }

    pub fn set_daemon(&self, daemon: bool) {
        self.tracker.set_daemon(daemon);
    }

    /// Any outstanding timers, network work or queued callbacks.
    pub fn has_active_operations(&self) -> bool {
        !self.tally().is_idle()
    }

    pub fn tally(&self) -> OperationTally {
        self.tracker.tally()
    }

    /// Wait until the tracker signals termination, up to the configured
    /// shutdown timeout.
    pub async fn wait_for_termination(&self) -> RuntimeResult<()> {
        self.tracker
            .wait_for_termination(self.services.config.tracker.shutdown_timeout())
            .await
    }

    /// Tear down all outstanding work without waiting for it.
    ///
    /// The interpreter thread keeps running; call [`Runtime::shutdown`] to
    /// stop it.
    pub fn force_shutdown(&self) -> ShutdownReport {
        let report = ShutdownReport {
            cancelled_timers: self.services.timers.cancel_all(),
            aborted_tasks: self.tasks.abort_all(),
            closed_handles: self.services.network.close_all(),
            dropped_callbacks: self.services.queue.clear(),
        };
        if self.job_tx.try_send(Job::ReleaseClosures).is_err() {
            debug!("Interpreter busy or gone, closures not released");
        }
        warn!(
            cancelled_timers = report.cancelled_timers,
            aborted_tasks = report.aborted_tasks,
            closed_handles = report.closed_handles,
            dropped_callbacks = report.dropped_callbacks,
            "Forced shutdown, some operations may not have completed cleanly"
        );
        report
    }

    /// Stop the interpreter thread and wait for it to finish.
    pub async fn shutdown(mut self) {
        let Some(interpreter) = self.interpreter.take() else {
            return;
        };

        let job_tx = self.job_tx.clone();
        tokio::task::spawn_blocking(move || {
            let _ = job_tx.send(Job::Shutdown);
            let _ = interpreter.join();
        })
        .await
        .ok();

        self.services.timers.cancel_all();
        self.tasks.abort_all();
        self.services.network.close_all();
        self.services.queue.clear();
        info!("Runtime stopped");
    }

    pub fn is_running(&self) -> bool {
        self.interpreter
            .as_ref()
            .is_some_and(|interpreter| !interpreter.is_finished())
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if self.interpreter.take().is_some() {
            // Not joined: dropping must not block on a long execution
            let _ = self.job_tx.try_send(Job::Shutdown);
            self.services.timers.cancel_all();
            self.tasks.abort_all();
        }
    }
}
