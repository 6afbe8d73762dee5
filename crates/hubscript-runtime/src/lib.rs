//! hubscript-runtime - execution core for an embedded Lua guest.
//!
//! Guest code runs on exactly one thread. Timers, network I/O and requests
//! from other threads never touch the interpreter; they queue work for it.
//!
//! # Features
//!
//! - **Timers**: `setTimeout` / `setInterval` backed by tokio tasks
//! - **Callback dispatch**: thread-safe ready queue, single consumer
//! - **Cross-thread execution**: submit source from any thread with a timeout
//! - **Network operations**: TCP, UDP and HTTP with completion callbacks
//! - **Termination tracking**: debounced "all work finished" detection
//!
//! # Architecture
//!
//! ```text
//!  other threads / tasks                     tokio runtime
//! ┌──────────────────────┐        ┌─────────────────────────────────┐
//! │   ExecutionBridge    │        │ TimerManager  NetworkCoordinator │
//! └──────────┬───────────┘        └────────────────┬────────────────┘
//!            │ job channel                         │ enqueue
//!            ↓                                     ↓
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                 interpreter thread (worker)                      │
//! │   Select { jobs, queue wake }  →  execute  →  drain_and_dispatch │
//! │                        LuaInterpreter                            │
//! └─────────────────────────────────────────────────────────────────┘
//!                              ↑ tally
//!                     ExecutionTracker (watchdog)
//! ```
//!
//! # Example
//!
//! ```no_run
//! use hubscript_runtime::Runtime;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let runtime = Runtime::new().unwrap();
//!     let result = runtime
//!         .submit_execution("return 1+1", Duration::from_secs(5))
//!         .await
//!         .unwrap();
//!     println!("{}", serde_json::to_string(&result).unwrap());
//!     runtime.shutdown().await;
//! }
//! ```

pub mod bridge;
pub mod callback;
pub mod config;
pub mod error;
pub mod guest;
pub mod lua;
pub mod net;
pub mod runtime;
pub mod tasks;
pub mod timers;
pub mod tracker;

mod worker;

pub use bridge::{BridgeStats, BridgeStatsSnapshot, ExecutionBridge, ExecutionRequest, ExecutionResult};
pub use callback::{
    CallbackData, CallbackQueue, CallbackResult, CallbackTarget, ClosureTable, DispatchStats,
    Dispatcher, PendingCallback,
};
pub use config::{NetworkConfig, RuntimeConfig, TrackerConfig};
pub use error::{GuestError, NetError, RuntimeError, RuntimeResult};
pub use guest::{GuestInterpreter, GuestServices, Invocation};
pub use lua::LuaInterpreter;
pub use net::{HttpRequest, NetworkCoordinator};
pub use runtime::{Runtime, RuntimeBuilder, ShutdownReport};
pub use tasks::BackgroundTasks;
pub use timers::{TimerId, TimerManager};
pub use tracker::{ExecutionPhase, ExecutionTracker, OperationTally, SubsystemTally, TallySource};

/// Prelude for common imports
pub mod prelude {
    pub use crate::bridge::{ExecutionBridge, ExecutionResult};
    pub use crate::config::RuntimeConfig;
    pub use crate::error::{RuntimeError, RuntimeResult};
    pub use crate::runtime::{Runtime, RuntimeBuilder};
    pub use crate::tracker::ExecutionPhase;
}
