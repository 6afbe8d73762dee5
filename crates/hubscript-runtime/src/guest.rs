//! Seam between the execution core and the embedded language.
//!
//! The core never touches an interpreter directly: it hands requests and
//! ready callbacks to a [`GuestInterpreter`] living on the interpreter thread.
//! [`crate::lua::LuaInterpreter`] is the production implementation.

use crate::bridge::ExecutionRequest;
use crate::callback::{CallbackQueue, PendingCallback};
use crate::config::RuntimeConfig;
use crate::error::GuestError;
use crate::net::NetworkCoordinator;
use crate::timers::TimerManager;
use std::sync::Arc;

/// Outcome of handing a callback to the guest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invocation {
    /// The closure ran (successfully)
    Invoked,
    /// No closure is registered for the target (cancelled or already used)
    Skipped,
}

/// An embedded interpreter driven by the interpreter thread.
///
/// Implementations are not required to be `Send`: they are created on the
/// interpreter thread and never leave it.
pub trait GuestInterpreter {
    /// Run a chunk of guest source and convert its result to JSON.
    fn execute(&mut self, request: &ExecutionRequest) -> Result<serde_json::Value, GuestError>;

    /// Invoke the closure registered for a ready callback.
    fn invoke(&mut self, callback: PendingCallback) -> Result<Invocation, GuestError>;

    /// Drop every registered closure. Called on forced shutdown.
    fn release_all(&mut self) {}
}

/// Shared subsystems a guest needs to implement the guest-facing API.
#[derive(Clone)]
pub struct GuestServices {
    pub timers: Arc<TimerManager>,
    pub network: NetworkCoordinator,
    pub queue: Arc<CallbackQueue>,
    pub config: RuntimeConfig,
}
