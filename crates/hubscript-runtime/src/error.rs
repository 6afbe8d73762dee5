//! Error types for hubscript-runtime

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Guest code raised while executing.
///
/// Carries the interpreter's rendered message (including location and
/// traceback when the interpreter provides one).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct GuestError {
    pub message: String,
}

impl GuestError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<mlua::Error> for GuestError {
    fn from(e: mlua::Error) -> Self {
        Self::new(e.to_string())
    }
}

/// Failures of network operations
#[derive(Error, Debug)]
pub enum NetError {
    /// The connection, listener or socket id is not (or no longer) open
    #[error("Unknown network handle {0}")]
    UnknownHandle(u64),

    /// The peer went away; the connection has been removed from the live set
    #[error("Connection lost: {0}")]
    Connection(#[source] io::Error),

    /// The handle was closed while the operation was pending
    #[error("Network handle {0} closed")]
    Closed(u64),

    /// Any other I/O failure; the handle stays open
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Address could not be resolved
    #[error("Invalid address: {0}")]
    Address(String),

    /// Request the network layer cannot express (bad method, bad header)
    #[error("Unsupported request: {0}")]
    Unsupported(String),

    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl NetError {
    /// Whether this failure came from the handle leaving the live set.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Closed(_))
    }
}

/// Returns true for I/O conditions that mean "nothing yet", not "broken".
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

/// Errors that can occur during runtime operations
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Guest code raised
    #[error(transparent)]
    Guest(#[from] GuestError),

    /// A submitted execution did not finish in time. The execution itself
    /// keeps running on the interpreter thread; its result is discarded.
    #[error("Execution request {request_id} timed out after {}ms", .timeout.as_millis())]
    ExecutionTimeout { request_id: u64, timeout: Duration },

    /// Outstanding work did not settle before the shutdown deadline
    #[error("Operations still pending after {}ms shutdown timeout", .0.as_millis())]
    ShutdownTimeout(Duration),

    /// Timer delays must be non-negative
    #[error("Invalid timer delay {0}ms: delay must be >= 0")]
    InvalidDelay(i64),

    /// A bridge submission was made from the interpreter's own thread
    #[error("Cannot submit execution from the interpreter thread")]
    Reentrant,

    /// Guest dispatch attempted off the owning thread
    #[error("Guest code may only run on the interpreter thread")]
    WrongThread,

    /// The runtime has been shut down
    #[error("Runtime shut down")]
    ShutDown,

    /// The interpreter thread failed to start
    #[error("Runtime startup failed: {0}")]
    Startup(String),

    /// Lua binding error outside of guest execution. Kept as the rendered
    /// message: `mlua::Error` is not `Send` without mlua's `send` feature.
    #[error("Lua error: {0}")]
    Lua(String),

    /// Network operation error
    #[error(transparent)]
    Net(#[from] NetError),
}

impl RuntimeError {
    /// Create a guest error from a message
    pub fn guest(message: impl Into<String>) -> Self {
        Self::Guest(GuestError::new(message))
    }
}

impl From<mlua::Error> for RuntimeError {
    fn from(e: mlua::Error) -> Self {
        Self::Lua(e.to_string())
    }
}

/// Result type alias for runtime operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;
