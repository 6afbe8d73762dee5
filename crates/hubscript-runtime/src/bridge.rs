//! Cross-thread execution bridge.
//!
//! Any thread or task may hand guest source to the interpreter thread through
//! an [`ExecutionBridge`] and wait for the result. Submissions travel over a
//! single bounded job channel with one consumer, so they run strictly one at
//! a time and never interleave with callback dispatch.
//!
//! # Example
//!
//! ```no_run
//! use hubscript_runtime::Runtime;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let runtime = Runtime::builder().build().unwrap();
//!     let bridge = runtime.bridge();
//!
//!     let result = bridge
//!         .submit_async("return 1 + 1", Some(Duration::from_secs(5)))
//!         .await
//!         .unwrap();
//!     assert!(result.success);
//!     assert_eq!(result.result, Some(serde_json::json!(2)));
//!
//!     runtime.shutdown().await;
//! }
//! ```

use crate::error::{GuestError, RuntimeError, RuntimeResult};
use crossbeam_channel::{SendTimeoutError, Sender, TrySendError, bounded};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::ThreadId;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Chunk name used for submissions that do not name themselves
pub const SUBMIT_CHUNK_NAME: &str = "=submit";

/// Backoff while an async submitter waits for room in the job channel
const ASYNC_SEND_BACKOFF: Duration = Duration::from_millis(1);

/// One unit of guest source handed to the interpreter thread.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// Correlation id, unique per bridge
    pub id: u64,
    pub source: String,
    /// Name shown in guest error messages and tracebacks
    pub chunk_name: String,
    pub timeout: Duration,
    pub submitted_at: Instant,
}

impl ExecutionRequest {
    pub fn new(id: u64, source: impl Into<String>, timeout: Duration) -> Self {
        Self {
            id,
            source: source.into(),
            chunk_name: SUBMIT_CHUNK_NAME.to_string(),
            timeout,
            submitted_at: Instant::now(),
        }
    }

    pub fn with_chunk_name(mut self, name: impl Into<String>) -> Self {
        self.chunk_name = name.into();
        self
    }
}

/// What the caller of a submission gets back.
///
/// Serializes as `{ success, result, error, elapsed_ms }`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Time spent executing on the interpreter thread
    pub elapsed_ms: u64,
}

impl ExecutionResult {
    pub fn from_outcome(outcome: Result<serde_json::Value, GuestError>, elapsed: Duration) -> Self {
        let elapsed_ms = elapsed.as_millis() as u64;
        match outcome {
            Ok(value) => Self {
                success: true,
                result: Some(value),
                error: None,
                elapsed_ms,
            },
            Err(GuestError { message }) => Self {
                success: false,
                result: None,
                error: Some(message),
                elapsed_ms,
            },
        }
    }
}

/// Where the interpreter thread sends a finished result.
pub(crate) enum Reply {
    Blocking(Sender<ExecutionResult>),
    Async(oneshot::Sender<ExecutionResult>),
}

impl Reply {
    /// Deliver the result. False if the caller already gave up.
    pub(crate) fn send(self, result: ExecutionResult) -> bool {
        match self {
            Self::Blocking(tx) => tx.send(result).is_ok(),
            Self::Async(tx) => tx.send(result).is_ok(),
        }
    }
}

/// Work for the interpreter thread
pub(crate) enum Job {
    Execute {
        request: ExecutionRequest,
        reply: Reply,
    },
    /// Drop every registered guest closure
    ReleaseClosures,
    Shutdown,
}

/// Statistics about bridge traffic
///
/// All counters are atomic and can be read at any time without locking.
#[derive(Debug, Default)]
pub struct BridgeStats {
    /// Submissions accepted by the bridge
    pub submitted: AtomicU64,
    /// Submissions the interpreter finished (successfully or not)
    pub completed: AtomicU64,
    /// Completed submissions whose guest code raised
    pub failed: AtomicU64,
    /// Submissions whose caller stopped waiting
    pub timed_out: AtomicU64,
}

impl BridgeStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> BridgeStatsSnapshot {
        BridgeStatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
        }
    }

    /// Submissions not yet finished by the interpreter
    pub fn in_flight(&self) -> u64 {
        let submitted = self.submitted.load(Ordering::Relaxed);
        let completed = self.completed.load(Ordering::Relaxed);
        submitted.saturating_sub(completed)
    }

    pub(crate) fn record(&self, result: &ExecutionResult) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        if !result.success {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// A point-in-time snapshot of bridge statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BridgeStatsSnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
}

/// Thread-safe handle for submitting guest source to the interpreter thread.
///
/// `Send + Sync + Clone`; clone it freely into request handlers.
#[derive(Clone)]
pub struct ExecutionBridge {
    job_tx: Sender<Job>,
    owner: ThreadId,
    stats: Arc<BridgeStats>,
    next_request_id: Arc<AtomicU64>,
    default_timeout: Duration,
}

impl ExecutionBridge {
    pub(crate) fn new(
        job_tx: Sender<Job>,
        owner: ThreadId,
        stats: Arc<BridgeStats>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            job_tx,
            owner,
            stats,
            next_request_id: Arc::new(AtomicU64::new(1)),
            default_timeout,
        }
    }

    fn prepare(
        &self,
        code: String,
        chunk_name: Option<String>,
        timeout: Option<Duration>,
    ) -> RuntimeResult<ExecutionRequest> {
        if std::thread::current().id() == self.owner {
            return Err(RuntimeError::Reentrant);
        }
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let timeout = timeout.unwrap_or(self.default_timeout);
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        debug!(request = id, timeout_ms = timeout.as_millis() as u64, "Execution submitted");

        let request = ExecutionRequest::new(id, code, timeout);
        Ok(match chunk_name {
            Some(name) => request.with_chunk_name(name),
            None => request,
        })
    }

    fn timed_out(&self, request_id: u64, timeout: Duration) -> RuntimeError {
        self.stats.timed_out.fetch_add(1, Ordering::Relaxed);
        warn!(
            request = request_id,
            timeout_ms = timeout.as_millis() as u64,
            "Execution timed out, result will be discarded"
        );
        RuntimeError::ExecutionTimeout {
            request_id,
            timeout,
        }
    }

    /// Run `code` on the interpreter thread, blocking the calling thread.
    ///
    /// `None` uses the configured default timeout. Guest failures come back
    /// as an unsuccessful [`ExecutionResult`]; only bridge-level failures
    /// (timeout, shutdown, reentrancy) are errors.
    pub fn submit(
        &self,
        code: impl Into<String>,
        timeout: Option<Duration>,
    ) -> RuntimeResult<ExecutionResult> {
        let request = self.prepare(code.into(), None, timeout)?;
        let (id, timeout) = (request.id, request.timeout);
        // Timeouts too large to form an instant (Duration::MAX) mean no deadline
        let deadline = request.submitted_at.checked_add(timeout);
        let (tx, rx) = bounded(1);

        let job = Job::Execute {
            request,
            reply: Reply::Blocking(tx),
        };
        let sent = match deadline {
            Some(deadline) => self.job_tx.send_deadline(job, deadline),
            None => self
                .job_tx
                .send(job)
                .map_err(|e| SendTimeoutError::Disconnected(e.into_inner())),
        };
        match sent {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(_)) => return Err(self.timed_out(id, timeout)),
            Err(SendTimeoutError::Disconnected(_)) => return Err(RuntimeError::ShutDown),
        }

        match deadline {
            Some(deadline) => rx.recv_deadline(deadline).map_err(|e| {
                if e.is_timeout() {
                    self.timed_out(id, timeout)
                } else {
                    RuntimeError::ShutDown
                }
            }),
            None => rx.recv().map_err(|_| RuntimeError::ShutDown),
        }
    }

    /// Async variant of [`Self::submit`] for callers on a tokio runtime.
    pub async fn submit_async(
        &self,
        code: impl Into<String>,
        timeout: Option<Duration>,
    ) -> RuntimeResult<ExecutionResult> {
        self.submit_named_async(code, None, timeout).await
    }

    /// [`Self::submit_async`] with a chunk name for error messages, such as
    /// a script path.
    pub async fn submit_named_async(
        &self,
        code: impl Into<String>,
        chunk_name: Option<String>,
        timeout: Option<Duration>,
    ) -> RuntimeResult<ExecutionResult> {
        let request = self.prepare(code.into(), chunk_name, timeout)?;
        let (id, timeout) = (request.id, request.timeout);
        let (tx, rx) = oneshot::channel();

        let wait = async {
            let mut job = Job::Execute {
                request,
                reply: Reply::Async(tx),
            };
            loop {
                match self.job_tx.try_send(job) {
                    Ok(()) => break,
                    Err(TrySendError::Full(back)) => {
                        job = back;
                        tokio::time::sleep(ASYNC_SEND_BACKOFF).await;
                    }
                    Err(TrySendError::Disconnected(_)) => return Err(RuntimeError::ShutDown),
                }
            }
            rx.await.map_err(|_| RuntimeError::ShutDown)
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(self.timed_out(id, timeout)),
        }
    }

    pub fn stats(&self) -> &BridgeStats {
        &self.stats
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// The interpreter thread this bridge feeds
    pub fn owner(&self) -> ThreadId {
        self.owner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::Receiver;
    use serde_json::json;

    /// Minimal interpreter thread: answers every request with its source
    /// length, optionally holding on to requests instead of answering.
    fn fake_owner(stall: bool) -> (ExecutionBridge, std::thread::JoinHandle<()>) {
        let (job_tx, job_rx): (Sender<Job>, Receiver<Job>) = bounded(4);
        let stats = Arc::new(BridgeStats::new());
        let worker_stats = stats.clone();

        let handle = std::thread::spawn(move || {
            let mut held = Vec::new();
            while let Ok(job) = job_rx.recv() {
                match job {
                    Job::Execute { request, reply } if stall => held.push((request, reply)),
                    Job::Execute { request, reply } => {
                        let result = ExecutionResult::from_outcome(
                            Ok(json!(request.source.len())),
                            request.submitted_at.elapsed(),
                        );
                        worker_stats.record(&result);
                        reply.send(result);
                    }
                    Job::ReleaseClosures => {}
                    Job::Shutdown => break,
                }
            }
        });

        let owner = handle.thread().id();
        let bridge = ExecutionBridge::new(job_tx, owner, stats, Duration::from_secs(5));
        (bridge, handle)
    }

    fn shutdown(bridge: &ExecutionBridge, handle: std::thread::JoinHandle<()>) {
        let _ = bridge.job_tx.send(Job::Shutdown);
        handle.join().unwrap();
    }

    #[test]
    fn test_bridge_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}
        fn assert_clone<T: Clone>() {}

        assert_send::<ExecutionBridge>();
        assert_sync::<ExecutionBridge>();
        assert_clone::<ExecutionBridge>();
    }

    #[test]
    fn test_unbounded_timeout_means_no_deadline() {
        let (bridge, handle) = fake_owner(false);
        let result = bridge.submit("return 1", Some(Duration::MAX)).unwrap();
        assert!(result.success);
        assert_eq!(result.result, Some(json!(8)));
        shutdown(&bridge, handle);
    }

    #[tokio::test]
    async fn test_unbounded_timeout_async() {
        let (bridge, handle) = fake_owner(false);
        let result = bridge
            .submit_async("return 1", Some(Duration::MAX))
            .await
            .unwrap();
        assert!(result.success);
        shutdown(&bridge, handle);
    }

    #[test]
    fn test_results_cross_threads() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<RuntimeError>();
        assert_sync::<RuntimeError>();
        assert_send::<RuntimeResult<ExecutionResult>>();
    }

    #[test]
    fn test_blocking_submit() {
        let (bridge, handle) = fake_owner(false);
        let result = bridge.submit("abc", None).unwrap();
        assert!(result.success);
        assert_eq!(result.result, Some(json!(3)));

        let stats = bridge.stats().snapshot();
        assert_eq!(stats.submitted, 1);
        assert_eq!(stats.completed, 1);
        shutdown(&bridge, handle);
    }

    #[tokio::test]
    async fn test_async_submit() {
        let (bridge, handle) = fake_owner(false);
        let result = bridge.submit_async("abcd", None).await.unwrap();
        assert_eq!(result.result, Some(json!(4)));
        shutdown(&bridge, handle);
    }

    #[test]
    fn test_blocking_timeout() {
        let (bridge, handle) = fake_owner(true);
        let err = bridge
            .submit("slow", Some(Duration::from_millis(20)))
            .unwrap_err();
        assert!(matches!(err, RuntimeError::ExecutionTimeout { request_id: 1, .. }));
        assert_eq!(bridge.stats().snapshot().timed_out, 1);
        shutdown(&bridge, handle);
    }

    #[tokio::test]
    async fn test_async_timeout() {
        let (bridge, handle) = fake_owner(true);
        let err = bridge
            .submit_async("slow", Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::ExecutionTimeout { .. }));
        assert_eq!(bridge.stats().in_flight(), 1);
        shutdown(&bridge, handle);
    }

    #[test]
    fn test_submit_from_owner_thread_is_refused() {
        let (job_tx, _job_rx) = bounded(1);
        let bridge = ExecutionBridge::new(
            job_tx,
            std::thread::current().id(),
            Arc::new(BridgeStats::new()),
            Duration::from_secs(1),
        );
        assert!(matches!(
            bridge.submit("return 1", None),
            Err(RuntimeError::Reentrant)
        ));
        assert_eq!(bridge.stats().snapshot().submitted, 0);
    }

    #[test]
    fn test_submit_after_shutdown() {
        let (bridge, handle) = fake_owner(false);
        shutdown(&bridge, handle);
        assert!(matches!(
            bridge.submit("return 1", None),
            Err(RuntimeError::ShutDown)
        ));
    }

    #[test]
    fn test_result_serialization() {
        let ok = ExecutionResult::from_outcome(Ok(json!(2)), Duration::from_millis(3));
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({ "success": true, "result": 2, "elapsed_ms": 3 })
        );

        let failed =
            ExecutionResult::from_outcome(Err(GuestError::new("boom")), Duration::ZERO);
        assert_eq!(
            serde_json::to_value(&failed).unwrap(),
            json!({ "success": false, "error": "boom", "elapsed_ms": 0 })
        );
    }
}
