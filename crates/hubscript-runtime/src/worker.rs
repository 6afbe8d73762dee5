//! The interpreter thread.
//!
//! This is the only thread that ever enters guest code. It waits on two
//! channels at once with crossbeam `Select`: the bridge's job channel and the
//! callback queue's wake signal. After every job or wake-up it drains the
//! callback queue, so a backlog that built up during a long execution is
//! dispatched right after that execution returns.

use crate::bridge::{BridgeStats, ExecutionRequest, ExecutionResult, Job};
use crate::callback::Dispatcher;
use crate::error::{GuestError, RuntimeError, RuntimeResult};
use crate::guest::{GuestInterpreter, GuestServices};
use crossbeam_channel::{Receiver, Select, Sender};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info_span, trace, warn};

/// Builds the guest on the interpreter thread
pub(crate) type GuestFactory<G> = Box<dyn FnOnce(&GuestServices) -> RuntimeResult<G> + Send>;

/// Run the interpreter loop until shutdown.
///
/// Reports startup success or failure through `ready` before processing any
/// job.
pub(crate) fn run_interpreter<G: GuestInterpreter>(
    factory: GuestFactory<G>,
    services: GuestServices,
    job_rx: Receiver<Job>,
    stats: Arc<BridgeStats>,
    ready: Sender<RuntimeResult<()>>,
) {
    let thread_name = std::thread::current()
        .name()
        .unwrap_or("hubscript-interpreter")
        .to_string();

    let _span = info_span!("interpreter", name = %thread_name).entered();
    debug!("Interpreter starting");

    let dispatcher = Dispatcher::for_current_thread(services.queue.clone());
    let mut guest = match factory(&services) {
        Ok(guest) => guest,
        Err(e) => {
            error!(error = %e, "Failed to create guest interpreter");
            let _ = ready.send(Err(RuntimeError::Startup(e.to_string())));
            return;
        }
    };

    if ready.send(Ok(())).is_err() {
        debug!("Runtime dropped before startup completed");
        return;
    }
    debug!("Interpreter initialized");

    let wake_rx = services.queue.wake_receiver();
    loop {
        let mut sel = Select::new();
        let job_idx = sel.recv(&job_rx);
        sel.recv(wake_rx);

        let op = sel.select();
        if op.index() == job_idx {
            match op.recv(&job_rx) {
                Ok(Job::Execute { request, reply }) => {
                    let result = execute_request(&mut guest, &request);
                    stats.record(&result);
                    if !reply.send(result) {
                        debug!(request = request.id, "Caller gone, result discarded");
                    }
                }
                Ok(Job::ReleaseClosures) => {
                    guest.release_all();
                    debug!("Guest closures released");
                }
                Ok(Job::Shutdown) => {
                    debug!("Shutdown requested");
                    break;
                }
                Err(_) => {
                    debug!("Job channel disconnected");
                    break;
                }
            }
        } else {
            let _ = op.recv(wake_rx);
        }

        dispatch_ready(&dispatcher, &mut guest);
    }

    guest.release_all();
    debug!("Interpreter stopped");
}

/// Execute one submission, converting panics into guest failures.
fn execute_request<G: GuestInterpreter>(guest: &mut G, request: &ExecutionRequest) -> ExecutionResult {
    trace!(request = request.id, chunk = %request.chunk_name, "Executing");
    let started = Instant::now();

    let outcome = match catch_unwind(AssertUnwindSafe(|| guest.execute(request))) {
        Ok(outcome) => outcome,
        Err(panic) => {
            let message = if let Some(s) = panic.downcast_ref::<&str>() {
                format!("Interpreter panic: {s}")
            } else if let Some(s) = panic.downcast_ref::<String>() {
                format!("Interpreter panic: {s}")
            } else {
                "Interpreter panic: unknown error".to_string()
            };
            error!(request = request.id, "{message}");
            Err(GuestError::new(message))
        }
    };

    if let Err(e) = &outcome {
        debug!(request = request.id, error = %e, "Execution raised");
    }
    ExecutionResult::from_outcome(outcome, started.elapsed())
}

fn dispatch_ready<G: GuestInterpreter>(dispatcher: &Dispatcher, guest: &mut G) {
    match dispatcher.drain_and_dispatch(guest) {
        Ok(stats) if stats.total() > 0 => {
            trace!(
                invoked = stats.invoked,
                skipped = stats.skipped,
                failed = stats.failed,
                "Dispatch pass finished"
            );
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "Dispatch pass refused"),
    }
}
