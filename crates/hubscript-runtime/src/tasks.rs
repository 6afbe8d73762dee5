//! Registry of background tasks spawned on behalf of the guest.
//!
//! Feeds the "live background tasks" part of the operation tally and gives
//! forced shutdown a handle on everything still running.

use parking_lot::Mutex;
use std::future::Future;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::debug;

pub struct BackgroundTasks {
    handle: Handle,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BackgroundTasks {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn a task on the host runtime and track it.
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let task = self.handle.spawn(fut);
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    /// Number of tasks that have not finished yet.
    pub fn live_count(&self) -> usize {
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.len()
    }

    /// Abort every tracked task. Returns how many were still running.
    pub fn abort_all(&self) -> usize {
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        let mut aborted = 0;
        for task in tasks {
            if !task.is_finished() {
                task.abort();
                aborted += 1;
            }
        }
        if aborted > 0 {
            debug!(aborted, "Aborted background tasks");
        }
        aborted
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_live_count_drops_when_finished() {
        let tasks = BackgroundTasks::new(Handle::current());
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        tasks.spawn(async move {
            let _ = rx.await;
        });
        assert_eq!(tasks.live_count(), 1);

        tx.send(()).unwrap();
        for _ in 0..50 {
            if tasks.live_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(tasks.live_count(), 0);
    }

    #[tokio::test]
    async fn test_abort_all() {
        let tasks = BackgroundTasks::new(Handle::current());
        tasks.spawn(std::future::pending());
        tasks.spawn(std::future::pending());

        assert_eq!(tasks.abort_all(), 2);
        assert_eq!(tasks.live_count(), 0);
    }
}
