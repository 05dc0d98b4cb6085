//! Reload coalescing.
//!
//! A debouncer holds at most one pending invocation. Scheduling a new task
//! cancels the previous one, so a burst of N calls within the interval runs
//! exactly once, with the most recently supplied task.

use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

struct Pending {
    task: JoinHandle<()>,
    done: broadcast::Receiver<()>,
}

/// Coalesces bursts of calls into a single delayed invocation.
pub struct Debouncer {
    interval: Duration,
    slot: Mutex<Option<Pending>>,
}

impl Debouncer {
    /// Creates a debouncer with a fixed delay interval.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            slot: Mutex::new(None),
        }
    }

    /// Schedules `task` to run once after the interval, cancelling any
    /// previously scheduled invocation.
    pub fn call<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut slot = self.slot.lock();
        if let Some(prev) = slot.take() {
            prev.task.abort();
        }

        let (tx, rx) = broadcast::channel(1);
        let interval = self.interval;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            task.await;
            let _ = tx.send(());
        });

        *slot = Some(Pending {
            task: handle,
            done: rx,
        });
    }

    /// Blocks until the currently scheduled invocation fires, or returns
    /// immediately when nothing is pending. A waiter whose invocation is
    /// superseded by a newer call is released as well.
    pub async fn wait(&self) {
        let rx = self.slot.lock().as_ref().map(|p| p.done.resubscribe());
        if let Some(mut rx) = rx {
            let _ = rx.recv().await;
        }
    }
}
