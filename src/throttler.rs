//! Bounded task throttler.
//!
//! A single background worker pulls boxed tasks off a bounded FIFO and runs
//! them to completion one at a time, sleeping a fixed gap between each
//! task's completion and the next one's start. Used to keep outbound PCI
//! writes and MQTT status-resync requests from overwhelming a slow CNI.
//! Grounded on `original_source/cbus/toolkit/periodic.py`'s `Periodic` class.

use std::future::Future;
use std::pin::Pin;

use tokio::sync::mpsc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub const DEFAULT_QUEUE_SIZE: usize = 1000;
pub const MIN_SPACING: Duration = Duration::from_millis(200);

pub type Task = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Handle used to enqueue work; cheap to clone and share across tasks.
#[derive(Clone)]
pub struct ThrottlerHandle {
    sender: mpsc::Sender<Task>,
}

impl ThrottlerHandle {
    /// Enqueues a task without blocking. If the queue is full the task is
    /// dropped and a warning is logged; the throttler never applies
    /// backpressure to its callers. Outbound PCI calls are `async fn`s, so
    /// tasks are futures rather than plain closures. Returns whether the
    /// task was accepted, so callers that need to distinguish "queued" from
    /// "dropped" (e.g. the status-resync loop's retry-after-30s rule) can.
    pub fn enqueue<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.sender.try_send(Box::pin(task)).is_err() {
            warn!("throttler queue full or shut down, dropping task");
            false
        } else {
            true
        }
    }
}

/// Spawns the throttler's worker loop and returns a handle to it. The
/// worker drains any queued tasks (logging how many were discarded) as soon
/// as `shutdown` is cancelled rather than running them.
pub fn spawn(shutdown: CancellationToken) -> ThrottlerHandle {
    let (tx, rx) = mpsc::channel(DEFAULT_QUEUE_SIZE);
    tokio::spawn(worker_loop(rx, shutdown));
    ThrottlerHandle { sender: tx }
}

async fn worker_loop(mut rx: mpsc::Receiver<Task>, shutdown: CancellationToken) {
    loop {
        let task = tokio::select! {
            _ = shutdown.cancelled() => break,
            task = rx.recv() => task,
        };
        let Some(task) = task else { break };
        task.await;
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(MIN_SPACING) => {}
        }
    }

    let mut drained = 0usize;
    while rx.try_recv().is_ok() {
        drained += 1;
    }
    if drained > 0 {
        warn!(drained, "dropped queued tasks on throttler shutdown");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    #[tokio::test]
    async fn tasks_run_with_minimum_spacing() {
        let shutdown = CancellationToken::new();
        let handle = spawn(shutdown.clone());
        let timestamps = Arc::new(std::sync::Mutex::new(Vec::new()));

        for _ in 0..3 {
            let timestamps = timestamps.clone();
            handle.enqueue(async move {
                timestamps.lock().unwrap().push(Instant::now());
            });
        }

        tokio::time::sleep(Duration::from_millis(700)).await;
        shutdown.cancel();

        let stamps = timestamps.lock().unwrap();
        assert_eq!(stamps.len(), 3);
        for pair in stamps.windows(2) {
            assert!(pair[1].duration_since(pair[0]) >= MIN_SPACING);
        }
    }

    #[tokio::test]
    async fn full_queue_drops_tasks_without_blocking_the_caller() {
        let shutdown = CancellationToken::new();
        let (tx, _rx) = mpsc::channel::<Task>(1);
        let handle = ThrottlerHandle { sender: tx };
        // Fill the single slot, then a second enqueue must not panic or
        // block even though nothing is consuming it.
        let counter = Arc::new(AtomicUsize::new(0));
        let c1 = counter.clone();
        assert!(handle.enqueue(async move {
            c1.fetch_add(1, Ordering::SeqCst);
        }));
        let c2 = counter.clone();
        assert!(!handle.enqueue(async move {
            c2.fetch_add(1, Ordering::SeqCst);
        }));
        let _ = shutdown;
    }
}
