//! Background worker for periodic and on-demand maintenance tasks.
//!
//! Provides a generic `BackgroundWorker<R>` that processes tasks from an mpsc channel
//! via a `BackgroundRunnable` implementation, with a periodic tick callback. The
//! in-memory cache sweeper is the production runnable.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

// ---------------------------------------------------------------------------
// BackgroundRunnable trait
// ---------------------------------------------------------------------------

/// Trait for task handlers executed by `BackgroundWorker`.
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    /// The type of task this runnable processes.
    type Task: Send + 'static;

    /// Process a single submitted task.
    async fn run(&mut self, task: Self::Task);

    /// Called on each tick interval. Default is a no-op.
    async fn on_tick(&mut self) {}

    /// Called once when the worker stops. Default is a no-op.
    async fn shutdown(&mut self) {}
}

// ---------------------------------------------------------------------------
// BackgroundWorker
// ---------------------------------------------------------------------------

/// Generic background worker fed by an mpsc channel.
///
/// The spawned loop runs submitted tasks, calls `on_tick` every interval, and
/// exits when `stop` is called, the channel closes, or the parent
/// cancellation token fires.
pub struct BackgroundWorker<R: BackgroundRunnable> {
    tx: Option<mpsc::Sender<R::Task>>,
    cancel: CancellationToken,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Start the worker. Channel capacity is fixed at 64.
    ///
    /// The worker stops when `parent` is cancelled.
    pub fn start(mut runnable: R, tick: Duration, parent: &CancellationToken) -> Self {
        let (tx, mut rx) = mpsc::channel::<R::Task>(64);
        let cancel = parent.child_token();
        let stopped = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            // The first tick completes immediately.
            interval.tick().await;

            loop {
                tokio::select! {
                    () = stopped.cancelled() => break,
                    task = rx.recv() => match task {
                        Some(t) => runnable.run(t).await,
                        None => break,
                    },
                    _ = interval.tick() => runnable.on_tick().await,
                }
            }

            runnable.shutdown().await;
            debug!("background worker stopped");
        });

        Self {
            tx: Some(tx),
            cancel,
            handle: Some(handle),
        }
    }

    /// Submit a task to the worker.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker has been stopped.
    pub async fn submit(&self, task: R::Task) -> anyhow::Result<()> {
        match &self.tx {
            Some(tx) => tx
                .send(task)
                .await
                .map_err(|_| anyhow::anyhow!("worker channel closed")),
            None => Err(anyhow::anyhow!("worker not running")),
        }
    }

    /// Stop the worker and wait for its loop to finish.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    #[derive(Default, Clone)]
    struct Counters {
        runs: Arc<AtomicU32>,
        ticks: Arc<AtomicU32>,
        shutdowns: Arc<AtomicU32>,
    }

    struct CountingRunnable(Counters);

    #[async_trait]
    impl BackgroundRunnable for CountingRunnable {
        type Task = u32;

        async fn run(&mut self, _task: u32) {
            self.0.runs.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_tick(&mut self) {
            self.0.ticks.fetch_add(1, Ordering::SeqCst);
        }

        async fn shutdown(&mut self) {
            self.0.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn runs_submitted_tasks_then_stops() {
        let counters = Counters::default();
        let root = CancellationToken::new();
        let mut worker =
            BackgroundWorker::start(CountingRunnable(counters.clone()), Duration::from_secs(60), &root);

        for task in 0..3 {
            worker.submit(task).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counters.runs.load(Ordering::SeqCst), 3);

        worker.stop().await;
        assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 1);
        assert!(worker.submit(4).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_on_interval() {
        let counters = Counters::default();
        let root = CancellationToken::new();
        let mut worker =
            BackgroundWorker::start(CountingRunnable(counters.clone()), Duration::from_millis(20), &root);

        tokio::time::sleep(Duration::from_millis(105)).await;
        worker.stop().await;

        assert!(counters.ticks.load(Ordering::SeqCst) >= 4);
    }

    #[tokio::test]
    async fn parent_cancellation_stops_worker() {
        let counters = Counters::default();
        let root = CancellationToken::new();
        let mut worker =
            BackgroundWorker::start(CountingRunnable(counters.clone()), Duration::from_secs(60), &root);

        root.cancel();
        worker.stop().await;
        assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 1);
    }
}
