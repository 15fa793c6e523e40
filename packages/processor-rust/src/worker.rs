//! Background worker driving a periodic tick plus on-demand tasks.
//!
//! A generic `BackgroundWorker<R>` runs a `BackgroundRunnable` on its own
//! tokio task: tasks arrive over an mpsc channel whose sender only the
//! runnable holds, `on_tick` fires on a fixed interval, and `shutdown` runs
//! once when the worker stops.

use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{warn, Instrument};

/// Channel capacity for tasks the runnable sends itself.
const TASK_CHANNEL_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// BackgroundRunnable trait
// ---------------------------------------------------------------------------

/// Task handler executed by `BackgroundWorker`.
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    /// The type of task this runnable processes.
    type Task: Send + 'static;

    /// Process a single task.
    async fn run(&mut self, task: Self::Task);

    /// Called on each tick, the first one immediately after start.
    async fn on_tick(&mut self) {}

    /// Called once when the worker is shutting down.
    async fn shutdown(&mut self) {}
}

// ---------------------------------------------------------------------------
// BackgroundWorker
// ---------------------------------------------------------------------------

/// Handle to a spawned runnable.
///
/// The spawned task:
/// 1. Calls `on_tick()` immediately, then every `tick_interval`
/// 2. Calls `run()` for each task received on the channel
/// 3. Calls `shutdown()` once stopped
///
/// Tasks and ticks never run concurrently with each other.
pub struct BackgroundWorker<R: BackgroundRunnable> {
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
    _runnable: PhantomData<fn() -> R>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Builds the runnable with a sender for its own task channel and starts it
    /// inside the current tracing span.
    pub fn start<F>(build: F, tick_interval: Duration) -> Self
    where
        F: FnOnce(mpsc::Sender<R::Task>) -> R,
    {
        let (tx, mut rx) = mpsc::channel::<R::Task>(TASK_CHANNEL_CAPACITY);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let mut runnable = build(tx);

        let handle = tokio::spawn(
            async move {
                let mut ticks = tokio::time::interval(tick_interval);
                ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

                loop {
                    tokio::select! {
                        biased;
                        _ = &mut shutdown_rx => break,
                        Some(task) = rx.recv() => runnable.run(task).await,
                        _ = ticks.tick() => runnable.on_tick().await,
                    }
                }

                runnable.shutdown().await;
            }
            .in_current_span(),
        );

        Self {
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
            _runnable: PhantomData,
        }
    }

    /// Stops the worker, waiting up to `limit` for the current tick or task
    /// and then `shutdown()` to complete. Returns `false` when the worker had
    /// to be aborted at the limit.
    pub async fn stop(&mut self, limit: Duration) -> bool {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let Some(mut handle) = self.handle.take() else {
            return true;
        };
        if tokio::time::timeout(limit, &mut handle).await.is_ok() {
            return true;
        }
        warn!(
            limit_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
            "background worker did not stop in time, aborting it"
        );
        handle.abort();
        false
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
