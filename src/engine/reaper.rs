//! Background shutdown of closed worker pools.
//!
//! One `Reaper` thread serves every engine built with its handle. A closed
//! engine's pool is sent here; the reaper stops it accepting work, waits up
//! to the pool's grace period for it to drain, then cancels whatever is
//! still queued and releases the runtime. Closing an engine never blocks.

use crate::error::Result;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::pool::WorkerPool;

/// Cloneable sender side of a [`Reaper`], held by engines.
#[derive(Clone)]
pub struct ReaperHandle {
    tx: mpsc::UnboundedSender<Arc<WorkerPool>>,
}

impl ReaperHandle {
    /// Queue a pool for shutdown. Gives the pool back if the reaper is gone.
    pub(crate) fn schedule(
        &self,
        pool: Arc<WorkerPool>,
    ) -> std::result::Result<(), Arc<WorkerPool>> {
        self.tx.send(pool).map_err(|e| e.0)
    }
}

/// Owner of the shutdown thread. Stop it with [`Reaper::shutdown`] at
/// process teardown; dropping it stops the loop without waiting.
pub struct Reaper {
    handle: ReaperHandle,
    stop: Option<oneshot::Sender<()>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Reaper {
    /// Spawn the reaper thread.
    pub fn start() -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        let thread = std::thread::Builder::new()
            .name("fanlock-reaper".to_string())
            .spawn(move || runtime.block_on(reap(rx, stop_rx)))?;

        debug!("shutdown reaper started");
        Ok(Self {
            handle: ReaperHandle { tx },
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> ReaperHandle {
        self.handle.clone()
    }

    /// Stop accepting pools, finish draining the ones already handed over,
    /// and join the thread. Blocks for at most the longest pending grace period.
    pub fn shutdown(mut self) {
        self.signal_stop();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("shutdown reaper thread panicked");
            }
        }
    }

    fn signal_stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.signal_stop();
    }
}

async fn reap(
    mut rx: mpsc::UnboundedReceiver<Arc<WorkerPool>>,
    mut stop: oneshot::Receiver<()>,
) {
    let mut draining = JoinSet::new();

    loop {
        tokio::select! {
            next = rx.recv() => match next {
                Some(pool) => {
                    draining.spawn(drain(pool));
                }
                None => break,
            },
            Some(_) = draining.join_next(), if !draining.is_empty() => {}
            _ = &mut stop => break,
        }
    }

    rx.close();
    while let Ok(pool) = rx.try_recv() {
        draining.spawn(drain(pool));
    }
    while draining.join_next().await.is_some() {}
    debug!("shutdown reaper stopped");
}

async fn drain(pool: Arc<WorkerPool>) {
    let grace = pool.config().shutdown_grace;
    pool.shutdown();

    if pool.await_termination(grace).await {
        info!("worker pool drained");
    } else {
        let cancelled = pool.shutdown_now();
        warn!(
            grace_secs = grace.as_secs(),
            cancelled, "worker pool did not drain within its grace period, cancelling queued tasks"
        );
    }
    pool.teardown();
}
