//! Bounded worker pool backed by a dedicated tokio runtime.
//!
//! Work units are synchronous closures. They run on the runtime's blocking
//! threads (at most `max_size` at once); the runtime's `core_size` async
//! workers only drive completion callbacks. Tasks that have been submitted
//! but not yet started sit in a finite queue of `queue_capacity` slots;
//! [`WorkerPool::submit`] waits for a free slot, [`WorkerPool::try_submit`]
//! rejects instead.

use crate::error::{BoxError, Error, Result};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Deserialize;
use std::any::Any;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::{Handle, Runtime};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info};

/// Sizing and lifecycle settings for a [`WorkerPool`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Async worker threads driving completion callbacks.
    pub core_size: usize,
    /// Upper bound on threads running work units concurrently.
    pub max_size: usize,
    /// Submitted-but-not-started tasks allowed before submissions wait.
    pub queue_capacity: usize,
    /// How long a closing pool may drain before queued work is cancelled.
    #[serde(rename = "shutdown_grace_secs", deserialize_with = "duration_from_secs")]
    pub shutdown_grace: Duration,
    /// Prefix for the pool's thread names.
    pub thread_name: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            core_size: 4,
            max_size: 16,
            queue_capacity: 65_536,
            shutdown_grace: Duration::from_secs(60),
            thread_name: "fanlock-worker".to_string(),
        }
    }
}

/// Top-level TOML wrapper.
#[derive(Debug, Deserialize)]
struct PoolFile {
    #[serde(default)]
    pool: PoolConfig,
}

impl PoolConfig {
    /// Parse the `[pool]` table of a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: PoolFile = toml::from_str(content)
            .map_err(|e| Error::Config(format!("bad pool config: {e}")))?;
        file.pool.validate()?;
        Ok(file.pool)
    }

    /// Load the `[pool]` table from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read pool config {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.core_size == 0 {
            return Err(Error::Config("pool core_size must be at least 1".to_string()));
        }
        if self.max_size < self.core_size {
            return Err(Error::Config(format!(
                "pool max_size ({}) must not be below core_size ({})",
                self.max_size, self.core_size
            )));
        }
        if self.queue_capacity == 0 || self.queue_capacity > Semaphore::MAX_PERMITS {
            return Err(Error::Config(format!(
                "pool queue_capacity must be between 1 and {}",
                Semaphore::MAX_PERMITS
            )));
        }
        Ok(())
    }
}

fn duration_from_secs<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_secs)
}

/// Point-in-time counters for a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Tasks accepted since the pool started.
    pub submitted: u64,
    /// Tasks accepted but not yet started.
    pub queued: usize,
    /// Tasks accepted and not yet finished (queued + running).
    pub active: usize,
}

/// A work unit panicked instead of returning.
#[derive(Debug, Error)]
#[error("task panicked: {0}")]
pub struct TaskPanic(pub String);

impl TaskPanic {
    pub(crate) fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self(message)
    }
}

struct PoolState {
    accepting: AtomicBool,
    cancelled: AtomicBool,
    submitted: AtomicU64,
    queued: AtomicUsize,
    active: AtomicUsize,
    idle: Notify,
    queue_slots: Arc<Semaphore>,
}

impl PoolState {
    /// Stop handing out queue slots. Submitters waiting for one get
    /// [`Error::PoolShutdown`].
    fn stop_accepting(&self) -> bool {
        self.queue_slots.close();
        self.accepting.swap(false, Ordering::AcqRel)
    }
}

/// Queue and activity bookkeeping for one submitted task.
///
/// Dropped when the task finishes, panics, or is discarded unstarted by a
/// runtime shutdown, so the counters never leak.
struct Slot {
    state: Arc<PoolState>,
    queue_slot: Option<OwnedSemaphorePermit>,
    started: bool,
}

impl Slot {
    fn start(&mut self) {
        self.started = true;
        self.state.queued.fetch_sub(1, Ordering::AcqRel);
        drop(self.queue_slot.take());
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        if !self.started {
            self.state.queued.fetch_sub(1, Ordering::AcqRel);
        }
        if self.state.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.state.idle.notify_waiters();
        }
    }
}

/// Handle to one dispatched work unit.
///
/// Resolves to the unit's output. A returned error becomes
/// [`Error::ExecuteFailure`] with the original cause, a panic becomes
/// [`Error::ExecuteFailure`] wrapping [`TaskPanic`], and a task cancelled
/// before it started becomes [`Error::PoolShutdown`]. Dropping the handle
/// detaches the task; it is never interrupted.
pub struct TaskHandle<T> {
    inner: JoinHandle<Option<std::result::Result<T, BoxError>>>,
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.inner).poll(cx).map(|joined| match joined {
            Ok(Some(Ok(output))) => Ok(output),
            Ok(Some(Err(cause))) => Err(Error::ExecuteFailure(cause)),
            Ok(None) => Err(Error::PoolShutdown),
            Err(err) => Err(join_failure(err)),
        })
    }
}

fn join_failure(err: JoinError) -> Error {
    if err.is_panic() {
        Error::ExecuteFailure(Box::new(TaskPanic::from_payload(err.into_panic())))
    } else {
        Error::PoolShutdown
    }
}

/// A bounded pool of worker threads that accepts tasks and hands back
/// awaitable [`TaskHandle`]s.
///
/// Safe to share: any number of callers may submit concurrently. Worker
/// threads never keep the process alive, and dropping the pool tears its
/// runtime down in the background without blocking.
pub struct WorkerPool {
    config: PoolConfig,
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    state: Arc<PoolState>,
}

impl WorkerPool {
    /// Start a pool with the given sizing.
    pub fn new(config: PoolConfig) -> Result<Self> {
        config.validate()?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.core_size)
            .max_blocking_threads(config.max_size)
            .thread_name(config.thread_name.clone())
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        let queue_capacity = config.queue_capacity;

        info!(
            core_size = config.core_size,
            max_size = config.max_size,
            queue_capacity = config.queue_capacity,
            "worker pool started"
        );

        Ok(Self {
            config,
            runtime: Mutex::new(Some(runtime)),
            handle,
            state: Arc::new(PoolState {
                accepting: AtomicBool::new(true),
                cancelled: AtomicBool::new(false),
                submitted: AtomicU64::new(0),
                queued: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                idle: Notify::new(),
                queue_slots: Arc::new(Semaphore::new(queue_capacity)),
            }),
        })
    }

    /// Start a pool with [`PoolConfig::default`].
    pub fn with_defaults() -> Result<Self> {
        Self::new(PoolConfig::default())
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Submit one task, waiting for a queue slot if the queue is full.
    ///
    /// Fails with [`Error::PoolShutdown`] once the pool stopped accepting
    /// work, including while this call is still waiting for a slot.
    pub async fn submit<F, T>(&self, task: F) -> Result<TaskHandle<T>>
    where
        F: FnOnce() -> std::result::Result<T, BoxError> + Send + 'static,
        T: Send + 'static,
    {
        if !self.state.accepting.load(Ordering::Acquire) {
            return Err(Error::PoolShutdown);
        }
        let queue_slot = Arc::clone(&self.state.queue_slots)
            .acquire_owned()
            .await
            .map_err(|_| Error::PoolShutdown)?;
        self.dispatch(task, queue_slot)
    }

    /// Submit one task without waiting.
    ///
    /// Fails with [`Error::PoolRejected`] when the queue is full and with
    /// [`Error::PoolShutdown`] once the pool stopped accepting work.
    pub fn try_submit<F, T>(&self, task: F) -> Result<TaskHandle<T>>
    where
        F: FnOnce() -> std::result::Result<T, BoxError> + Send + 'static,
        T: Send + 'static,
    {
        if !self.state.accepting.load(Ordering::Acquire) {
            return Err(Error::PoolShutdown);
        }
        let queue_slot = match Arc::clone(&self.state.queue_slots).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                return Err(Error::PoolRejected(self.config.queue_capacity));
            }
            Err(TryAcquireError::Closed) => return Err(Error::PoolShutdown),
        };
        self.dispatch(task, queue_slot)
    }

    fn dispatch<F, T>(&self, task: F, queue_slot: OwnedSemaphorePermit) -> Result<TaskHandle<T>>
    where
        F: FnOnce() -> std::result::Result<T, BoxError> + Send + 'static,
        T: Send + 'static,
    {
        if !self.state.accepting.load(Ordering::Acquire) {
            return Err(Error::PoolShutdown);
        }
        self.state.queued.fetch_add(1, Ordering::AcqRel);
        self.state.active.fetch_add(1, Ordering::AcqRel);
        self.state.submitted.fetch_add(1, Ordering::Relaxed);

        let mut slot = Slot {
            state: Arc::clone(&self.state),
            queue_slot: Some(queue_slot),
            started: false,
        };
        let inner = self.handle.spawn_blocking(move || {
            slot.start();
            if slot.state.cancelled.load(Ordering::Acquire) {
                return None;
            }
            Some(task())
        });

        Ok(TaskHandle { inner })
    }

    /// Wait for every handle, returning outputs in completion order.
    ///
    /// The first failure ends the wait; the remaining tasks keep running
    /// detached and their results are discarded. With a timeout, reaching the
    /// deadline first yields [`Error::ExecuteTimeout`].
    pub async fn await_all<T>(
        handles: Vec<TaskHandle<T>>,
        timeout: Option<Duration>,
    ) -> Result<Vec<T>> {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, join_first_failure(handles))
                .await
                .map_err(|_| Error::ExecuteTimeout(limit))?,
            None => join_first_failure(handles).await,
        }
    }

    /// Stop accepting work. Queued and running tasks still complete.
    pub fn shutdown(&self) {
        if self.state.stop_accepting() {
            debug!("worker pool stopped accepting work");
        }
        self.state.idle.notify_waiters();
    }

    /// Stop accepting work and cancel every task that has not started yet.
    ///
    /// Running tasks are not interrupted. Returns how many tasks were still
    /// queued at the time of the call.
    pub fn shutdown_now(&self) -> usize {
        self.state.stop_accepting();
        self.state.cancelled.store(true, Ordering::Release);
        self.state.idle.notify_waiters();
        self.state.queued.load(Ordering::Acquire)
    }

    pub fn is_shutdown(&self) -> bool {
        !self.state.accepting.load(Ordering::Acquire)
    }

    /// Shut down and no task left queued or running.
    pub fn is_terminated(&self) -> bool {
        self.is_shutdown() && self.state.active.load(Ordering::Acquire) == 0
    }

    /// Wait until the pool is shut down and idle. Returns `false` on timeout.
    pub async fn await_termination(&self, timeout: Duration) -> bool {
        let terminated = async {
            loop {
                let notified = self.state.idle.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.is_terminated() {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, terminated).await.is_ok()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            submitted: self.state.submitted.load(Ordering::Relaxed),
            queued: self.state.queued.load(Ordering::Acquire),
            active: self.state.active.load(Ordering::Acquire),
        }
    }

    /// Runtime handle used to drive completion callbacks.
    pub(crate) fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Release the runtime without waiting for running tasks.
    pub(crate) fn teardown(&self) {
        let runtime = match self.runtime.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(runtime) = runtime {
            self.state.stop_accepting();
            runtime.shutdown_background();
            debug!("worker pool runtime released");
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Drain handles as they complete, stopping at the first failure.
pub(crate) async fn join_first_failure<T>(handles: Vec<TaskHandle<T>>) -> Result<Vec<T>> {
    let mut outputs = Vec::with_capacity(handles.len());
    let mut pending: FuturesUnordered<TaskHandle<T>> = handles.into_iter().collect();
    while let Some(joined) = pending.next().await {
        outputs.push(joined?);
    }
    Ok(outputs)
}
