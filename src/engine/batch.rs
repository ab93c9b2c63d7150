//! Fan-out/fan-in batch execution.
//!
//! A batch is a collection of inputs plus one work function. Single-item
//! batches run inline on the caller; larger batches fan out across the
//! [`WorkerPool`] and fan back in as results complete. The first failure
//! wins and every other outcome of that batch is discarded.

use crate::error::{BoxError, Error, Result, error_chain};
use crate::telemetry::metrics;
use crate::telemetry::spans::start_batch_span;
use opentelemetry::KeyValue;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{Instrument, Span, debug, trace, warn};
use uuid::Uuid;

use super::pool::{PoolConfig, TaskPanic, WorkerPool, join_first_failure};
use super::reaper::ReaperHandle;

/// A boxed work function, for batches that apply several functions to one input.
pub type WorkFn<I, O> = Box<dyn Fn(I) -> std::result::Result<O, BoxError> + Send + Sync + 'static>;

type Job<O> = Box<dyn FnOnce() -> std::result::Result<O, BoxError> + Send + 'static>;

/// The execution engine. Owns a worker pool and hands it to the shutdown
/// reaper when closed.
pub struct Engine {
    pool: Arc<WorkerPool>,
    reaper: ReaperHandle,
    closed: AtomicBool,
}

impl Engine {
    /// Wrap a caller-built pool.
    pub fn new(pool: WorkerPool, reaper: ReaperHandle) -> Self {
        Self {
            pool: Arc::new(pool),
            reaper,
            closed: AtomicBool::new(false),
        }
    }

    /// Build a pool from `config` and wrap it.
    pub fn with_config(config: PoolConfig, reaper: ReaperHandle) -> Result<Self> {
        Ok(Self::new(WorkerPool::new(config)?, reaper))
    }

    /// Build an engine over a pool with [`PoolConfig::default`] sizing.
    pub fn with_defaults(reaper: ReaperHandle) -> Result<Self> {
        Self::with_config(PoolConfig::default(), reaper)
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Run `work` over every input and collect the outputs.
    ///
    /// Outputs come back in completion order, not input order. A batch of
    /// one runs `work` directly on the calling task without touching the
    /// pool, blocking it for the duration of the call.
    pub async fn execute<I, O, F, E>(
        &self,
        inputs: impl IntoIterator<Item = I>,
        work: F,
    ) -> Result<Vec<O>>
    where
        I: Send + 'static,
        O: Send + 'static,
        F: Fn(I) -> std::result::Result<O, E> + Send + Sync + 'static,
        E: Into<BoxError>,
    {
        self.execute_with_timeout(inputs, work, None).await
    }

    /// [`execute`](Self::execute) with the aggregate wait capped at `timeout`.
    ///
    /// `None` waits indefinitely. On the deadline the call returns
    /// [`Error::ExecuteTimeout`]; tasks still running are left to finish and
    /// their results are dropped.
    pub async fn execute_with_timeout<I, O, F, E>(
        &self,
        inputs: impl IntoIterator<Item = I>,
        work: F,
        timeout: Option<Duration>,
    ) -> Result<Vec<O>>
    where
        I: Send + 'static,
        O: Send + 'static,
        F: Fn(I) -> std::result::Result<O, E> + Send + Sync + 'static,
        E: Into<BoxError>,
    {
        let work = Arc::new(work);
        let jobs: Vec<Job<O>> = inputs
            .into_iter()
            .map(|input| {
                let work = Arc::clone(&work);
                Box::new(move || (*work)(input).map_err(Into::into)) as Job<O>
            })
            .collect();
        self.run(jobs, timeout).await
    }

    /// Run the batch, then reduce all outputs with `merge` on the calling task.
    pub async fn execute_merge<I, O, M, F, E, G>(
        &self,
        inputs: impl IntoIterator<Item = I>,
        work: F,
        merge: G,
    ) -> Result<M>
    where
        I: Send + 'static,
        O: Send + 'static,
        F: Fn(I) -> std::result::Result<O, E> + Send + Sync + 'static,
        E: Into<BoxError>,
        G: FnOnce(Vec<O>) -> M,
    {
        self.execute_merge_with_timeout(inputs, work, merge, None)
            .await
    }

    pub async fn execute_merge_with_timeout<I, O, M, F, E, G>(
        &self,
        inputs: impl IntoIterator<Item = I>,
        work: F,
        merge: G,
        timeout: Option<Duration>,
    ) -> Result<M>
    where
        I: Send + 'static,
        O: Send + 'static,
        F: Fn(I) -> std::result::Result<O, E> + Send + Sync + 'static,
        E: Into<BoxError>,
        G: FnOnce(Vec<O>) -> M,
    {
        let outputs = self.execute_with_timeout(inputs, work, timeout).await?;
        Ok(merge(outputs))
    }

    /// Run `work` over the indices `0..size`.
    pub async fn execute_range<O, F, E>(&self, size: usize, work: F) -> Result<Vec<O>>
    where
        O: Send + 'static,
        F: Fn(usize) -> std::result::Result<O, E> + Send + Sync + 'static,
        E: Into<BoxError>,
    {
        self.execute(0..size, work).await
    }

    /// Apply every function in `works` to its own clone of `input`.
    ///
    /// The functions are independent alternatives run concurrently, not
    /// stages of a pipeline: none sees another's output. Results are gathered
    /// like any other batch.
    pub async fn execute_each<I, O>(
        &self,
        input: I,
        works: Vec<WorkFn<I, O>>,
        timeout: Option<Duration>,
    ) -> Result<Vec<O>>
    where
        I: Clone + Send + 'static,
        O: Send + 'static,
    {
        let jobs: Vec<Job<O>> = works
            .into_iter()
            .map(|work| {
                let input = input.clone();
                Box::new(move || work(input)) as Job<O>
            })
            .collect();
        self.run(jobs, timeout).await
    }

    /// Hand the pool to the reaper for a graceful shutdown. Returns at once.
    ///
    /// The pool stops accepting work, gets its grace period to drain, then
    /// has its queue cancelled. Closing twice is a no-op.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(pool) = self.reaper.schedule(Arc::clone(&self.pool)) {
            warn!("shutdown reaper is not running, stopping worker pool immediately");
            pool.shutdown_now();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn run<O: Send + 'static>(
        &self,
        mut jobs: Vec<Job<O>>,
        timeout: Option<Duration>,
    ) -> Result<Vec<O>> {
        let size = jobs.len();
        let span = start_batch_span(&Uuid::new_v4(), size);

        match size {
            0 => {
                trace!(parent: &span, "empty batch");
                Ok(Vec::new())
            }
            1 => run_inline(jobs.remove(0), &span),
            _ => self.run_pooled(jobs, timeout, span).await,
        }
    }

    async fn run_pooled<O: Send + 'static>(
        &self,
        jobs: Vec<Job<O>>,
        timeout: Option<Duration>,
        span: Span,
    ) -> Result<Vec<O>> {
        span.record("batch.mode", "pooled");
        let size = jobs.len();
        let started = Instant::now();
        // One deadline covers waiting for queue slots and waiting for results.
        let deadline = timeout.map(|limit| (limit, tokio::time::Instant::now() + limit));

        let mut handles = Vec::with_capacity(size);
        for job in jobs {
            let submitted = match deadline {
                Some((limit, at)) => match tokio::time::timeout_at(at, self.pool.submit(job)).await {
                    Ok(submitted) => submitted,
                    Err(_) => return Err(timed_out(&span, limit)),
                },
                None => self.pool.submit(job).await,
            };
            match submitted {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    warn!(parent: &span, submitted = handles.len(), "batch submission failed: {e}");
                    return Err(e);
                }
            }
        }

        // Completion callback: hand the outcome back first, log after.
        let (tx, rx) = oneshot::channel();
        self.pool.handle().spawn(
            async move {
                let outcome = join_first_failure(handles).await;
                let failure = outcome.as_ref().err().map(|e| error_chain(e));
                let delivered = tx.send(outcome).is_ok();
                record_completion("pooled", size, started.elapsed(), failure.as_deref());
                if !delivered {
                    debug!("batch outcome discarded, caller stopped waiting");
                }
            }
            .instrument(span.clone()),
        );

        let received = match deadline {
            Some((limit, at)) => match tokio::time::timeout_at(at, rx).await {
                Ok(received) => received,
                Err(_) => return Err(timed_out(&span, limit)),
            },
            None => rx.await,
        };

        received.map_err(|_| Error::PoolShutdown)?
    }
}

fn timed_out(span: &Span, limit: Duration) -> Error {
    warn!(parent: span, timeout_ms = limit.as_millis() as u64, "batch timed out");
    metrics::batches_executed().add(
        1,
        &[
            KeyValue::new("mode", "pooled"),
            KeyValue::new("result", "timeout"),
        ],
    );
    Error::ExecuteTimeout(limit)
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_inline<O>(job: Job<O>, span: &Span) -> Result<Vec<O>> {
    span.record("batch.mode", "inline");
    let _entered = span.enter();
    let started = Instant::now();

    let outcome = match std::panic::catch_unwind(AssertUnwindSafe(job)) {
        Ok(Ok(output)) => Ok(vec![output]),
        Ok(Err(cause)) => Err(Error::ExecuteFailure(cause)),
        Err(payload) => Err(Error::ExecuteFailure(Box::new(TaskPanic::from_payload(
            payload,
        )))),
    };

    let failure = outcome.as_ref().err().map(|e| error_chain(e));
    record_completion("inline", 1, started.elapsed(), failure.as_deref());
    outcome
}

fn record_completion(mode: &'static str, size: usize, elapsed: Duration, failure: Option<&str>) {
    let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
    metrics::batch_duration_ms().record(elapsed_ms, &[KeyValue::new("mode", mode)]);
    metrics::batches_executed().add(
        1,
        &[
            KeyValue::new("mode", mode),
            KeyValue::new("result", if failure.is_some() { "failure" } else { "ok" }),
        ],
    );

    match failure {
        Some(error) => warn!(mode, size, elapsed_ms, error, "batch failed"),
        None => trace!(mode, size, elapsed_ms, "batch completed"),
    }
}
