//! Lease lock over a [`CounterStore`].
//!
//! The lock for a key is held by whichever caller's increment observed the
//! counter go to exactly 1; that caller then sets the expiry. There is no
//! ownership token: anyone who knows the key can release it.
//!
//! Known weakness of the counter design: a crash between a successful
//! increment and the expiry call leaves a counter with no expiry, and the
//! key stays locked until someone releases it explicitly. Failed attempts
//! also bump the counter without undoing it.

use crate::error::{Result, error_chain};
use crate::telemetry::metrics;
use crate::telemetry::spans::{record_lock_outcome, start_lock_span};
use futures::FutureExt;
use opentelemetry::KeyValue;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Instrument, debug, warn};

use super::callback::LockCallback;
use super::store::{CounterStore, LockRecord};

/// Try-lock, release, and lock-guarded execution over a shared store.
#[derive(Clone)]
pub struct LockService {
    store: Arc<dyn CounterStore>,
}

impl LockService {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    /// Attempt to take the lock for `key` with a lease of `expire`.
    ///
    /// Returns `true` only if this call moved the counter to 1 and then set
    /// the expiry. Store errors are logged and reported as `false`.
    pub async fn try_acquire(&self, key: &str, expire: Duration) -> bool {
        let value = match self.store.increment_and_get(key).await {
            Ok(value) => value,
            Err(e) => {
                warn!(key, error = %error_chain(&e), "lock increment failed");
                count_attempt("store_error");
                return false;
            }
        };

        if value != 1 {
            debug!(key, value, "lock held elsewhere");
            count_attempt("contended");
            return false;
        }

        match self.store.expire(key, expire).await {
            Ok(true) => {
                debug!(key, expire_secs = expire.as_secs(), "lock acquired");
                count_attempt("acquired");
                true
            }
            Ok(false) => {
                warn!(key, "lock counter vanished before its expiry could be set");
                count_attempt("expire_failed");
                false
            }
            Err(e) => {
                warn!(key, error = %error_chain(&e), "setting lock expiry failed");
                count_attempt("expire_failed");
                false
            }
        }
    }

    /// Delete the lock for `key`, whoever holds it.
    ///
    /// Returns `true` iff a live lock was removed; releasing twice is safe.
    pub async fn release(&self, key: &str) -> bool {
        let released = match self.store.delete(key).await {
            Ok(released) => released,
            Err(e) => {
                warn!(key, error = %error_chain(&e), "lock release failed");
                false
            }
        };
        metrics::lock_releases().add(1, &[KeyValue::new("released", released.to_string())]);
        debug!(key, released, "lock released");
        released
    }

    /// Current counter state for `key`, for diagnostics only.
    pub async fn inspect(&self, key: &str) -> Result<Option<LockRecord>> {
        self.store.peek(key).await
    }

    /// Run `callback` guarded by the lock for `key`.
    ///
    /// See [`execute_by_lock_with`](Self::execute_by_lock_with).
    pub async fn execute_by_lock<C>(&self, key: &str, expire: Duration, callback: C) -> C::Output
    where
        C: LockCallback<()>,
    {
        self.execute_by_lock_with(key, expire, callback, ()).await
    }

    /// Run `callback` guarded by the lock for `key`, passing `args` to
    /// whichever branch runs.
    ///
    /// Makes up to `callback.try_lock_times()` attempts, sleeping
    /// `callback.try_lock_sleep()` before each retry and stopping at the
    /// first success. Then runs `on_success` if the lock was taken, else
    /// `on_failure`. A taken lock is released once the branch returns or
    /// panics; if this future is dropped while holding the lock, the release
    /// is spawned onto the current runtime instead. The branch's output is
    /// returned unchanged.
    pub async fn execute_by_lock_with<A, C>(
        &self,
        key: &str,
        expire: Duration,
        mut callback: C,
        args: A,
    ) -> C::Output
    where
        C: LockCallback<A>,
    {
        let span = start_lock_span(key, expire.as_secs());

        let (acquired, attempts) = self
            .acquire_with_retry(key, expire, callback.try_lock_times(), callback.try_lock_sleep())
            .instrument(span.clone())
            .await;
        record_lock_outcome(&span, attempts, acquired);

        if !acquired {
            return callback.on_failure(args).instrument(span).await;
        }

        let mut held = HeldLock {
            locks: self.clone(),
            key: Some(key.to_string()),
        };
        let outcome = AssertUnwindSafe(callback.on_success(args))
            .catch_unwind()
            .instrument(span.clone())
            .await;
        self.release(key).instrument(span).await;
        held.disarm();

        match outcome {
            Ok(output) => output,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    async fn acquire_with_retry(
        &self,
        key: &str,
        expire: Duration,
        tries: u32,
        sleep: Duration,
    ) -> (bool, u32) {
        let mut attempts = 1;
        if self.try_acquire(key, expire).await {
            return (true, attempts);
        }

        while attempts < tries {
            tokio::time::sleep(sleep).await;
            attempts += 1;
            if self.try_acquire(key, expire).await {
                return (true, attempts);
            }
        }

        debug!(key, attempts, "lock not acquired");
        (false, attempts)
    }
}

/// Releases a held lock when a guarded call is dropped before it could.
struct HeldLock {
    locks: LockService,
    key: Option<String>,
}

impl HeldLock {
    fn disarm(&mut self) {
        self.key = None;
    }
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        let Some(key) = self.key.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(key, "guarded call dropped, releasing lock in the background");
                let locks = self.locks.clone();
                handle.spawn(async move {
                    locks.release(&key).await;
                });
            }
            Err(_) => {
                warn!(key, "guarded call dropped outside a runtime, lock left to expire");
            }
        }
    }
}

fn count_attempt(result: &'static str) {
    metrics::lock_attempts().add(1, &[KeyValue::new("result", result)]);
}
