//! Callbacks run by [`LockService::execute_by_lock`](super::LockService::execute_by_lock).
//!
//! A callback has one branch for "lock acquired" and one for "lock not
//! acquired", plus a retry policy. The two shape axes are expressed through
//! the type parameters: `A` carries positional arguments (`()` for none)
//! and `Output` is whatever the branches return (`()` for nothing).

use std::future::Future;
use std::time::Duration;

/// Default number of acquisition attempts.
pub const DEFAULT_TRY_LOCK_TIMES: u32 = 1;

/// Default sleep between acquisition attempts.
pub const DEFAULT_TRY_LOCK_SLEEP: Duration = Duration::from_millis(10);

/// Success/failure branches plus retry policy for a guarded call.
///
/// Implementors may write the branches as `async fn`.
pub trait LockCallback<A = ()> {
    type Output;

    /// Runs while the lock is held. The lock is released afterwards, even if
    /// this panics.
    fn on_success(&mut self, args: A) -> impl Future<Output = Self::Output> + Send;

    /// Runs when every attempt failed to acquire the lock.
    fn on_failure(&mut self, args: A) -> impl Future<Output = Self::Output> + Send;

    /// Total acquisition attempts, including the first. Values below 2 mean
    /// no retry.
    fn try_lock_times(&self) -> u32 {
        DEFAULT_TRY_LOCK_TIMES
    }

    /// Sleep before each retry.
    fn try_lock_sleep(&self) -> Duration {
        DEFAULT_TRY_LOCK_SLEEP
    }
}

/// A [`LockCallback`] assembled from two closures.
///
/// ```ignore
/// let callback = FnCallback::new(
///     |(): ()| async { Ok::<_, Error>(refresh_cache().await?) },
///     |(): ()| async { Ok(()) },
/// )
/// .tries(3)
/// .retry_sleep(Duration::from_millis(50));
/// ```
pub struct FnCallback<S, F> {
    on_success: S,
    on_failure: F,
    try_lock_times: u32,
    try_lock_sleep: Duration,
}

impl<S, F> FnCallback<S, F> {
    pub fn new(on_success: S, on_failure: F) -> Self {
        Self {
            on_success,
            on_failure,
            try_lock_times: DEFAULT_TRY_LOCK_TIMES,
            try_lock_sleep: DEFAULT_TRY_LOCK_SLEEP,
        }
    }

    pub fn tries(mut self, times: u32) -> Self {
        self.try_lock_times = times;
        self
    }

    pub fn retry_sleep(mut self, sleep: Duration) -> Self {
        self.try_lock_sleep = sleep;
        self
    }
}

impl<A, S, F, SFut, FFut, R> LockCallback<A> for FnCallback<S, F>
where
    S: FnMut(A) -> SFut,
    F: FnMut(A) -> FFut,
    SFut: Future<Output = R> + Send,
    FFut: Future<Output = R> + Send,
{
    type Output = R;

    fn on_success(&mut self, args: A) -> impl Future<Output = R> + Send {
        (self.on_success)(args)
    }

    fn on_failure(&mut self, args: A) -> impl Future<Output = R> + Send {
        (self.on_failure)(args)
    }

    fn try_lock_times(&self) -> u32 {
        self.try_lock_times
    }

    fn try_lock_sleep(&self) -> Duration {
        self.try_lock_sleep
    }
}
