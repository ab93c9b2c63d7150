//! Span helpers for batches and guarded lock calls.

use tracing::Span;
use uuid::Uuid;

/// Start a span for one engine batch.
///
/// `batch.mode` is declared empty and filled once the engine decides
/// between inline and pooled execution.
pub fn start_batch_span(batch_id: &Uuid, size: usize) -> Span {
    tracing::debug_span!(
        "batch.execute",
        "batch.id" = %batch_id,
        "batch.size" = size,
        "batch.mode" = tracing::field::Empty,
    )
}

/// Start a span for one `execute_by_lock` call.
///
/// `lock.attempts` and `lock.acquired` are filled in as the call progresses.
pub fn start_lock_span(key: &str, expire_secs: u64) -> Span {
    tracing::debug_span!(
        "lock.execute",
        "lock.key" = key,
        "lock.expire_secs" = expire_secs,
        "lock.attempts" = tracing::field::Empty,
        "lock.acquired" = tracing::field::Empty,
    )
}

/// Record the outcome of the acquisition phase on a lock span.
pub fn record_lock_outcome(span: &Span, attempts: u32, acquired: bool) {
    span.record("lock.attempts", attempts);
    span.record("lock.acquired", acquired);
    span.in_scope(|| {
        tracing::debug!(attempts, acquired, "lock_phase_complete");
    });
}
