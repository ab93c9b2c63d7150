//! Metric instrument factories for fanlock.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"fanlock"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for fanlock instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("fanlock")
}

/// Counter: batches finished by the execution engine.
/// Labels: `mode` ("inline" | "pooled"), `result` ("ok" | "failure" | "timeout").
pub fn batches_executed() -> Counter<u64> {
    meter()
        .u64_counter("fanlock.batch.executed")
        .with_description("Number of batches executed")
        .build()
}

/// Histogram: batch wall-clock duration in milliseconds.
/// Labels: `mode`.
pub fn batch_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("fanlock.batch.duration_ms")
        .with_description("Batch duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: lock acquisition attempts.
/// Labels: `result` ("acquired" | "contended" | "expire_failed" | "store_error").
pub fn lock_attempts() -> Counter<u64> {
    meter()
        .u64_counter("fanlock.lock.attempts")
        .with_description("Number of lock acquisition attempts")
        .build()
}

/// Counter: lock releases.
/// Labels: `released` ("true" | "false").
pub fn lock_releases() -> Counter<u64> {
    meter()
        .u64_counter("fanlock.lock.releases")
        .with_description("Number of lock releases")
        .build()
}

/// Counter: counter-store operations (increment, expire, delete, peek).
/// Labels: `backend`, `operation`.
pub fn store_operations() -> Counter<u64> {
    meter()
        .u64_counter("fanlock.store.operations")
        .with_description("Number of counter store operations")
        .build()
}
