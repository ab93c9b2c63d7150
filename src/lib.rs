//! # fanlock
//!
//! Two independent coordination primitives:
//!
//! - [`engine`]: fan-out/fan-in batch execution over a bounded worker pool,
//!   with optional merge, aggregate timeouts and first-failure propagation.
//! - [`lock`]: a lease lock built on an atomic increment-with-expiry counter
//!   in an external store, with retrying, callback-driven guarded execution.
//!
//! Postgres backs the production counter store ([`db`]); OpenTelemetry
//! carries traces, metrics and logs ([`telemetry`]).

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod lock;
pub mod telemetry;
