//! Secret handling utilities.
//!
//! Re-exports the secrecy types used for connection strings so callers do
//! not need a direct dependency on the crate.

pub use secrecy::{ExposeSecret, SecretString};
