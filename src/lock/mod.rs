//! Lease-based locking over an external atomic counter store.

pub mod callback;
pub mod service;
pub mod store;

pub use callback::{DEFAULT_TRY_LOCK_SLEEP, DEFAULT_TRY_LOCK_TIMES, FnCallback, LockCallback};
pub use service::LockService;
pub use store::{CounterStore, LockRecord, MemoryStore};
