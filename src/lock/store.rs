//! Counter store abstraction behind the lock service, plus an in-process
//! implementation.
//!
//! A store keeps one integer per key with an optional expiry. An expired
//! key behaves exactly like an absent one.

use crate::error::Result;
use crate::telemetry::metrics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Read-only view of a lock counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockRecord {
    pub key: String,
    /// Number of increments since the key was last absent.
    pub value: i64,
    /// `None` when the counter has no expiry.
    pub expires_at: Option<DateTime<Utc>>,
}

/// Atomic counter-with-expiry primitives.
///
/// Implementations must make `increment_and_get` and `expire` atomic with
/// respect to every other caller of the same backing store.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Add one to the counter at `key`, creating it at 1 if absent or expired.
    async fn increment_and_get(&self, key: &str) -> Result<i64>;

    /// Set the time-to-live of `key`. Returns `false` if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Remove `key`. Returns `true` iff a live key was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Read the counter at `key` without modifying it.
    async fn peek(&self, key: &str) -> Result<Option<LockRecord>>;
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    value: i64,
    deadline: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.deadline.is_none_or(|deadline| deadline > now)
    }
}

/// In-process [`CounterStore`].
///
/// Mutual exclusion only spans the current process. Useful for tests and
/// for guarding work inside one service instance.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries<T>(&self, f: impl FnOnce(&mut HashMap<String, Entry>) -> T) -> T {
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut entries)
    }
}

fn count(operation: &'static str) {
    metrics::store_operations().add(
        1,
        &[
            KeyValue::new("backend", "memory"),
            KeyValue::new("operation", operation),
        ],
    );
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment_and_get(&self, key: &str) -> Result<i64> {
        let now = Instant::now();
        let value = self.with_entries(|entries| {
            let entry = entries.entry(key.to_string()).or_insert(Entry {
                value: 0,
                deadline: None,
            });
            if !entry.is_live(now) {
                *entry = Entry {
                    value: 0,
                    deadline: None,
                };
            }
            entry.value += 1;
            entry.value
        });
        count("increment");
        Ok(value)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let applied = self.with_entries(|entries| match entries.get_mut(key) {
            Some(entry) if entry.is_live(now) => {
                // A ttl past what `Instant` can represent never expires.
                entry.deadline = now.checked_add(ttl);
                true
            }
            _ => false,
        });
        count("expire");
        Ok(applied)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let now = Instant::now();
        let removed = self.with_entries(|entries| {
            entries
                .remove(key)
                .is_some_and(|entry| entry.is_live(now))
        });
        count("delete");
        Ok(removed)
    }

    async fn peek(&self, key: &str) -> Result<Option<LockRecord>> {
        let now = Instant::now();
        let record = self.with_entries(|entries| {
            entries
                .get(key)
                .filter(|entry| entry.is_live(now))
                .map(|entry| LockRecord {
                    key: key.to_string(),
                    value: entry.value,
                    expires_at: entry.deadline.and_then(|deadline| {
                        chrono::Duration::from_std(deadline - now)
                            .ok()
                            .and_then(|remaining| Utc::now().checked_add_signed(remaining))
                    }),
                })
        });
        count("peek");
        Ok(record)
    }
}
