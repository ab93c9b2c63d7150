//! Execution engine: bounded worker pool, fan-out/fan-in batches, and
//! background shutdown of closed pools.

pub mod batch;
pub mod pool;
pub mod reaper;

pub use batch::{Engine, WorkFn};
pub use pool::{PoolConfig, PoolStats, TaskHandle, TaskPanic, WorkerPool};
pub use reaper::{Reaper, ReaperHandle};
