//! Batch completion logging, captured through a global fmt subscriber.
//!
//! Kept in its own test binary because the subscriber is process-global.

use fanlock::engine::{Engine, PoolConfig, Reaper};
use fanlock::error::BoxError;
use std::io::Write;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

static LOGS: OnceLock<Captured> = OnceLock::new();

fn logs() -> &'static Captured {
    LOGS.get_or_init(|| {
        let captured = Captured::default();
        let writer = captured.clone();
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .init();
        captured
    })
}

/// Completion is logged after the caller gets its result, so poll for it.
async fn logged(needle: &str) -> bool {
    for _ in 0..400 {
        if logs().text().contains(needle) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

fn engine(reaper: &Reaper) -> Engine {
    Engine::with_config(
        PoolConfig {
            core_size: 2,
            max_size: 4,
            ..PoolConfig::default()
        },
        reaper.handle(),
    )
    .unwrap()
}

#[derive(Debug, thiserror::Error)]
#[error("bad input {0}")]
struct BadInput(u32);

#[tokio::test]
async fn batch_outcomes_are_logged() {
    logs();
    let reaper = Reaper::start().unwrap();
    let engine = engine(&reaper);

    let err = engine
        .execute(0..6u32, |x: u32| {
            if x == 4 {
                Err(BadInput(x))
            } else {
                Ok(x)
            }
        })
        .await;
    assert!(err.is_err());
    assert!(logged("batch failed").await);
    assert!(logged("bad input 4").await);

    engine
        .execute(0..6u32, |x: u32| Ok::<_, BoxError>(x))
        .await
        .unwrap();
    assert!(logged("batch completed").await);
}
