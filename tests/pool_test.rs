//! Integration tests for the worker pool and its configuration.

use fanlock::engine::{PoolConfig, WorkerPool};
use fanlock::error::{BoxError, Error};
use std::sync::mpsc;
use std::time::Duration;

fn pool_with(max_size: usize, queue_capacity: usize) -> WorkerPool {
    WorkerPool::new(PoolConfig {
        core_size: 1,
        max_size,
        queue_capacity,
        shutdown_grace: Duration::from_secs(1),
        thread_name: "fanlock-pool-test".to_string(),
    })
    .expect("failed to start pool")
}

/// Poll `check` until it holds or two seconds pass.
async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..400 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

/// A task that blocks its worker thread until the returned sender fires.
fn blocker() -> (
    mpsc::Sender<()>,
    impl FnOnce() -> Result<&'static str, BoxError> + Send + 'static,
) {
    let (tx, rx) = mpsc::channel::<()>();
    let task = move || {
        let _ = rx.recv();
        Ok("blocker")
    };
    (tx, task)
}

#[tokio::test]
async fn submitted_tasks_resolve_through_await_all() {
    let pool = pool_with(4, 64);

    let mut handles = Vec::new();
    for i in 0..10u32 {
        handles.push(pool.submit(move || Ok::<_, BoxError>(i * 3)).await.unwrap());
    }
    let mut outputs = WorkerPool::await_all(handles, None).await.unwrap();
    outputs.sort();

    assert_eq!(outputs, (0..10u32).map(|i| i * 3).collect::<Vec<_>>());
    assert_eq!(pool.stats().submitted, 10);
    assert!(eventually(|| pool.stats().active == 0).await);
}

#[tokio::test]
async fn try_submit_rejects_when_queue_is_full() {
    let pool = pool_with(1, 2);

    let (release, task) = blocker();
    let running = pool.try_submit(task).unwrap();
    assert!(eventually(|| pool.stats().queued == 0).await);

    let queued_a = pool.try_submit(|| Ok::<_, BoxError>("a")).unwrap();
    let queued_b = pool.try_submit(|| Ok::<_, BoxError>("b")).unwrap();
    assert_eq!(pool.stats().queued, 2);

    let rejected = pool.try_submit(|| Ok::<_, BoxError>("c"));
    assert!(matches!(rejected, Err(Error::PoolRejected(2))));

    release.send(()).unwrap();
    assert_eq!(running.await.unwrap(), "blocker");
    assert_eq!(queued_a.await.unwrap(), "a");
    assert_eq!(queued_b.await.unwrap(), "b");
}

#[tokio::test]
async fn submit_waits_for_a_free_queue_slot() {
    let pool = pool_with(1, 1);

    let (release, task) = blocker();
    let running = pool.submit(task).await.unwrap();
    assert!(eventually(|| pool.stats().queued == 0).await);
    let queued = pool.submit(|| Ok::<_, BoxError>("queued")).await.unwrap();

    let waiting = pool.submit(|| Ok::<_, BoxError>("waited"));
    tokio::pin!(waiting);
    assert!(
        tokio::time::timeout(Duration::from_millis(50), &mut waiting)
            .await
            .is_err()
    );

    release.send(()).unwrap();
    let waited = waiting.await.unwrap();
    assert_eq!(running.await.unwrap(), "blocker");
    assert_eq!(queued.await.unwrap(), "queued");
    assert_eq!(waited.await.unwrap(), "waited");
    assert_eq!(pool.stats().submitted, 3);
}

#[tokio::test]
async fn shutdown_wakes_submitters_waiting_for_a_slot() {
    let pool = pool_with(1, 1);

    let (release, task) = blocker();
    let _running = pool.submit(task).await.unwrap();
    assert!(eventually(|| pool.stats().queued == 0).await);
    let _queued = pool.submit(|| Ok::<_, BoxError>("queued")).await.unwrap();

    let (waiting, ()) = tokio::join!(pool.submit(|| Ok::<_, BoxError>("late")), async {
        tokio::time::sleep(Duration::from_millis(30)).await;
        pool.shutdown();
    });
    assert!(matches!(waiting, Err(Error::PoolShutdown)));

    release.send(()).unwrap();
}

#[tokio::test]
async fn shutdown_stops_accepting_but_finishes_queued_work() {
    let pool = pool_with(1, 16);

    let (release, task) = blocker();
    let running = pool.submit(task).await.unwrap();
    let queued = pool.submit(|| Ok::<_, BoxError>("queued")).await.unwrap();

    pool.shutdown();
    assert!(pool.is_shutdown());
    assert!(matches!(
        pool.submit(|| Ok::<_, BoxError>("late")).await,
        Err(Error::PoolShutdown)
    ));
    assert!(!pool.await_termination(Duration::from_millis(50)).await);

    release.send(()).unwrap();
    assert_eq!(running.await.unwrap(), "blocker");
    assert_eq!(queued.await.unwrap(), "queued");
    assert!(pool.await_termination(Duration::from_secs(2)).await);
    assert!(pool.is_terminated());
}

#[tokio::test]
async fn shutdown_now_cancels_tasks_that_have_not_started() {
    let pool = pool_with(1, 16);

    let (release, task) = blocker();
    let running = pool.submit(task).await.unwrap();
    assert!(eventually(|| pool.stats().queued == 0).await);
    let queued = pool.submit(|| Ok::<_, BoxError>("never")).await.unwrap();

    assert_eq!(pool.shutdown_now(), 1);

    release.send(()).unwrap();
    assert_eq!(running.await.unwrap(), "blocker");
    assert!(matches!(queued.await, Err(Error::PoolShutdown)));
    assert!(pool.await_termination(Duration::from_secs(2)).await);
}

#[tokio::test]
async fn await_all_gives_up_at_the_deadline() {
    let pool = pool_with(2, 16);

    let (release, task) = blocker();
    let handles = vec![pool.submit(task).await.unwrap()];

    let err = WorkerPool::await_all(handles, Some(Duration::from_millis(30)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ExecuteTimeout(_)));

    release.send(()).unwrap();
}

#[tokio::test]
async fn await_all_stops_at_first_failure() {
    let pool = pool_with(2, 16);

    let (release, task) = blocker();
    let slow = pool.submit(task).await.unwrap();
    let failing = pool
        .submit(|| Err::<&'static str, BoxError>("broken".into()))
        .await
        .unwrap();

    let err = WorkerPool::await_all(vec![slow, failing], None)
        .await
        .unwrap_err();
    assert_eq!(err.cause().unwrap().to_string(), "broken");

    release.send(()).unwrap();
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[test]
fn pool_config_parses_toml_with_defaults() {
    let config = PoolConfig::from_toml_str(
        r#"
        [pool]
        core_size = 2
        max_size = 8
        shutdown_grace_secs = 5
        "#,
    )
    .unwrap();

    assert_eq!(config.core_size, 2);
    assert_eq!(config.max_size, 8);
    assert_eq!(config.shutdown_grace, Duration::from_secs(5));
    assert_eq!(config.queue_capacity, PoolConfig::default().queue_capacity);
}

#[test]
fn pool_config_rejects_max_below_core() {
    let result = PoolConfig::from_toml_str(
        r#"
        [pool]
        core_size = 8
        max_size = 2
        "#,
    );
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn empty_toml_yields_default_pool() {
    let config = PoolConfig::from_toml_str("").unwrap();
    assert_eq!(config.core_size, 4);
    assert_eq!(config.max_size, 16);
    assert_eq!(config.shutdown_grace, Duration::from_secs(60));
}
