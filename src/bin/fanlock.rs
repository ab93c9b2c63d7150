//! fanlock CLI: operator interface to lease locks and the batch engine.

use clap::{Parser, Subcommand};
use fanlock::config::Config;
use fanlock::db::Db;
use fanlock::engine::{Engine, PoolConfig, Reaper};
use fanlock::error::BoxError;
use fanlock::lock::{FnCallback, LockService};
use fanlock::telemetry::{TelemetryConfig, init_telemetry};
use secrecy::ExposeSecret;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

/// Exit code for `lock run` when the lock could not be taken (EX_TEMPFAIL).
const EXIT_NOT_ACQUIRED: u8 = 75;

#[derive(Parser)]
#[command(name = "fanlock", about = "Lease locks and fan-out batch execution")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Lease lock operations against the Postgres counter store
    Lock {
        #[command(subcommand)]
        action: LockAction,
    },
    /// Square 0..size across the worker pool and print the sorted result
    Fanout {
        /// Number of work items
        #[arg(long, default_value_t = 16)]
        size: usize,
        /// TOML file with a [pool] table
        #[arg(long)]
        pool_config: Option<PathBuf>,
        /// Aggregate timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

#[derive(Subcommand)]
enum LockAction {
    /// Try once to take a lock
    Acquire {
        key: String,
        /// Lease length in seconds
        #[arg(long, default_value_t = 10)]
        expire_secs: u64,
    },
    /// Delete a lock regardless of holder
    Release { key: String },
    /// Show the counter behind a lock
    Status {
        key: String,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run a command while holding a lock
    Run {
        key: String,
        /// Lease length in seconds
        #[arg(long, default_value_t = 60)]
        expire_secs: u64,
        /// Total acquisition attempts
        #[arg(long, default_value_t = 1)]
        tries: u32,
        /// Sleep between attempts in milliseconds
        #[arg(long, default_value_t = 10)]
        sleep_ms: u64,
        /// Command and arguments
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Lock { action } => {
            let config = Config::from_env()?;
            let _guard = init_telemetry(TelemetryConfig {
                endpoint: config.otel_endpoint.clone(),
                service_name: "fanlock".to_string(),
                log_level: config.log_level.clone(),
            })?;

            let db = Db::connect(config.database_url.expose_secret()).await?;
            db.migrate().await?;
            let locks = LockService::new(Arc::new(db));

            match action {
                LockAction::Acquire { key, expire_secs } => {
                    cmd_lock_acquire(&locks, &key, expire_secs).await
                }
                LockAction::Release { key } => cmd_lock_release(&locks, &key).await,
                LockAction::Status { key, json } => cmd_lock_status(&locks, &key, json).await,
                LockAction::Run {
                    key,
                    expire_secs,
                    tries,
                    sleep_ms,
                    command,
                } => cmd_lock_run(&locks, &key, expire_secs, tries, sleep_ms, command).await,
            }
        }
        Command::Fanout {
            size,
            pool_config,
            timeout_ms,
        } => cmd_fanout(size, pool_config, timeout_ms).await,
    }
}

async fn cmd_lock_acquire(
    locks: &LockService,
    key: &str,
    expire_secs: u64,
) -> anyhow::Result<ExitCode> {
    if locks.try_acquire(key, Duration::from_secs(expire_secs)).await {
        println!("Acquired: {key} (expires in {expire_secs}s)");
        Ok(ExitCode::SUCCESS)
    } else {
        println!("Not acquired: {key}");
        Ok(ExitCode::from(EXIT_NOT_ACQUIRED))
    }
}

async fn cmd_lock_release(locks: &LockService, key: &str) -> anyhow::Result<ExitCode> {
    if locks.release(key).await {
        println!("Released: {key}");
    } else {
        println!("Not held: {key}");
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_lock_status(
    locks: &LockService,
    key: &str,
    json: bool,
) -> anyhow::Result<ExitCode> {
    let record = locks.inspect(key).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&record)?);
        return Ok(ExitCode::SUCCESS);
    }

    match record {
        Some(record) => {
            println!("Key:      {}", record.key);
            println!("Counter:  {}", record.value);
            println!(
                "Expires:  {}",
                record
                    .expires_at
                    .map(|at| at.format("%Y-%m-%d %H:%M:%S%.3f UTC").to_string())
                    .unwrap_or_else(|| "never".to_string())
            );
        }
        None => println!("Not held: {key}"),
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_lock_run(
    locks: &LockService,
    key: &str,
    expire_secs: u64,
    tries: u32,
    sleep_ms: u64,
    command: Vec<String>,
) -> anyhow::Result<ExitCode> {
    let Some((program, args)) = command.split_first() else {
        anyhow::bail!("no command given");
    };

    let callback = FnCallback::new(
        |(program, args): (String, Vec<String>)| async move {
            let status = tokio::process::Command::new(&program)
                .args(&args)
                .status()
                .await?;
            let code = status.code().unwrap_or(1).clamp(0, 255) as u8;
            Ok::<_, anyhow::Error>(ExitCode::from(code))
        },
        |(program, _): (String, Vec<String>)| async move {
            eprintln!("lock {key} is held elsewhere, not running {program}");
            Ok::<_, anyhow::Error>(ExitCode::from(EXIT_NOT_ACQUIRED))
        },
    )
    .tries(tries)
    .retry_sleep(Duration::from_millis(sleep_ms));

    locks
        .execute_by_lock_with(
            key,
            Duration::from_secs(expire_secs),
            callback,
            (program.clone(), args.to_vec()),
        )
        .await
}

async fn cmd_fanout(
    size: usize,
    pool_config: Option<PathBuf>,
    timeout_ms: Option<u64>,
) -> anyhow::Result<ExitCode> {
    let config = match pool_config {
        Some(path) => PoolConfig::load(&path)?,
        None => PoolConfig::default(),
    };
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: std::env::var("OTEL_ENDPOINT").ok(),
        service_name: "fanlock".to_string(),
        log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
    })?;

    let reaper = Reaper::start()?;
    let engine = Engine::with_config(config, reaper.handle())?;

    let squares = engine
        .execute_merge_with_timeout(
            0..size as u64,
            |n: u64| Ok::<_, BoxError>(n * n),
            |mut squares: Vec<u64>| {
                squares.sort_unstable();
                squares
            },
            timeout_ms.map(Duration::from_millis),
        )
        .await?;

    println!("{squares:?}");

    engine.close();
    drop(engine);
    // Joining the reaper can wait out a whole grace period.
    tokio::task::spawn_blocking(move || reaper.shutdown()).await?;
    Ok(ExitCode::SUCCESS)
}
