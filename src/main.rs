use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures::future::join_all;
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use gcra_ratelimit::config::{GcraConfig, StoreBackend};
use gcra_ratelimit::store::{MemoryStore, RedisStore, StoreAdapter};
use gcra_ratelimit::{Limit, Limiter, RateLimitResult};

/// Exercise a GCRA limit against Redis or an in-process store.
#[derive(Parser, Debug)]
#[command(name = "gcra-ratelimit", version, about)]
struct Args {
    /// Configuration file (YAML). `GCRA__*` variables override it.
    #[arg(short, long)]
    config: Option<String>,

    /// Redis URL, overrides the configured one
    #[arg(long)]
    url: Option<String>,

    /// Use the in-process store instead of Redis
    #[arg(long)]
    memory: bool,

    /// Key to limit
    #[arg(short, long, default_value = "demo:gcra")]
    key: String,

    /// Units per second
    #[arg(long, default_value_t = 3)]
    rate: i64,

    /// Burst capacity
    #[arg(long, default_value_t = 3)]
    burst: i64,

    /// Use a named limit from the configuration instead of --rate/--burst
    #[arg(short, long)]
    limit: Option<String>,

    /// Sequential requests to issue
    #[arg(short = 'n', long, default_value_t = 5)]
    requests: usize,

    /// Also fire this many simultaneous requests
    #[arg(long, default_value_t = 0)]
    concurrent: usize,

    /// Print results as JSON lines
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = GcraConfig::load(args.config.as_deref())?;
    if args.memory {
        config.store.backend = StoreBackend::Memory;
    }
    if let Some(url) = &args.url {
        config.store.url = url.clone();
    }
    config.validate()?;

    let limit = match &args.limit {
        Some(name) => config
            .limits
            .limit(name)
            .ok_or_else(|| anyhow::anyhow!("no limit named '{}' in configuration", name))?,
        None => Limit::per_second(args.rate, args.burst),
    };
    info!(backend = ?config.store.backend, limit = %limit, key = %args.key, "Configuration loaded");

    match config.store.backend {
        StoreBackend::Memory => {
            let store = Arc::new(MemoryStore::new());
            run(Limiter::with_prefix(store, config.store.key_prefix.as_str()), limit, &args).await
        }
        StoreBackend::Redis => {
            let store = Arc::new(RedisStore::connect_with_config(&config.store).await?);
            run(Limiter::with_prefix(store, config.store.key_prefix.as_str()), limit, &args).await
        }
    }
}

async fn run<S: StoreAdapter>(limiter: Limiter<S>, limit: Limit, args: &Args) -> anyhow::Result<()> {
    limiter.ping().await?;
    limiter.reset(&args.key).await?;

    for i in 1..=args.requests {
        let result = limiter.allow(&args.key, limit).await?;
        report(args, &format!("request {}", i), &result);
    }

    let result = limiter.allow_n(&args.key, limit, 5).await?;
    report(args, "allow_n(5)", &result);

    tokio::time::sleep(Duration::from_secs(1)).await;
    let result = limiter.allow(&args.key, limit).await?;
    report(args, "after 1s", &result);

    if args.concurrent > 0 {
        limiter.reset(&args.key).await?;
        let calls = (0..args.concurrent).map(|_| limiter.allow(&args.key, limit));
        let results = join_all(calls).await;

        let mut admitted = 0;
        for (i, result) in results.into_iter().enumerate() {
            let result = result?;
            if result.is_allowed() {
                admitted += 1;
            }
            report(args, &format!("concurrent {}", i + 1), &result);
        }
        info!(
            admitted = admitted,
            total = args.concurrent,
            "Concurrent requests finished"
        );
    }

    if let Some(reset) = limiter.peek(&args.key).await? {
        info!(reset_after = ?reset, "Key state remaining");
    }

    limiter.store().close().await?;
    Ok(())
}

fn report(args: &Args, label: &str, result: &RateLimitResult) {
    if args.json {
        let line = json!({
            "label": label,
            "key": args.key,
            "allowed": result.allowed,
            "remaining": result.remaining,
            "retry_after": result.retry_after.map(|d| d.as_secs_f64()),
            "reset_after": result.reset_after.map(|d| d.as_secs_f64()),
        });
        println!("{}", line);
    } else {
        println!(
            "{:<14} allowed={} remaining={} retry_after={:?} reset_after={:?}",
            label, result.allowed, result.remaining, result.retry_after, result.reset_after
        );
    }
}
