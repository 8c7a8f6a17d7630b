use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use quota_limiter::config::LimiterConfig;
use quota_limiter::limit::{
    PeriodFailureLimit, PeriodFailureLimitManager, PeriodLimit, PeriodLimitManager, TokenLimit,
};
use quota_limiter::store::MemoryStore;

/// Drive the limiters against an in-process store and log every decision.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path to a YAML limiter configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of requests to simulate
    #[arg(short = 'n', long, default_value_t = 10)]
    requests: usize,

    /// Caller key to limit
    #[arg(short, long, default_value = "demo")]
    key: String,

    /// Driver kind to route through
    #[arg(long, default_value = "memory")]
    kind: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = match &args.config {
        Some(path) => LimiterConfig::from_file(path)?,
        None => LimiterConfig::default(),
    };
    info!(config = ?config, "Configuration loaded");

    let store = Arc::new(MemoryStore::new());

    let periods = PeriodLimitManager::new();
    periods.register(
        args.kind.clone(),
        Arc::new(PeriodLimit::new(store.clone(), config.period.to_options())),
    )?;
    let failures = PeriodFailureLimitManager::new();
    failures.register(
        args.kind.clone(),
        Arc::new(PeriodFailureLimit::new(store.clone(), config.period_failure.to_options())),
    )?;
    let (rate, burst) = config.token.rate_and_burst()?;
    let tokens = TokenLimit::new(rate, burst, &config.token.key, store.clone());

    let period = periods.acquire(&args.kind);
    let failure = failures.acquire(&args.kind);
    for i in 1..=args.requests {
        let state = period.take(&args.key).await?;
        // Every third attempt succeeds
        let outcome = failure.check(&args.key, i % 3 == 0).await?;
        let allowed = tokens.allow().await;
        info!(
            request = i,
            period = ?state,
            failure = ?outcome,
            token_allowed = allowed,
            "Decision made"
        );
    }

    let run_value = period.get_run_value(&args.key).await?;
    info!(
        exist = run_value.exist,
        count = run_value.count,
        ttl = ?run_value.ttl,
        "Final period counter"
    );
    Ok(())
}
