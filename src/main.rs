//! Legion Core - Entry Point
//!
//! Starts a coordinator with an echo agent, prints its health and metrics,
//! then runs until Ctrl-C.

use legion_core::{BoundedExecutor, Config, Coordinator, EchoAgent};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Parse args
    let args: Vec<String> = std::env::args().collect();
    let json_logs = args.iter().any(|a| a == "--json" || a == "-j");
    let help_mode = args.iter().any(|a| a == "--help" || a == "-h");

    if help_mode {
        println!("Legion Core v{}", env!("CARGO_PKG_VERSION"));
        println!();
        println!("Usage: legion-core [OPTIONS]");
        println!();
        println!("Options:");
        println!("  --json, -j   Log to stderr as JSON");
        println!("  --help, -h   Show this help");
        println!();
        println!("Environment variables:");
        println!("  LEGION_ENABLE_TASK_QUEUE       Queue unmatched tasks (default: true)");
        println!("  LEGION_TASK_QUEUE_CAPACITY     Pending queue bound (default: 10000)");
        println!("  LEGION_REUSE_CACHED_RESULTS    Serve repeated task ids from cache (default: true)");
        println!("  LEGION_MAX_CONCURRENT_TASKS    Executor admission slots (default: 100)");
        println!("  LEGION_RESULT_CACHE_SIZE       Cached results kept (default: 1000)");
        println!("  LEGION_TASK_TTL_SECS           Task bookkeeping TTL (default: 3600)");
        println!("  LEGION_TASK_TIMEOUT_SECS       Per-task timeout (default: 300)");
        println!("  LEGION_CLEANUP_INTERVAL_SECS   Reclamation period (default: 300)");
        println!("  RUST_LOG                       Log filter (default: info)");
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json_logs {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_ansi(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    info!("Legion Core v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    let executor = Arc::new(BoundedExecutor::new(&config.executor)?);
    let coordinator = Coordinator::with_executor(config.coordinator.clone(), executor)?;

    coordinator.register_agent("echo", Arc::new(EchoAgent::new("echo")), ["echo"])?;

    let startup = coordinator.start_async().await;
    if !startup.is_clean() {
        warn!("Some agents failed to start: {:?}", startup.failed);
    }

    info!("Health: {}", serde_json::to_string(&coordinator.get_health())?);
    info!("Metrics: {}", serde_json::to_string(&coordinator.get_metrics())?);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    let report = coordinator.stop_async().await;
    if !report.is_clean() {
        warn!("Some agents failed to stop: {:?}", report.failed);
    }

    Ok(())
}
