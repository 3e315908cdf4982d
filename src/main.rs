//! blockwatch binary.
//!
//! Environment Variables:
//!   ETH_NODE_WSS   - WebSocket endpoint of the block source (required)
//!   ETH_TRACE_HTTP - Auxiliary JSON-RPC endpoint for diagnostic traces
//!   BLOCKWATCH_*   - Timer and feature overrides (see config module)

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use dotenv::dotenv;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use blockwatch::{
    config::WatcherConfig,
    manager::ConnectionLifecycleManager,
    pipeline::BlockEventPipeline,
    rpc::{HttpRpcClient, TraceRpc},
    transport::WsTransportFactory,
};

#[derive(Parser, Debug)]
#[command(name = "blockwatch")]
#[command(about = "Keeps a block subscription alive and reports receive latency")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", env = "BLOCKWATCH_LOG_LEVEL")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let args = Args::parse();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = WatcherConfig::from_env()?;
    config.validate()?;

    let trace: Option<Arc<dyn TraceRpc>> =
        match (config.trace_enabled, config.trace_http_url.as_deref()) {
            (true, Some(url)) => Some(Arc::new(HttpRpcClient::new(url.to_string())?)),
            _ => None,
        };

    let pipeline = Arc::new(BlockEventPipeline::new(trace));
    let factory = WsTransportFactory::new(config.ws_url.clone());
    let mut manager = ConnectionLifecycleManager::new(config, factory, pipeline);

    info!("starting block watcher");

    // `run` only returns once the reconnect budget is spent; whether that
    // kills the process is the supervisor's call, ours is just to exit
    // non-zero.
    if let Err(e) = manager.run().await {
        error!(error = %e, "watcher stopped");
        return Err(e);
    }

    Ok(())
}
