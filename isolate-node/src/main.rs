use anyhow::anyhow;
use isolate_runtime_wasm::{apply_resource_limits, EngineContext};
use log::{info, warn};

mod config;
mod jobs;
mod service_loop;

use config::NodeConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = NodeConfig::load()?;
    info!("Isolated worker starting (pid {})", std::process::id());

    // Limits are best effort; the worker still serves jobs without them.
    if !apply_resource_limits(config.memory_limit_bytes, config.cpu_time_seconds) {
        warn!("Running without a CPU ceiling");
    }

    let context = EngineContext::init(&config.harness).map_err(|e| anyhow!("engine init failed: {e}"))?;

    service_loop::run_ipc_server(context, config).await
}
