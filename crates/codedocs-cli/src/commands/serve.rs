//! Serve command - keep the runtime running until interrupted.

use std::time::Duration;

use codedocs_local_runtime::{LocalRuntime, PortLease, RuntimeConfig};
use tracing::warn;

use super::models::{follow, OutputFormat};
use super::{report, start, with_runtime};

const HEALTH_INTERVAL: Duration = Duration::from_secs(5);

pub(crate) async fn run(config: RuntimeConfig, ensure_models: bool) -> miette::Result<()> {
    let runtime = LocalRuntime::new(config);

    let server = runtime
        .server_lease()
        .map_err(|e| report("Failed to reserve server port", e))?;

    with_runtime(&runtime, serve(&runtime, server, ensure_models)).await
}

async fn serve(runtime: &LocalRuntime, server: PortLease, ensure_models: bool) -> miette::Result<()> {
    let handle = start(runtime).await?;

    println!("Runtime ready");
    println!("  URL:         {}", handle.base_url);
    println!("  PID:         {}", handle.pid);
    println!("  Server port: {}", server.bound);
    if server.diverged() {
        println!("               (port {} was in use)", server.requested);
    }
    println!();

    if ensure_models {
        let stream = runtime
            .ensure_required_models()
            .await
            .map_err(|e| report("Failed to start installation", e))?;
        if let Err(e) = follow(stream, OutputFormat::Text).await {
            eprintln!("{}", e);
        }
        println!();
    }

    println!("Press Ctrl-C to stop.");
    let mut ticker = tokio::time::interval(HEALTH_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                if !runtime.is_healthy().await {
                    warn!("Runtime on port {} is not answering", handle.port());
                }
            }
        }
    }

    println!("Stopping runtime...");
    Ok(())
}
