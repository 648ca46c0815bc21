//! Status command - start the runtime, probe it and report.

use codedocs_local_runtime::{LocalRuntime, RuntimeConfig};

use super::{start, with_runtime};

pub(crate) async fn run(config: RuntimeConfig, json: bool) -> miette::Result<()> {
    let runtime = LocalRuntime::new(config);

    with_runtime(&runtime, report_status(&runtime, json)).await
}

async fn report_status(runtime: &LocalRuntime, json: bool) -> miette::Result<()> {
    let handle = start(runtime).await?;
    let healthy = runtime.is_healthy().await;
    let status = runtime.status();

    if json {
        let value = serde_json::json!({
            "status": status,
            "healthy": healthy,
            "handle": handle,
        });
        let text = serde_json::to_string_pretty(&value)
            .map_err(|e| miette::miette!("Failed to encode status: {}", e))?;
        println!("{}", text);
        return Ok(());
    }

    println!("State:   {}", status.state);
    println!("Healthy: {}", healthy);
    println!("URL:     {}", handle.base_url);
    println!("PID:     {}", handle.pid);
    println!("Port:    {}", handle.port());
    if handle.lease.diverged() {
        println!("         (requested {})", handle.lease.requested);
    }
    Ok(())
}
