//! CLI commands.

pub mod info;
pub mod models;
pub mod ports;
pub mod serve;
pub mod status;

use codedocs_local_runtime::{LocalRuntime, RuntimeError, RuntimeHandle};

/// Convert a library error. Start failures already carry the runtime's
/// output in their message.
pub(crate) fn report(context: &str, err: RuntimeError) -> miette::Report {
    miette::miette!("{}: {}", context, err)
}

/// Start the runtime, printing where it listens.
pub(crate) async fn start(runtime: &LocalRuntime) -> miette::Result<RuntimeHandle> {
    let handle = runtime
        .start()
        .await
        .map_err(|e| report("Failed to start runtime", e))?;

    if handle.lease.diverged() {
        eprintln!(
            "Port {} is in use, runtime moved to {}",
            handle.lease.requested, handle.lease.bound
        );
    }
    Ok(handle)
}

/// Run `body` against a started runtime and always stop it afterwards.
pub(crate) async fn with_runtime<F, T>(runtime: &LocalRuntime, body: F) -> miette::Result<T>
where
    F: std::future::Future<Output = miette::Result<T>>,
{
    let result = body.await;
    runtime
        .stop()
        .await
        .map_err(|e| report("Failed to stop runtime", e))?;
    result
}
