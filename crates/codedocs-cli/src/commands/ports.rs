//! Ports command - show which ports would be used.

use codedocs_local_runtime::{LocalRuntime, PortLease, PortNegotiator, RuntimeConfig};

use super::report;

pub(crate) fn run(config: &RuntimeConfig) -> miette::Result<()> {
    let runtime_lease = PortNegotiator::new()
        .reserve(config.runtime_port, config.port_scan_attempts)
        .map_err(|e| report("Failed to reserve runtime port", e))?;

    let server_lease = LocalRuntime::new(config.clone())
        .server_lease()
        .map_err(|e| report("Failed to reserve server port", e))?;

    print_lease("Runtime", runtime_lease);
    print_lease("Server", server_lease);
    Ok(())
}

fn print_lease(role: &str, lease: PortLease) {
    if lease.diverged() {
        println!("{:<8} {} (preferred {} in use)", role, lease.bound, lease.requested);
    } else {
        println!("{:<8} {}", role, lease.bound);
    }
}
