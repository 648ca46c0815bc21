//! Info command - show the resolved configuration.

use codedocs_local_runtime::{paths, RuntimeConfig};

pub(crate) fn run(config: &RuntimeConfig) -> miette::Result<()> {
    println!("Codedocs Local Runtime");
    println!("======================");
    println!();
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!();

    println!("Data directory:   {}", paths::codedocs_data_dir().display());
    println!("Models directory: {}", config.models_dir.display());
    println!("  Exists: {}", config.models_dir.is_dir());
    println!();

    println!("Runtime binary:   {}", config.runtime_binary.display());
    println!("  Exists: {}", config.runtime_binary.is_file());
    if !config.binary_args.is_empty() {
        println!("  Args:   {}", config.binary_args.join(" "));
    }
    println!();

    println!("Runtime port:     {}", config.runtime_port);
    println!("Server port:      {}", config.server_port);
    println!("Port scan width:  {}", config.port_scan_attempts);
    println!();

    println!("Required models:");
    if config.required_models.is_empty() {
        println!("  (none)");
    }
    for model in &config.required_models {
        println!("  - {}", model);
    }
    println!();

    println!("Timeouts:");
    println!("  Startup:        {:?}", config.startup_timeout);
    println!("  Poll interval:  {:?}", config.ready_poll_interval);
    println!("  Shutdown grace: {:?}", config.shutdown_grace);
    println!("  Kill:           {:?}", config.kill_timeout);

    Ok(())
}
