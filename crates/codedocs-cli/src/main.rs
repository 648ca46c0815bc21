//! Codedocs CLI - operate the local inference runtime.

use clap::{Parser, Subcommand};
use codedocs_local_runtime::RuntimeConfig;
use std::path::PathBuf;

mod commands;

/// Codedocs - manage the local runtime and its models
#[derive(Parser)]
#[command(name = "codedocs")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Runtime binary (default: OLLAMA_PATH, then `ollama` on PATH)
    #[arg(long, global = true)]
    binary: Option<PathBuf>,

    /// Preferred runtime port
    #[arg(long, global = true)]
    runtime_port: Option<u16>,

    /// Preferred API server port
    #[arg(long, global = true)]
    server_port: Option<u16>,

    /// Model storage directory
    #[arg(long, global = true)]
    models_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the runtime and keep it running until Ctrl-C
    Serve {
        /// Install the required models once the runtime is ready
        #[arg(long)]
        ensure_models: bool,
    },

    /// Start the runtime, report its health, then stop it
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show which ports the runtime and the API server would get
    Ports,

    /// Manage models
    Models {
        #[command(subcommand)]
        command: ModelsCommand,
    },

    /// Show the resolved configuration
    Info,
}

#[derive(Subcommand)]
enum ModelsCommand {
    /// List installed models
    List,

    /// Show which models are missing (default: the required models)
    Check {
        /// Models to check
        models: Vec<String>,
    },

    /// Install missing models (default: the required models)
    Install {
        /// Models to install
        models: Vec<String>,
        /// Print progress as server-sent-event frames
        #[arg(long, conflicts_with = "json")]
        sse: bool,
        /// Print progress as JSON lines
        #[arg(long)]
        json: bool,
    },
}

impl Cli {
    fn runtime_config(&self) -> RuntimeConfig {
        let mut config = RuntimeConfig::from_env();
        if let Some(binary) = &self.binary {
            config.runtime_binary = binary.clone();
        }
        if let Some(port) = self.runtime_port {
            config.runtime_port = port;
        }
        if let Some(port) = self.server_port {
            config.server_port = port;
        }
        if let Some(dir) = &self.models_dir {
            config.models_dir = dir.clone();
        }
        config
    }
}

fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.verbose { "debug" } else { "warn" };
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .without_time()
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();

    let config = cli.runtime_config();

    let rt = tokio::runtime::Runtime::new()
        .map_err(|e| miette::miette!("Failed to create async runtime: {}", e))?;

    rt.block_on(async move {
        match cli.command {
            Commands::Serve { ensure_models } => commands::serve::run(config, ensure_models).await,
            Commands::Status { json } => commands::status::run(config, json).await,
            Commands::Ports => commands::ports::run(&config),
            Commands::Models { command } => match command {
                ModelsCommand::List => commands::models::list(config).await,
                ModelsCommand::Check { models } => commands::models::check(config, models).await,
                ModelsCommand::Install { models, sse, json } => {
                    let format = commands::models::OutputFormat::from_flags(sse, json);
                    commands::models::install(config, models, format).await
                }
            },
            Commands::Info => commands::info::run(&config),
        }
    })
}
