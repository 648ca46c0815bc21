//! Model management commands.

use codedocs_local_runtime::{InstallStream, LocalRuntime, ProgressEvent, RuntimeConfig};

use super::{report, start, with_runtime};

/// How install progress is printed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutputFormat {
    Text,
    Sse,
    Json,
}

impl OutputFormat {
    pub(crate) fn from_flags(sse: bool, json: bool) -> Self {
        match (sse, json) {
            (true, _) => OutputFormat::Sse,
            (_, true) => OutputFormat::Json,
            _ => OutputFormat::Text,
        }
    }

    fn render(self, event: &ProgressEvent) -> String {
        match self {
            OutputFormat::Text => match event {
                ProgressEvent::Progress { line, .. } => format!("  {}", line),
                other => other.message(),
            },
            OutputFormat::Sse => event.to_sse().trim_end_matches('\n').to_string() + "\n",
            OutputFormat::Json => serde_json::to_string(event).unwrap_or_else(|_| event.message()),
        }
    }
}

fn requested_or_required(config: &RuntimeConfig, models: Vec<String>) -> Vec<String> {
    if models.is_empty() {
        config.required_models.clone()
    } else {
        models
    }
}

/// List installed models.
pub(crate) async fn list(config: RuntimeConfig) -> miette::Result<()> {
    let models_dir = config.models_dir.clone();
    let runtime = LocalRuntime::new(config);

    let models = with_runtime(&runtime, async {
        start(&runtime).await?;
        runtime
            .list_installed()
            .await
            .map_err(|e| report("Failed to list models", e))
    })
    .await?;

    if models.is_empty() {
        println!("No models installed.");
        println!();
        println!("To install the required models, run:");
        println!("  codedocs models install");
        return Ok(());
    }

    println!("Installed models:");
    for model in models {
        println!("  - {}", model);
    }

    println!();
    println!("Models directory: {}", models_dir.display());

    Ok(())
}

/// Report which of the requested models are missing.
pub(crate) async fn check(config: RuntimeConfig, models: Vec<String>) -> miette::Result<()> {
    let requested = requested_or_required(&config, models);
    let runtime = LocalRuntime::new(config);

    let missing = with_runtime(&runtime, async {
        start(&runtime).await?;
        runtime
            .diff_missing(&requested)
            .await
            .map_err(|e| report("Failed to list models", e))
    })
    .await?;

    if missing.is_empty() {
        println!("All {} model(s) are installed.", requested.len());
        return Ok(());
    }

    println!("Missing models:");
    for model in &missing {
        println!("  - {}", model);
    }
    Err(miette::miette!("{} model(s) missing", missing.len()))
}

/// Install the requested models, printing progress as it arrives.
pub(crate) async fn install(
    config: RuntimeConfig,
    models: Vec<String>,
    format: OutputFormat,
) -> miette::Result<()> {
    let requested = requested_or_required(&config, models);
    let runtime = LocalRuntime::new(config);

    with_runtime(&runtime, async {
        start(&runtime).await?;
        let stream = runtime
            .install_sequential(&requested)
            .await
            .map_err(|e| report("Failed to start installation", e))?;
        follow(stream, format).await
    })
    .await
}

/// Print every event of `stream` until it ends. Ctrl-C cancels the job.
pub(crate) async fn follow(mut stream: InstallStream, format: OutputFormat) -> miette::Result<()> {
    let mut cancelling = false;
    let mut last = None;

    loop {
        tokio::select! {
            event = stream.recv() => match event {
                Some(event) => {
                    println!("{}", format.render(&event));
                    last = Some(event);
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c(), if !cancelling => {
                eprintln!("Cancelling installation...");
                stream.cancel();
                cancelling = true;
            }
        }
    }

    match last {
        Some(ProgressEvent::BatchComplete { summary }) if summary.failed.is_empty() => Ok(()),
        Some(ProgressEvent::BatchComplete { summary }) => Err(miette::miette!(
            "Failed to install: {}",
            summary.failed.join(", ")
        )),
        Some(ProgressEvent::Cancelled) => Err(miette::miette!("Installation cancelled")),
        _ => Err(miette::miette!("Installation ended unexpectedly")),
    }
}
