//! Installed-model inventory and the runtime's model capability.

use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::OllamaClient;
use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use crate::text::LineSplitter;

/// How a single pull ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullOutcome {
    Succeeded,
    Failed(String),
    Cancelled,
}

/// What the rest of the system may ask of the runtime about models.
///
/// Implementations hide how the runtime is driven (HTTP, child processes);
/// callers only see identifiers and raw output lines.
#[async_trait]
pub trait ModelCatalog: Send + Sync {
    /// Identifiers of every installed model.
    async fn list_installed(&self) -> Result<BTreeSet<String>>;

    /// Pull one model, sending its raw output lines to `lines`.
    ///
    /// Lines keep their order within stdout and within stderr; how the two
    /// streams interleave is not guaranteed.
    ///
    /// Returns once the pull has finished and all of its output was sent.
    /// When `cancel` fires the pull is aborted and `Cancelled` returned.
    async fn pull(
        &self,
        model: &str,
        lines: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Result<PullOutcome>;
}

/// [`ModelCatalog`] backed by a running Ollama instance.
///
/// Listing goes through the HTTP catalog; pulls run `ollama pull` as a child
/// process against the same port and model directory.
pub struct OllamaCatalog {
    client: OllamaClient,
    binary: PathBuf,
    binary_args: Vec<String>,
    env: Vec<(&'static str, String)>,
    kill_timeout: Duration,
    drain_timeout: Duration,
}

impl OllamaCatalog {
    /// Catalog for a runtime listening on `port`.
    pub fn new(config: &RuntimeConfig, port: u16) -> Self {
        Self {
            client: OllamaClient::with_port(port),
            binary: config.runtime_binary.clone(),
            binary_args: config.binary_args.clone(),
            env: config.runtime_env(port),
            kill_timeout: config.kill_timeout,
            drain_timeout: config.output_drain_timeout,
        }
    }

    /// Replace the HTTP client, e.g. to point at another host.
    pub fn with_client(mut self, client: OllamaClient) -> Self {
        self.client = client;
        self
    }
}

#[async_trait]
impl ModelCatalog for OllamaCatalog {
    async fn list_installed(&self) -> Result<BTreeSet<String>> {
        Ok(self.client.list_models().await?.into_iter().collect())
    }

    async fn pull(
        &self,
        model: &str,
        lines: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Result<PullOutcome> {
        let mut child = Command::new(&self.binary)
            .args(&self.binary_args)
            .arg("pull")
            .arg(model)
            .envs(self.env.iter().map(|(k, v)| (*k, v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RuntimeError::SpawnFailed(format!("pull {}: {}", model, e)))?;

        debug!("Pulling {} (PID: {:?})", model, child.id());

        // One reader per stream, both feeding the same channel.
        let mut readers: Vec<JoinHandle<()>> = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(forward_lines(stdout, lines.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(forward_lines(stderr, lines.clone())));
        }
        drop(lines);

        let status = tokio::select! {
            status = child.wait() => Some(status?),
            _ = cancel.cancelled() => None,
        };

        let outcome = match status {
            None => {
                debug!("Cancelling pull of {}", model);
                let _ = child.start_kill();
                if timeout(self.kill_timeout, child.wait()).await.is_err() {
                    warn!("Pull of {} did not exit after kill", model);
                }
                PullOutcome::Cancelled
            }
            Some(status) if status.success() => PullOutcome::Succeeded,
            Some(status) => PullOutcome::Failed(format!("pull exited with {}", status)),
        };

        for mut reader in readers {
            if timeout(self.drain_timeout, &mut reader).await.is_err() {
                warn!("Output of pull {} still open after exit, dropping it", model);
                reader.abort();
            }
        }

        Ok(outcome)
    }
}

/// Read `source` to EOF, sending every complete line.
pub(crate) async fn forward_lines<R>(mut source: R, lines: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut splitter = LineSplitter::new();
    let mut buf = [0u8; 4096];

    loop {
        let n = match source.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for line in splitter.push(&buf[..n]) {
            if lines.send(line).await.is_err() {
                return;
            }
        }
    }

    if let Some(line) = splitter.finish() {
        let _ = lines.send(line).await;
    }
}

/// Canonical form of a model identifier: trimmed, with `:latest` added when
/// the name carries no tag.
pub fn canonical_model_name(name: &str) -> String {
    let name = name.trim();
    let last_segment = name.rsplit('/').next().unwrap_or(name);
    if last_segment.contains(':') {
        name.to_string()
    } else {
        format!("{}:latest", name)
    }
}

/// Drop blanks and duplicates (first occurrence wins), keeping order.
pub fn dedupe_models<I, S>(requested: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    requested
        .into_iter()
        .map(|m| m.as_ref().trim().to_string())
        .filter(|m| !m.is_empty())
        .filter(|m| seen.insert(canonical_model_name(m)))
        .collect()
}

/// Whether `model` is in `installed`, comparing canonical names.
pub fn is_installed(model: &str, installed: &BTreeSet<String>) -> bool {
    let wanted = canonical_model_name(model);
    installed.iter().any(|m| canonical_model_name(m) == wanted)
}

/// Requested models that are not installed, deduplicated, in request order.
pub fn missing_models<I, S>(requested: I, installed: &BTreeSet<String>) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let installed: HashSet<String> = installed.iter().map(|m| canonical_model_name(m)).collect();
    dedupe_models(requested)
        .into_iter()
        .filter(|m| !installed.contains(&canonical_model_name(m)))
        .collect()
}

/// Read side of model management.
#[derive(Clone)]
pub struct Inventory {
    catalog: Arc<dyn ModelCatalog>,
}

impl Inventory {
    /// Create an inventory over a catalog.
    pub fn new(catalog: Arc<dyn ModelCatalog>) -> Self {
        Self { catalog }
    }

    /// Ask the runtime which models are installed.
    pub async fn list_installed(&self) -> Result<BTreeSet<String>> {
        self.catalog.list_installed().await
    }

    /// Requested models the runtime does not have yet.
    pub async fn diff_missing<S: AsRef<str>>(&self, requested: &[S]) -> Result<Vec<String>> {
        let installed = self.list_installed().await?;
        Ok(missing_models(requested, &installed))
    }
}
