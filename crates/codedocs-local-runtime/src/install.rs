//! Sequential, failure-isolated model installation.
//!
//! A job pulls each missing model in order through a [`ModelCatalog`],
//! forwarding cleaned output as [`ProgressEvent`]s. One model failing never
//! stops the batch; only cancellation does. Jobs sharing a [`JobGate`] never
//! run at the same time.

use std::collections::BTreeSet;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, RuntimeError};
use crate::events::{InstallSummary, ProgressEvent};
use crate::inventory::{dedupe_models, is_installed, ModelCatalog, PullOutcome};
use crate::text::strip_control_sequences;

const EVENT_BUFFER: usize = 32;
const LINE_BUFFER: usize = 64;

/// Installation state of one model within a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallStatus {
    Pending,
    Installing,
    Installed,
    Failed,
}

impl InstallStatus {
    /// Forward-only transitions. `Pending → Installed` covers models that
    /// were already present.
    pub fn can_transition_to(self, next: InstallStatus) -> bool {
        use InstallStatus::*;
        matches!(
            (self, next),
            (Pending, Installing) | (Pending, Installed) | (Installing, Installed) | (Installing, Failed)
        )
    }
}

/// One model of an installation job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRecord {
    pub identifier: String,
    pub installed: bool,
    pub status: InstallStatus,
}

impl ModelRecord {
    fn new(identifier: String) -> Self {
        Self {
            identifier,
            installed: false,
            status: InstallStatus::Pending,
        }
    }

    fn advance(&mut self, next: InstallStatus) {
        if self.status.can_transition_to(next) {
            self.status = next;
            self.installed = next == InstallStatus::Installed;
        } else {
            warn!(
                "Ignoring install status change {:?} -> {:?} for {}",
                self.status, next, self.identifier
            );
        }
    }
}

/// Single-flight guard over the model storage directory.
///
/// Waiters are served in arrival order.
#[derive(Debug, Clone, Default)]
pub struct JobGate(Arc<Mutex<()>>);

impl JobGate {
    /// Create an open gate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a job currently holds the gate.
    pub fn is_busy(&self) -> bool {
        self.0.try_lock().is_err()
    }

    async fn enter(&self) -> OwnedMutexGuard<()> {
        self.0.clone().lock_owned().await
    }

    fn try_enter(&self) -> Result<OwnedMutexGuard<()>> {
        self.0
            .clone()
            .try_lock_owned()
            .map_err(|_| RuntimeError::InstallInProgress)
    }
}

/// Runs installation jobs against a catalog.
#[derive(Clone)]
pub struct InstallPipeline {
    catalog: Arc<dyn ModelCatalog>,
    gate: JobGate,
}

impl InstallPipeline {
    /// Pipeline with its own gate.
    pub fn new(catalog: Arc<dyn ModelCatalog>) -> Self {
        Self {
            catalog,
            gate: JobGate::new(),
        }
    }

    /// Share a gate with other pipelines writing the same model directory.
    pub fn with_gate(mut self, gate: JobGate) -> Self {
        self.gate = gate;
        self
    }

    /// Install `requested` in order, waiting for any running job first.
    pub async fn install_sequential<S: AsRef<str>>(&self, requested: &[S]) -> InstallStream {
        let models = dedupe_models(requested);
        if self.gate.is_busy() {
            debug!("Installation queued behind a running job");
        }
        let permit = self.gate.enter().await;
        self.launch(permit, models)
    }

    /// Like [`install_sequential`](Self::install_sequential) but fails with
    /// [`RuntimeError::InstallInProgress`] instead of waiting.
    pub fn try_install_sequential<S: AsRef<str>>(&self, requested: &[S]) -> Result<InstallStream> {
        let permit = self.gate.try_enter()?;
        Ok(self.launch(permit, dedupe_models(requested)))
    }

    fn launch(&self, permit: OwnedMutexGuard<()>, models: Vec<String>) -> InstallStream {
        let (events, rx) = mpsc::channel(EVENT_BUFFER);
        let cancel = CancellationToken::new();

        let job = InstallJob {
            catalog: self.catalog.clone(),
            records: models.into_iter().map(ModelRecord::new).collect(),
            summary: InstallSummary::default(),
            events,
            cancel: cancel.clone(),
        };

        tokio::spawn(async move {
            let _permit = permit;
            job.run().await;
        });

        InstallStream { rx, cancel }
    }
}

struct InstallJob {
    catalog: Arc<dyn ModelCatalog>,
    records: Vec<ModelRecord>,
    summary: InstallSummary,
    events: mpsc::Sender<ProgressEvent>,
    cancel: CancellationToken,
}

impl InstallJob {
    async fn run(mut self) {
        info!("Installing {} model(s)", self.records.len());

        let installed = match self.catalog.list_installed().await {
            Ok(installed) => installed,
            Err(e) => {
                warn!("Could not list installed models, pulling all: {}", e);
                BTreeSet::new()
            }
        };

        for idx in 0..self.records.len() {
            if self.cancel.is_cancelled() {
                self.finish_cancelled().await;
                return;
            }

            let model = self.records[idx].identifier.clone();

            if is_installed(&model, &installed) {
                self.records[idx].advance(InstallStatus::Installed);
                self.summary.already_present.push(model.clone());
                if !self.emit(ProgressEvent::AlreadyPresent { model }).await {
                    return;
                }
                continue;
            }

            self.records[idx].advance(InstallStatus::Installing);
            if !self.emit(ProgressEvent::InstallStarted { model: model.clone() }).await {
                return;
            }

            match self.pull_one(&model).await {
                Ok(PullOutcome::Succeeded) => {
                    info!("Installed model {}", model);
                    self.records[idx].advance(InstallStatus::Installed);
                    self.summary.installed.push(model.clone());
                    if !self.emit(ProgressEvent::InstallSucceeded { model }).await {
                        return;
                    }
                }
                Ok(PullOutcome::Cancelled) => {
                    self.records[idx].advance(InstallStatus::Failed);
                    self.finish_cancelled().await;
                    return;
                }
                Ok(PullOutcome::Failed(reason)) => {
                    if !self.fail(idx, model, reason).await {
                        return;
                    }
                }
                Err(e) => {
                    if !self.fail(idx, model, e.to_string()).await {
                        return;
                    }
                }
            }
        }

        info!(
            "Installation finished: {} installed, {} present, {} failed",
            self.summary.installed.len(),
            self.summary.already_present.len(),
            self.summary.failed.len()
        );
        let summary = std::mem::take(&mut self.summary);
        self.emit(ProgressEvent::BatchComplete { summary }).await;
    }

    /// Run one pull, forwarding its output until the pull and its output
    /// are both finished.
    async fn pull_one(&self, model: &str) -> Result<PullOutcome> {
        let (lines_tx, mut lines) = mpsc::channel(LINE_BUFFER);
        let pull = self.catalog.pull(model, lines_tx, self.cancel.child_token());
        tokio::pin!(pull);

        let outcome = loop {
            tokio::select! {
                biased;
                Some(line) = lines.recv() => self.forward(model, &line).await,
                outcome = &mut pull => break outcome,
            }
        };

        while let Some(line) = lines.recv().await {
            self.forward(model, &line).await;
        }

        outcome
    }

    async fn forward(&self, model: &str, raw: &str) {
        let cleaned = strip_control_sequences(raw);
        let line = cleaned.trim();
        if line.is_empty() {
            return;
        }
        let event = ProgressEvent::Progress {
            model: model.to_string(),
            line: line.to_string(),
        };
        self.emit(event).await;
    }

    async fn fail(&mut self, idx: usize, model: String, reason: String) -> bool {
        warn!("Failed to install model {}: {}", model, reason);
        self.records[idx].advance(InstallStatus::Failed);
        self.summary.failed.push(model.clone());
        self.emit(ProgressEvent::InstallFailed { model, reason }).await
    }

    async fn finish_cancelled(&self) {
        info!("Installation cancelled");
        self.emit(ProgressEvent::Cancelled).await;
    }

    /// Send an event; a vanished consumer cancels the job.
    async fn emit(&self, event: ProgressEvent) -> bool {
        if self.events.send(event).await.is_err() {
            self.cancel.cancel();
            return false;
        }
        true
    }
}

/// Finite, non-restartable stream of one job's progress.
///
/// Ends after [`ProgressEvent::BatchComplete`] or [`ProgressEvent::Cancelled`].
/// Dropping the stream cancels the job.
pub struct InstallStream {
    rx: mpsc::Receiver<ProgressEvent>,
    cancel: CancellationToken,
}

impl InstallStream {
    /// Next event, or `None` once the job has ended.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        self.rx.recv().await
    }

    /// Stop the job: kills the running pull and skips remaining models.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that cancels this job when triggered.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Stream for InstallStream {
    type Item = ProgressEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for InstallStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
