//! Control surface over the runtime, its models and the API server port.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::watch;
use tracing::info;

use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use crate::install::{InstallPipeline, InstallStream, JobGate};
use crate::inventory::{Inventory, ModelCatalog, OllamaCatalog};
use crate::port::{PortLease, PortNegotiator};
use crate::supervisor::{RuntimeHandle, RuntimeState, RuntimeStatus, RuntimeSupervisor};

/// Everything the application needs from the local runtime.
///
/// Owns one [`RuntimeSupervisor`] and one installation gate, so there is at
/// most one runtime process and one installation job per instance. Model
/// operations need a `Ready` runtime.
pub struct LocalRuntime {
    supervisor: RuntimeSupervisor,
    catalog: Option<Arc<dyn ModelCatalog>>,
    gate: JobGate,
    ports: PortNegotiator,
    server_lease: StdMutex<Option<PortLease>>,
}

impl LocalRuntime {
    /// Create a control surface for the given configuration.
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            supervisor: RuntimeSupervisor::new(config),
            catalog: None,
            gate: JobGate::new(),
            ports: PortNegotiator::new(),
            server_lease: StdMutex::new(None),
        }
    }

    /// Create from environment variables.
    pub fn from_env() -> Self {
        Self::new(RuntimeConfig::from_env())
    }

    /// Use `catalog` for listing and pulls instead of the runtime's own.
    pub fn with_catalog(mut self, catalog: Arc<dyn ModelCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        self.supervisor.config()
    }

    pub fn supervisor(&self) -> &RuntimeSupervisor {
        &self.supervisor
    }

    /// Start the runtime (idempotent while it is healthy).
    pub async fn start(&self) -> Result<RuntimeHandle> {
        self.supervisor.start().await
    }

    /// Stop the runtime.
    pub async fn stop(&self) -> Result<()> {
        self.supervisor.stop().await
    }

    pub fn status(&self) -> RuntimeStatus {
        self.supervisor.status()
    }

    pub fn subscribe(&self) -> watch::Receiver<RuntimeStatus> {
        self.supervisor.subscribe()
    }

    pub async fn is_healthy(&self) -> bool {
        self.supervisor.is_healthy().await
    }

    /// Models installed in the runtime.
    pub async fn list_installed(&self) -> Result<BTreeSet<String>> {
        Inventory::new(self.catalog()?).list_installed().await
    }

    /// Requested models that are not installed yet, in request order.
    pub async fn diff_missing<S: AsRef<str>>(&self, requested: &[S]) -> Result<Vec<String>> {
        Inventory::new(self.catalog()?).diff_missing(requested).await
    }

    /// Install `requested`, queueing behind a running job.
    pub async fn install_sequential<S: AsRef<str>>(&self, requested: &[S]) -> Result<InstallStream> {
        Ok(self.pipeline()?.install_sequential(requested).await)
    }

    /// Install `requested`, failing with `InstallInProgress` if a job runs.
    pub fn try_install_sequential<S: AsRef<str>>(&self, requested: &[S]) -> Result<InstallStream> {
        self.pipeline()?.try_install_sequential(requested)
    }

    /// Install the configured required models.
    pub async fn ensure_required_models(&self) -> Result<InstallStream> {
        let required = self.config().required_models.clone();
        self.install_sequential(&required).await
    }

    /// Port for the API server, reserved on first call and reused after.
    pub fn server_lease(&self) -> Result<PortLease> {
        let mut cached = self.server_lease.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(lease) = *cached {
            return Ok(lease);
        }

        let config = self.config();
        let lease = self
            .ports
            .reserve(config.server_port, config.port_scan_attempts)?;
        if lease.diverged() {
            info!(
                "Server port {} is in use, using {} instead",
                lease.requested, lease.bound
            );
        }
        *cached = Some(lease);
        Ok(lease)
    }

    fn catalog(&self) -> Result<Arc<dyn ModelCatalog>> {
        let port = match self.supervisor.status() {
            RuntimeStatus {
                state: RuntimeState::Ready,
                bound_port: Some(port),
                ..
            } => port,
            _ => return Err(RuntimeError::RuntimeNotReady),
        };

        Ok(match &self.catalog {
            Some(catalog) => catalog.clone(),
            None => Arc::new(OllamaCatalog::new(self.config(), port)),
        })
    }

    fn pipeline(&self) -> Result<InstallPipeline> {
        Ok(InstallPipeline::new(self.catalog()?).with_gate(self.gate.clone()))
    }
}
