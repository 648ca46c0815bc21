//! Supervisor for the local inference runtime used by Codedocs.
//!
//! This crate owns the Ollama process the application runs against: it
//! negotiates free ports, starts and stops the runtime with bounded waits,
//! reports which models are installed and installs missing ones as a
//! cancellable stream of progress events.

mod client;
pub mod config;
mod control;
mod error;
pub mod events;
mod install;
pub mod inventory;
pub mod paths;
pub mod port;
mod supervisor;
pub mod text;

pub use client::OllamaClient;
pub use config::{RuntimeConfig, RuntimeConfigBuilder};
pub use control::LocalRuntime;
pub use error::{ErrorKind, Result, RuntimeError};
pub use events::{InstallSummary, ProgressEvent};
pub use install::{InstallPipeline, InstallStatus, InstallStream, JobGate, ModelRecord};
pub use inventory::{Inventory, ModelCatalog, OllamaCatalog, PullOutcome};
pub use port::{PortLease, PortNegotiator, PortProbe, TcpBindProbe};
pub use supervisor::{
    probe_port, OutputBuffer, RuntimeHandle, RuntimeState, RuntimeStatus, RuntimeSupervisor,
};
