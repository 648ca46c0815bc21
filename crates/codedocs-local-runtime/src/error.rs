//! Error types for local runtime supervision.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result type for supervisor operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Coarse classification of a [`RuntimeError`], used by callers to decide
/// whether an operation is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad binary path or storage directory. Never retried.
    Configuration,
    /// The runtime could not be brought to `Ready`.
    Start,
    /// No free port in the scanned range.
    Port,
    /// The runtime could not be terminated. Needs an operator.
    Fatal,
    /// Another installation job holds the model directory.
    Busy,
    /// The operation needs a `Ready` runtime.
    NotReady,
    /// The runtime answered with an error or could not be reached.
    Runtime,
    /// Local I/O failure.
    Io,
}

impl ErrorKind {
    /// Whether a caller may reasonably retry (with backoff) after this kind
    /// of failure.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Start | ErrorKind::Port | ErrorKind::Busy | ErrorKind::NotReady | ErrorKind::Runtime
        )
    }
}

/// Errors that can occur while supervising the local runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Runtime binary missing.
    #[error("Runtime binary not found at {0}")]
    BinaryNotFound(PathBuf),

    /// Runtime binary present but not executable.
    #[error("Runtime binary at {0} is not executable")]
    BinaryNotExecutable(PathBuf),

    /// Model storage directory could not be created.
    #[error("Failed to create model directory {path}: {source}")]
    StorageDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Runtime process could not be spawned.
    #[error("Failed to spawn runtime: {0}")]
    SpawnFailed(String),

    /// Runtime never opened its port within the startup timeout.
    #[error("Runtime did not accept connections on port {port} within {timeout:?}{}", format_diagnostics(.diagnostics))]
    StartTimeout {
        port: u16,
        timeout: Duration,
        diagnostics: Vec<String>,
    },

    /// Runtime exited before it became ready.
    #[error("Runtime exited during startup ({status}){}", format_diagnostics(.diagnostics))]
    ExitedDuringStartup {
        status: String,
        diagnostics: Vec<String>,
    },

    /// A start attempt this caller waited on failed.
    #[error("Concurrent runtime start failed: {message}")]
    ConcurrentStartFailed { kind: ErrorKind, message: String },

    /// Port scan exhausted.
    #[error("No free port in {attempts} attempt(s) starting at {preferred}")]
    NoPortAvailable { preferred: u16, attempts: u32 },

    /// Graceful and forced termination both failed.
    #[error("Failed to terminate runtime process {pid}: {reason}")]
    TerminationFailed { pid: u32, reason: String },

    /// A previous termination failure left the supervisor in a faulted state.
    #[error("Supervisor is faulted and needs operator intervention: {0}")]
    SupervisorFaulted(String),

    /// An installation job is already running.
    #[error("A model installation is already in progress")]
    InstallInProgress,

    /// The runtime is not in the `Ready` state.
    #[error("Runtime is not ready. Start it first")]
    RuntimeNotReady,

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Runtime returned an error response.
    #[error("Runtime API error: {0}")]
    Api(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RuntimeError::BinaryNotFound(_)
            | RuntimeError::BinaryNotExecutable(_)
            | RuntimeError::StorageDir { .. } => ErrorKind::Configuration,
            RuntimeError::SpawnFailed(_)
            | RuntimeError::StartTimeout { .. }
            | RuntimeError::ExitedDuringStartup { .. } => ErrorKind::Start,
            RuntimeError::ConcurrentStartFailed { kind, .. } => *kind,
            RuntimeError::NoPortAvailable { .. } => ErrorKind::Port,
            RuntimeError::TerminationFailed { .. } | RuntimeError::SupervisorFaulted(_) => {
                ErrorKind::Fatal
            }
            RuntimeError::InstallInProgress => ErrorKind::Busy,
            RuntimeError::RuntimeNotReady => ErrorKind::NotReady,
            RuntimeError::Http(_) | RuntimeError::Api(_) => ErrorKind::Runtime,
            RuntimeError::Io(_) => ErrorKind::Io,
        }
    }

    /// Shorthand for `self.kind().is_retryable()`.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Captured child output attached to start failures.
    pub fn diagnostics(&self) -> &[String] {
        match self {
            RuntimeError::StartTimeout { diagnostics, .. }
            | RuntimeError::ExitedDuringStartup { diagnostics, .. } => diagnostics,
            _ => &[],
        }
    }
}

fn format_diagnostics(lines: &[String]) -> String {
    if lines.is_empty() {
        String::new()
    } else {
        format!("\nRuntime output:\n{}", lines.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(
            RuntimeError::BinaryNotFound(PathBuf::from("/nope")).kind(),
            ErrorKind::Configuration
        );
        assert!(!RuntimeError::BinaryNotFound(PathBuf::from("/nope")).is_retryable());
        assert!(RuntimeError::NoPortAvailable { preferred: 1, attempts: 1 }.is_retryable());
        assert!(!RuntimeError::TerminationFailed { pid: 1, reason: "x".into() }.is_retryable());
        let shared = RuntimeError::ConcurrentStartFailed {
            kind: ErrorKind::Start,
            message: "boom".into(),
        };
        assert_eq!(shared.kind(), ErrorKind::Start);
    }

    #[test]
    fn test_timeout_message_includes_output() {
        let err = RuntimeError::StartTimeout {
            port: 11434,
            timeout: Duration::from_secs(20),
            diagnostics: vec!["Error: listen tcp: address already in use".to_string()],
        };
        let text = err.to_string();
        assert!(text.contains("11434"));
        assert!(text.contains("address already in use"));
        assert_eq!(err.diagnostics().len(), 1);
    }
}
