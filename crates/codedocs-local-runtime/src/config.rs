//! Runtime supervisor configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, RuntimeError};
use crate::paths;

/// Default port for the local runtime.
pub const DEFAULT_RUNTIME_PORT: u16 = 11434;

/// Default port for the API server.
pub const DEFAULT_SERVER_PORT: u16 = 8001;

/// Default model installed on first run.
pub const DEFAULT_REQUIRED_MODEL: &str = "llama3:8b";

/// Preferred port plus the next 1000.
pub const DEFAULT_PORT_SCAN_ATTEMPTS: u32 = 1001;

/// Configuration for the local runtime supervisor.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Path to the runtime binary
    pub runtime_binary: PathBuf,
    /// Arguments placed before every subcommand (`serve`, `pull`)
    pub binary_args: Vec<String>,
    /// Preferred port for the runtime
    pub runtime_port: u16,
    /// Preferred port for the API server
    pub server_port: u16,
    /// Model storage directory handed to the runtime
    pub models_dir: PathBuf,
    /// Models the application needs
    pub required_models: Vec<String>,
    /// How many consecutive ports to try per reservation
    pub port_scan_attempts: u32,
    /// Delay between readiness probes
    pub ready_poll_interval: Duration,
    /// Upper bound on waiting for the runtime to accept connections
    pub startup_timeout: Duration,
    /// How long to wait after SIGTERM before killing
    pub shutdown_grace: Duration,
    /// How long to wait for exit after a forced kill
    pub kill_timeout: Duration,
    /// Connect timeout of a single readiness probe
    pub probe_timeout: Duration,
    /// How long to keep reading pull output after the child exited
    pub output_drain_timeout: Duration,
    /// Captured runtime output lines kept for diagnostics
    pub output_buffer_lines: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            runtime_binary: paths::default_runtime_binary(),
            binary_args: Vec::new(),
            runtime_port: DEFAULT_RUNTIME_PORT,
            server_port: DEFAULT_SERVER_PORT,
            models_dir: paths::default_models_dir(),
            required_models: vec![DEFAULT_REQUIRED_MODEL.to_string()],
            port_scan_attempts: DEFAULT_PORT_SCAN_ATTEMPTS,
            ready_poll_interval: Duration::from_millis(500),
            startup_timeout: Duration::from_secs(20),
            shutdown_grace: Duration::from_secs(10),
            kill_timeout: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(1),
            output_drain_timeout: Duration::from_secs(2),
            output_buffer_lines: 200,
        }
    }
}

impl RuntimeConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(path) = lookup("OLLAMA_PATH").filter(|v| !v.is_empty()) {
            config.runtime_binary = PathBuf::from(path);
        }

        if let Some(port) = lookup("OLLAMA_PORT").and_then(|v| v.trim().parse().ok()) {
            config.runtime_port = port;
        }

        if let Some(port) = lookup("SERVER_PORT").and_then(|v| v.trim().parse().ok()) {
            config.server_port = port;
        }

        if let Some(dir) = lookup("OLLAMA_MODELS").filter(|v| !v.is_empty()) {
            config.models_dir = PathBuf::from(dir);
        }

        if let Some(models) = lookup("CODEDOCS_REQUIRED_MODELS") {
            config.required_models = parse_model_list(&models);
        }

        if let Some(attempts) = lookup("CODEDOCS_PORT_SCAN").and_then(|v| v.trim().parse().ok()) {
            config.port_scan_attempts = attempts;
        }

        if let Some(secs) = lookup("CODEDOCS_STARTUP_TIMEOUT_SECS").and_then(|v| v.trim().parse().ok()) {
            config.startup_timeout = Duration::from_secs(secs);
        }

        config
    }

    /// Create a builder for configuration.
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::default()
    }

    /// Check the binary and prepare the model directory.
    ///
    /// Failures here are configuration errors: fatal and never retried.
    pub fn validate(&self) -> Result<()> {
        if !self.runtime_binary.is_file() {
            return Err(RuntimeError::BinaryNotFound(self.runtime_binary.clone()));
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&self.runtime_binary)?.permissions().mode();
            if mode & 0o111 == 0 {
                return Err(RuntimeError::BinaryNotExecutable(self.runtime_binary.clone()));
            }
        }

        paths::ensure_models_dir(&self.models_dir).map_err(|source| RuntimeError::StorageDir {
            path: self.models_dir.clone(),
            source,
        })
    }

    /// `host:port` the runtime listens on for a given port.
    pub fn runtime_host(port: u16) -> String {
        format!("127.0.0.1:{}", port)
    }

    /// Environment handed to every runtime invocation.
    pub fn runtime_env(&self, port: u16) -> Vec<(&'static str, String)> {
        vec![
            ("OLLAMA_HOST", Self::runtime_host(port)),
            ("OLLAMA_MODELS", self.models_dir.display().to_string()),
        ]
    }
}

/// Split a comma separated model list, dropping blanks.
pub fn parse_model_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .collect()
}

/// Builder for runtime configuration.
#[derive(Debug, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    pub fn runtime_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.runtime_binary = path.into();
        self
    }

    pub fn binary_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.binary_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn runtime_port(mut self, port: u16) -> Self {
        self.config.runtime_port = port;
        self
    }

    pub fn server_port(mut self, port: u16) -> Self {
        self.config.server_port = port;
        self
    }

    pub fn models_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.models_dir = path.into();
        self
    }

    pub fn required_models<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.required_models = models.into_iter().map(Into::into).collect();
        self
    }

    pub fn port_scan_attempts(mut self, attempts: u32) -> Self {
        self.config.port_scan_attempts = attempts;
        self
    }

    pub fn ready_poll_interval(mut self, interval: Duration) -> Self {
        self.config.ready_poll_interval = interval;
        self
    }

    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.config.startup_timeout = timeout;
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.config.shutdown_grace = grace;
        self
    }

    pub fn kill_timeout(mut self, timeout: Duration) -> Self {
        self.config.kill_timeout = timeout;
        self
    }

    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.config.probe_timeout = timeout;
        self
    }

    pub fn output_drain_timeout(mut self, timeout: Duration) -> Self {
        self.config.output_drain_timeout = timeout;
        self
    }

    pub fn output_buffer_lines(mut self, lines: usize) -> Self {
        self.config.output_buffer_lines = lines.max(1);
        self
    }

    pub fn build(self) -> RuntimeConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.runtime_port, 11434);
        assert_eq!(config.server_port, 8001);
        assert_eq!(config.required_models, vec!["llama3:8b".to_string()]);
        assert_eq!(config.startup_timeout, Duration::from_secs(20));
        assert_eq!(config.shutdown_grace, Duration::from_secs(10));
    }

    #[test]
    fn test_from_lookup() {
        let env: HashMap<&str, &str> = [
            ("OLLAMA_PATH", "/opt/ollama/bin/ollama"),
            ("OLLAMA_PORT", "12000"),
            ("SERVER_PORT", "not-a-port"),
            ("OLLAMA_MODELS", "/data/models"),
            ("CODEDOCS_REQUIRED_MODELS", "llama3:8b, nomic-embed-text ,,"),
        ]
        .into_iter()
        .collect();

        let config = RuntimeConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.runtime_binary, PathBuf::from("/opt/ollama/bin/ollama"));
        assert_eq!(config.runtime_port, 12000);
        assert_eq!(config.server_port, DEFAULT_SERVER_PORT);
        assert_eq!(config.models_dir, PathBuf::from("/data/models"));
        assert_eq!(config.required_models, vec!["llama3:8b", "nomic-embed-text"]);
    }

    #[test]
    fn test_builder() {
        let config = RuntimeConfig::builder()
            .runtime_binary("/bin/sh")
            .binary_args(["fake-runtime.sh"])
            .runtime_port(9000)
            .startup_timeout(Duration::from_secs(2))
            .output_buffer_lines(0)
            .build();
        assert_eq!(config.runtime_binary, PathBuf::from("/bin/sh"));
        assert_eq!(config.binary_args, vec!["fake-runtime.sh".to_string()]);
        assert_eq!(config.runtime_port, 9000);
        assert_eq!(config.output_buffer_lines, 1);
    }

    #[test]
    fn test_validate_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let config = RuntimeConfig::builder()
            .runtime_binary(dir.path().join("nope"))
            .models_dir(dir.path().join("models"))
            .build();
        assert!(matches!(config.validate(), Err(RuntimeError::BinaryNotFound(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_validate_not_executable() {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("ollama");
        std::fs::write(&binary, b"#!/bin/sh\n").unwrap();
        let config = RuntimeConfig::builder()
            .runtime_binary(&binary)
            .models_dir(dir.path().join("models"))
            .build();
        assert!(matches!(config.validate(), Err(RuntimeError::BinaryNotExecutable(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_validate_creates_models_dir() {
        let dir = tempfile::tempdir().unwrap();
        let models = dir.path().join("ollama").join("models");
        let config = RuntimeConfig::builder()
            .runtime_binary("/bin/sh")
            .models_dir(&models)
            .build();
        config.validate().unwrap();
        assert!(models.is_dir());
    }

    #[test]
    fn test_runtime_env() {
        let config = RuntimeConfig::builder().models_dir("/data/models").build();
        let env = config.runtime_env(11500);
        assert!(env.contains(&("OLLAMA_HOST", "127.0.0.1:11500".to_string())));
        assert!(env.contains(&("OLLAMA_MODELS", "/data/models".to_string())));
    }
}
