//! Shell-script stand-ins for the runtime binary.

#![allow(dead_code)]

use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::time::Duration;

use codedocs_local_runtime::{RuntimeConfig, RuntimeConfigBuilder};
use tempfile::TempDir;

/// A fake runtime: a `/bin/sh` script that records each spawn and the
/// `OLLAMA_HOST` it was given, then runs `body`.
pub struct FakeRuntime {
    pub dir: TempDir,
    pub script: PathBuf,
    pub host_file: PathBuf,
    pub spawn_log: PathBuf,
}

impl FakeRuntime {
    pub fn new(body: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-ollama.sh");
        let host_file = dir.path().join("host");
        let spawn_log = dir.path().join("spawns");

        let source = format!(
            "#!/bin/sh\n\
             echo \"$1\" >> '{log}'\n\
             echo \"$OLLAMA_HOST\" > '{host}.tmp' && mv '{host}.tmp' '{host}'\n\
             {body}\n",
            log = spawn_log.display(),
            host = host_file.display(),
            body = body,
        );
        std::fs::write(&script, source).unwrap();

        Self {
            dir,
            script,
            host_file,
            spawn_log,
        }
    }

    /// Config running this script through `/bin/sh` with short timeouts.
    pub fn config(&self) -> RuntimeConfigBuilder {
        RuntimeConfig::builder()
            .runtime_binary("/bin/sh")
            .binary_args([self.script.display().to_string()])
            .runtime_port(free_port())
            .models_dir(self.dir.path().join("models"))
            .ready_poll_interval(Duration::from_millis(50))
            .startup_timeout(Duration::from_secs(5))
            .shutdown_grace(Duration::from_millis(500))
            .kill_timeout(Duration::from_secs(2))
            .probe_timeout(Duration::from_millis(200))
            .output_drain_timeout(Duration::from_millis(500))
    }

    /// Number of times the script was started.
    pub fn spawn_count(&self) -> usize {
        std::fs::read_to_string(&self.spawn_log)
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    /// Arguments of every spawn, in order.
    pub fn spawn_args(&self) -> Vec<String> {
        std::fs::read_to_string(&self.spawn_log)
            .map(|s| s.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// Wait for the script to report its port, then listen on it the way
    /// the real runtime would. Keep the listener alive to stay "ready".
    pub async fn listen_when_spawned(&self) -> TcpListener {
        listen_on_reported_port(&self.host_file).await
    }
}

async fn listen_on_reported_port(host_file: &Path) -> TcpListener {
    for _ in 0..400 {
        if let Ok(host) = std::fs::read_to_string(host_file) {
            let port = host
                .trim()
                .rsplit(':')
                .next()
                .and_then(|p| p.parse::<u16>().ok());
            if let Some(port) = port {
                let _ = std::fs::remove_file(host_file);
                return TcpListener::bind(("127.0.0.1", port)).unwrap();
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("fake runtime never reported its port");
}

/// A port that was free a moment ago.
pub fn free_port() -> u16 {
    let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
    listener.local_addr().unwrap().port()
}
