//! Path utilities for codedocs data directories.

use std::path::{Path, PathBuf};

/// Get the codedocs data directory (~/.codedocs/).
///
/// Falls back to the current directory when no home directory is known.
pub fn codedocs_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".codedocs")
}

/// Get the runtime data directory (~/.codedocs/ollama/).
pub fn runtime_data_dir() -> PathBuf {
    codedocs_data_dir().join("ollama")
}

/// Get the default model storage directory (~/.codedocs/ollama/models/).
pub fn default_models_dir() -> PathBuf {
    runtime_data_dir().join("models")
}

/// Get the bin directory (~/.codedocs/bin/).
pub fn bin_dir() -> PathBuf {
    codedocs_data_dir().join("bin")
}

fn binary_name() -> &'static str {
    if cfg!(target_os = "windows") {
        "ollama.exe"
    } else {
        "ollama"
    }
}

/// Locate the runtime binary: the first `ollama` on `PATH`, otherwise the
/// bundled location under [`bin_dir`].
pub fn default_runtime_binary() -> PathBuf {
    std::env::var_os("PATH")
        .and_then(|paths| find_in_path(&paths, binary_name()))
        .unwrap_or_else(|| bin_dir().join(binary_name()))
}

fn find_in_path(paths: &std::ffi::OsStr, name: &str) -> Option<PathBuf> {
    std::env::split_paths(paths)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Ensure the model storage directory exists.
pub fn ensure_models_dir(path: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(path)
}
