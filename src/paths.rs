//! Application path management
//!
//! Everything lives under one per-user directory:
//!
//! - `config.yaml`: bridge configuration (optional, defaults apply)
//! - `config.json`: persisted preferences (selected MIDI input)
//! - `logs/`: rolling log files
//!
//! In debug builds a `config.yaml` in the current working directory takes
//! precedence so `cargo run` picks up the project's copy.

use anyhow::Context;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Directory name under the platform config dir
const APP_DIR: &str = "sc-d70-bridge";

/// Application paths for config, preferences, and logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    /// Path to the YAML configuration file
    pub config: PathBuf,
    /// Path to the JSON preferences file
    pub preferences: PathBuf,
    /// Path to the logs directory
    pub logs_dir: PathBuf,
}

impl AppPaths {
    /// All paths rooted at `base`
    pub fn in_dir(base: impl AsRef<Path>) -> Self {
        let base = base.as_ref();
        Self {
            config: base.join("config.yaml"),
            preferences: base.join("config.json"),
            logs_dir: base.join("logs"),
        }
    }

    /// Detect the paths for this user.
    ///
    /// Called before logging is initialized, so diagnostics go to stderr.
    pub fn detect() -> Self {
        #[cfg(debug_assertions)]
        {
            let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
            if cwd.join("config.yaml").exists() {
                eprintln!("[paths] DEV mode, using {}", cwd.display());
                return Self::in_dir(cwd);
            }
        }

        let base = dirs::config_dir()
            .unwrap_or_else(|| {
                eprintln!("[paths] WARNING: no config directory, falling back to cwd");
                PathBuf::from(".")
            })
            .join(APP_DIR);
        Self::in_dir(base)
    }

    /// Use an explicit config file; preferences and logs stay next to it
    pub fn with_config(mut self, config: impl Into<PathBuf>) -> Self {
        self.config = config.into();
        self
    }

    /// Get the base directory (for displaying in logs)
    pub fn base_dir(&self) -> PathBuf {
        self.preferences
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Ensure the base and log directories exist
    pub fn ensure_directories(&self) -> anyhow::Result<()> {
        for dir in [self.base_dir(), self.logs_dir.clone()] {
            if !dir.exists() {
                debug!("Creating directory: {}", dir.display());
                std::fs::create_dir_all(&dir)
                    .with_context(|| format!("Failed to create {}", dir.display()))?;
            }
        }
        Ok(())
    }
}
