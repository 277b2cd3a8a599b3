//! User preferences persisted as JSON
//!
//! Only the selected MIDI input survives restarts. A missing or unreadable
//! file yields defaults so a corrupt file never blocks startup.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preferences {
    /// Id of the MIDI input to forward from
    #[serde(default)]
    pub selected_input: Option<String>,
}

pub trait PreferenceStore: Send {
    fn load(&self) -> Preferences;

    fn save(&self, prefs: &Preferences) -> Result<()>;
}

/// Preferences in a JSON file
#[derive(Debug, Clone)]
pub struct JsonPreferenceStore {
    path: PathBuf,
}

impl JsonPreferenceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn read(&self) -> Result<Preferences> {
        let json = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read preferences: {}", self.path.display()))?;
        serde_json::from_str(&json).context("Failed to parse preferences JSON")
    }
}

impl PreferenceStore for JsonPreferenceStore {
    fn load(&self) -> Preferences {
        if !self.path.exists() {
            debug!("No preferences at {}", self.path.display());
            return Preferences::default();
        }
        match self.read() {
            Ok(prefs) => {
                debug!("Preferences loaded: {:?}", prefs);
                prefs
            },
            Err(e) => {
                warn!("Ignoring unreadable preferences: {:#}", e);
                Preferences::default()
            },
        }
    }

    fn save(&self, prefs: &Preferences) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(prefs).context("Failed to serialize preferences")?;
        std::fs::write(&self.path, json)
            .with_context(|| format!("Failed to write preferences: {}", self.path.display()))?;
        debug!("Preferences saved to {}", self.path.display());
        Ok(())
    }
}

/// In-memory store for headless runs and tests
#[derive(Debug, Default)]
pub struct MemoryPreferenceStore {
    prefs: Mutex<Preferences>,
}

impl MemoryPreferenceStore {
    pub fn new(prefs: Preferences) -> Self {
        Self {
            prefs: Mutex::new(prefs),
        }
    }
}

impl PreferenceStore for MemoryPreferenceStore {
    fn load(&self) -> Preferences {
        self.prefs.lock().clone()
    }

    fn save(&self, prefs: &Preferences) -> Result<()> {
        *self.prefs.lock() = prefs.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_save_and_load() -> Result<()> {
        let dir = tempdir()?;
        let store = JsonPreferenceStore::new(dir.path().join("nested").join("config.json"));

        let prefs = Preferences {
            selected_input: Some("hw:1,0,0".to_string()),
        };
        store.save(&prefs)?;
        assert_eq!(store.load(), prefs);
        Ok(())
    }

    #[test]
    fn test_missing_file_is_default() -> Result<()> {
        let dir = tempdir()?;
        let store = JsonPreferenceStore::new(dir.path().join("config.json"));
        assert_eq!(store.load(), Preferences::default());
        Ok(())
    }

    #[test]
    fn test_corrupt_file_is_default() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json")?;
        assert_eq!(JsonPreferenceStore::new(path).load(), Preferences::default());
        Ok(())
    }

    #[test]
    fn test_memory_store() -> Result<()> {
        let store = MemoryPreferenceStore::default();
        assert_eq!(store.load().selected_input, None);
        store.save(&Preferences {
            selected_input: Some("x".into()),
        })?;
        assert_eq!(store.load().selected_input.as_deref(), Some("x"));
        Ok(())
    }
}
