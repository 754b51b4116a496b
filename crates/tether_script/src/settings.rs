//! Runtime settings

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid settings file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Script runtime settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub engine: EngineSettings,
    pub modules: ModuleSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Name of the OS thread that owns the engine.
    pub thread_name: String,
    /// Heap limit in bytes. `None` leaves the engine default.
    pub memory_limit: Option<usize>,
    pub max_stack_size: Option<usize>,
    pub gc_threshold: Option<usize>,
    /// Diagnostic name of the root scope.
    pub root_scope_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleSettings {
    /// Directory used by [`FsModuleLoader`](crate::FsModuleLoader).
    pub root: Option<PathBuf>,
    pub preload_depth: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            thread_name: "tether-engine".to_string(),
            memory_limit: None,
            max_stack_size: None,
            gc_threshold: None,
            root_scope_name: "root".to_string(),
        }
    }
}

impl Default for ModuleSettings {
    fn default() -> Self {
        Self {
            root: None,
            preload_depth: 1,
        }
    }
}

impl Settings {
    /// Read settings from a JSON file. Missing keys fall back to defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}
