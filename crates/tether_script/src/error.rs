use tether_core::ScopeError;
use thiserror::Error;

use crate::loader::LoadError;

/// Errors surfaced by the script runtime.
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error(transparent)]
    Scope(#[from] ScopeError),

    #[error("module '{path}' not found")]
    ModuleNotFound { path: String },

    #[error("failed to load module '{path}': {reason}")]
    Loader { path: String, reason: String },

    #[error("dispatch_sync called from the engine thread would deadlock")]
    Deadlock,

    #[error("the engine thread has shut down")]
    EngineShutDown,

    #[error("task panicked on the engine thread")]
    TaskPanicked,

    #[error("preload depth must be at least 1")]
    InvalidPreloadDepth,

    #[error("value is not callable: {0}")]
    NotCallable(String),

    #[error("script error: {0}")]
    Engine(String),

    #[error("marshalling failed: {0}")]
    Marshal(String),

    #[error("failed to start engine: {0}")]
    Init(String),
}

impl ScriptError {
    pub(crate) fn from_load(path: &str, err: LoadError) -> Self {
        match err {
            LoadError::NotFound => ScriptError::ModuleNotFound {
                path: path.to_string(),
            },
            LoadError::Io(reason) => ScriptError::Loader {
                path: path.to_string(),
                reason,
            },
        }
    }
}

impl From<serde_json::Error> for ScriptError {
    fn from(err: serde_json::Error) -> Self {
        ScriptError::Marshal(err.to_string())
    }
}
