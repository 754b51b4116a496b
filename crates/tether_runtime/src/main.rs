//! Tether Runtime
//!
//! Minimal binary that boots the script engine and runs an entry module
//!
//! Usage: `tether [entry-module] [settings.json]`

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tether_script::{FsModuleLoader, ScriptError, ScriptRuntime, Settings};

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    tracing::info!("Tether v{}", tether_core::VERSION);

    let mut args = std::env::args().skip(1);
    let entry = args.next().unwrap_or_else(|| "main".to_string());
    let settings = match args.next() {
        Some(path) => Settings::load(&path).with_context(|| format!("loading {}", path))?,
        None => Settings::default(),
    };

    let module_root = settings
        .modules
        .root
        .clone()
        .unwrap_or_else(|| PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/scripts")));
    tracing::info!(root = %module_root.display(), entry = %entry, "Starting engine...");

    let preload_depth = settings.modules.preload_depth.max(1);
    let runtime = ScriptRuntime::spawn(settings, Arc::new(FsModuleLoader::new(module_root)))?;
    let compiled = runtime.preload_module(&entry, preload_depth)?;
    tracing::info!(compiled, depth = preload_depth, "Preloaded entry module");

    let scope = runtime.create_scope("tether-main")?;
    let module = scope.push_module(&entry)?;
    match scope.call_export(&module, "main", Vec::new()) {
        Ok(result) => tracing::info!(%result, "main() returned"),
        Err(ScriptError::NotCallable(_)) => {
            let exports = scope.read_json(&module)?;
            tracing::info!(%exports, "Entry module has no main(); exports loaded");
        }
        Err(err) => return Err(err.into()),
    }
    scope.dispose()?;

    let stats = runtime.dispatch_sync(|engine| engine.stats())?;
    for (name, value) in stats {
        tracing::info!("{}: {}", name, value);
    }

    runtime.shutdown()?;
    tracing::info!("Runtime shut down cleanly");
    Ok(())
}
