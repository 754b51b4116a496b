//! Tether Scripting Bridge
//!
//! Runs a QuickJS engine on a dedicated thread and lets native code use scripted
//! modules through scoped handles.
//!
//! ## Architecture
//!
//! - **Executor:** one engine thread; `dispatch`, `dispatch_sync`, `dispatch_async`
//! - **Scopes:** every [`ScriptRuntime`] handle owns a scope; disposing it releases
//!   all native references created through it
//! - **Modules:** CommonJS-style modules supplied by a [`ModuleLoader`], with
//!   preloading and hot reload observers
//!
//! ```ignore
//! let runtime = ScriptRuntime::spawn(Settings::default(), Arc::new(loader))?;
//! let scope = runtime.create_scope("feature-x")?;
//! let widget = scope.push_module("app/Widget")?;
//! let size = scope.call_export(&widget, "measure", vec![json!(320)])?;
//! scope.dispose()?;
//! ```

pub mod engine;
mod error;
pub mod executor;
pub mod loader;
pub mod marshal;
pub mod modules;
pub mod runtime;
pub mod settings;

pub use engine::Engine;
pub use error::ScriptError;
pub use executor::EngineExecutor;
pub use loader::{FsModuleLoader, LoadError, ModuleLoader, ModuleSource, StaticModuleLoader};
pub use modules::ModuleHandle;
pub use runtime::{ScopeLifetime, ScriptRuntime};
pub use settings::{EngineSettings, ModuleSettings, Settings, SettingsError};

pub use rquickjs;
pub use tether_core::{NativeReference, ObserverId, ReferenceId, ScopeError, ScopeId};
