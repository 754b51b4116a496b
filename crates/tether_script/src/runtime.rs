//! Scoped script runtime
//!
//! [`ScriptRuntime`] is what native code holds on to. Every handle is bound to
//! one scope of the shared [`ScopeTree`]: references it emits belong to that
//! scope, and disposing the scope releases them (and those of all nested scopes)
//! in one go instead of waiting for the engine's garbage collector.
//!
//! ## Scope lifetimes
//!
//! - **Root:** created by [`ScriptRuntime::spawn`]; can never be disposed.
//! - **Explicit:** [`create_scope`](ScriptRuntime::create_scope). Must be disposed
//!   with [`dispose`](ScriptRuntime::dispose). Dropping the last handle first is a
//!   leak: it is logged and the references stay alive until an ancestor is disposed.
//! - **Implicit:** [`create_implicit_scope`](ScriptRuntime::create_implicit_scope).
//!   Disposed automatically when the last clone of the handle is dropped.

use crate::engine::Engine;
use crate::executor::EngineExecutor;
use crate::loader::{normalize_path, ModuleLoader};
use crate::settings::Settings;
use crate::ScriptError;
use std::sync::Arc;
use tether_core::{Disposal, NativeReference, ObserverId, ScopeError, ScopeId, ScopeTree};

/// How a scope ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeLifetime {
    Root,
    Explicit,
    Implicit,
}

/// Shared ownership of one scope; its `Drop` applies the lifetime rule.
struct ScopeGuard {
    id: ScopeId,
    name: String,
    lifetime: ScopeLifetime,
    tree: Arc<ScopeTree>,
    executor: EngineExecutor,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        match self.lifetime {
            ScopeLifetime::Root => return,
            ScopeLifetime::Implicit => {
                if let Err(err) = dispose_scope(&self.tree, &self.executor, self.id) {
                    tracing::warn!(scope = %self.name, %err, "failed to dispose implicit scope");
                }
            }
            ScopeLifetime::Explicit => {
                if let Ok(false) = self.tree.is_disposed(self.id) {
                    tracing::warn!(
                        scope = %self.name,
                        references = self.tree.live_reference_count(self.id),
                        "explicit scope dropped without dispose(); its references stay alive until an ancestor is disposed"
                    );
                }
            }
        }
        self.tree.reclaim(self.id);
    }
}

/// Unregister the scope subtree now and hand the engine values to the engine
/// thread for release. Failing to schedule the release is logged, never returned.
fn dispose_scope(
    tree: &ScopeTree,
    executor: &EngineExecutor,
    scope: ScopeId,
) -> Result<Disposal, ScopeError> {
    let disposal = tree.dispose(scope)?;
    if !disposal.references.is_empty() {
        let references = disposal.references.clone();
        let count = references.len();
        if let Err(err) = executor.dispatch(move |engine| {
            engine.release(&references);
        }) {
            tracing::warn!(%err, count, "could not schedule release of disposed references");
        }
    }
    Ok(disposal)
}

/// Handle to the script engine bound to one scope. Cheap to clone; clones share
/// the scope.
#[derive(Clone)]
pub struct ScriptRuntime {
    scope: Arc<ScopeGuard>,
}

impl ScriptRuntime {
    /// Start an engine thread and return a handle bound to its root scope.
    pub fn spawn(settings: Settings, loader: Arc<dyn ModuleLoader>) -> Result<Self, ScriptError> {
        let tree = Arc::new(ScopeTree::new(settings.engine.root_scope_name.clone()));
        let executor = EngineExecutor::spawn(&settings.engine, loader, tree.clone())?;
        Ok(Self {
            scope: Arc::new(ScopeGuard {
                id: tree.root(),
                name: settings.engine.root_scope_name,
                lifetime: ScopeLifetime::Root,
                tree,
                executor,
            }),
        })
    }

    fn child(&self, name: &str, lifetime: ScopeLifetime) -> Result<Self, ScriptError> {
        let id = self.scope.tree.create_child(self.scope.id, name)?;
        Ok(Self {
            scope: Arc::new(ScopeGuard {
                id,
                name: name.to_string(),
                lifetime,
                tree: self.scope.tree.clone(),
                executor: self.scope.executor.clone(),
            }),
        })
    }

    /// Create a nested scope that must be disposed explicitly.
    ///
    /// `name` shows up in every error about the scope, so pick something that
    /// identifies the owner (a class or feature name).
    pub fn create_scope(&self, name: &str) -> Result<Self, ScriptError> {
        self.child(name, ScopeLifetime::Explicit)
    }

    /// Create a nested scope without a name. Prefer [`create_scope`](Self::create_scope);
    /// errors about this scope cannot say where it came from.
    pub fn create_unnamed_scope(&self) -> Result<Self, ScriptError> {
        self.child("", ScopeLifetime::Explicit)
    }

    /// Create a nested scope disposed when the last clone of the handle drops.
    pub fn create_implicit_scope(&self, name: &str) -> Result<Self, ScriptError> {
        self.child(name, ScopeLifetime::Implicit)
    }

    /// Dispose this scope and everything nested in it.
    ///
    /// Safe from any thread. Calling it again is a no-op. References owned by the
    /// disposed scopes fail to resolve as soon as this returns; their engine values
    /// are dropped by a task queued on the engine thread.
    pub fn dispose(&self) -> Result<(), ScriptError> {
        dispose_scope(&self.scope.tree, &self.scope.executor, self.scope.id)?;
        Ok(())
    }

    pub fn scope_id(&self) -> ScopeId {
        self.scope.id
    }

    pub fn scope_name(&self) -> &str {
        &self.scope.name
    }

    pub fn lifetime(&self) -> ScopeLifetime {
        self.scope.lifetime
    }

    pub fn is_disposed(&self) -> bool {
        self.scope.tree.is_disposed(self.scope.id).unwrap_or(true)
    }

    pub fn tree(&self) -> &Arc<ScopeTree> {
        &self.scope.tree
    }

    pub fn executor(&self) -> &EngineExecutor {
        &self.scope.executor
    }

    /// Load the module at `path` and return a reference to its exports owned by
    /// this scope. Blocks until the engine thread has done the work.
    pub fn push_module(&self, path: &str) -> Result<NativeReference, ScriptError> {
        let scope = self.scope.id;
        let path = normalize_path(path);
        self.dispatch_sync(move |engine| engine.push_module(scope, &path))?
    }

    /// Compile `path` ahead of first use. With `max_depth > 1` its imports are
    /// compiled too, up to `max_depth - 1` hops away. Returns how many modules were
    /// newly compiled.
    pub fn preload_module(&self, path: &str, max_depth: usize) -> Result<usize, ScriptError> {
        if max_depth == 0 {
            return Err(ScriptError::InvalidPreloadDepth);
        }
        let path = normalize_path(path);
        self.dispatch_sync(move |engine| engine.preload(&path, max_depth))?
    }

    /// Call `callback` on the engine thread every time `path` is hot reloaded,
    /// for as long as this scope lives.
    pub fn add_hot_reload_observer<F>(&self, path: &str, callback: F) -> Result<ObserverId, ScriptError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = self
            .scope
            .tree
            .add_observer(self.scope.id, normalize_path(path), Arc::new(callback))?;
        Ok(id)
    }

    pub fn remove_hot_reload_observer(&self, observer: ObserverId) -> bool {
        self.scope.tree.remove_observer(observer)
    }

    /// Entry point for whatever detects module changes. May be called from any
    /// thread; the swap and the observer callbacks happen on the engine thread.
    pub fn notify_module_reloaded(&self, path: &str) -> Result<(), ScriptError> {
        let path = normalize_path(path);
        self.dispatch(move |engine| {
            engine.reload_module(&path);
        })
    }

    pub fn read_json(&self, reference: &NativeReference) -> Result<serde_json::Value, ScriptError> {
        let reference = reference.clone();
        self.dispatch_sync(move |engine| engine.read_json(&reference))?
    }

    /// Call the exported function `name` of the module behind `module`.
    pub fn call_export(
        &self,
        module: &NativeReference,
        name: &str,
        args: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value, ScriptError> {
        let module = module.clone();
        let name = name.to_string();
        self.dispatch_sync(move |engine| engine.call_export(&module, &name, &args))?
    }

    pub fn dispatch<F>(&self, task: F) -> Result<(), ScriptError>
    where
        F: FnOnce(&mut Engine) + Send + 'static,
    {
        self.scope.executor.dispatch(task)
    }

    pub fn dispatch_sync<F, R>(&self, task: F) -> Result<R, ScriptError>
    where
        F: FnOnce(&mut Engine) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.scope.executor.dispatch_sync(task)
    }

    pub async fn dispatch_async<F, R>(&self, task: F) -> Result<R, ScriptError>
    where
        F: FnOnce(&mut Engine) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.scope.executor.dispatch_async(task).await
    }

    /// Stop the engine thread. Every handle sharing the engine stops working.
    pub fn shutdown(&self) -> Result<(), ScriptError> {
        self.scope.executor.shutdown()
    }
}

impl std::fmt::Debug for ScriptRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptRuntime")
            .field("scope", &self.scope.id)
            .field("name", &self.scope.name)
            .field("lifetime", &self.scope.lifetime)
            .finish()
    }
}
