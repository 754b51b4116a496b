//! Engine state owned by the engine thread
//!
//! [`Engine`] wraps the QuickJS runtime together with the table of engine values
//! behind every live [`NativeReference`]. It is created on the executor thread and
//! never leaves it; other threads reach it only through tasks submitted to the
//! [`EngineExecutor`](crate::EngineExecutor).

use crate::loader::{normalize_path, ModuleLoader};
use crate::marshal;
use crate::modules::ModuleHandle;
use crate::settings::EngineSettings;
use crate::ScriptError;
use rquickjs::function::{Rest, This};
use rquickjs::{CatchResultExt, Context, Ctx, Persistent, Runtime, Value};
use std::cell::RefCell;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::Arc;
use tether_core::{NativeReference, ReferenceId, ScopeError, ScopeId, ScopeTree};
use tether_metrics::{metrics, Counter};

/// Convert an engine result, pulling the pending exception out of the context.
pub(crate) fn caught<'js, T>(ctx: &Ctx<'js>, result: rquickjs::Result<T>) -> Result<T, ScriptError> {
    result
        .catch(ctx)
        .map_err(|err| ScriptError::Engine(err.to_string()))
}

/// State reachable from native functions installed into the engine (`require`).
pub(crate) struct EngineShared {
    pub(crate) tree: Arc<ScopeTree>,
    pub(crate) loader: Arc<dyn ModuleLoader>,
    pub(crate) values: RefCell<HashMap<ReferenceId, Persistent<Value<'static>>>>,
    pub(crate) modules: RefCell<HashMap<String, ModuleHandle>>,
    pub(crate) stats: RefCell<Counter>,
}

impl EngineShared {
    /// Register `value` in `scope` and keep it alive until the reference is released.
    pub(crate) fn store<'js>(
        &self,
        ctx: &Ctx<'js>,
        scope: ScopeId,
        value: Value<'js>,
    ) -> Result<NativeReference, ScriptError> {
        let reference = self.tree.register_reference(scope)?;
        self.values
            .borrow_mut()
            .insert(reference.id(), Persistent::save(ctx, value));
        metrics! {
            self.stats.borrow_mut().increment("references.registered", 1);
        }
        Ok(reference)
    }

    pub(crate) fn load<'js>(
        &self,
        ctx: &Ctx<'js>,
        reference: &NativeReference,
    ) -> Result<Value<'js>, ScriptError> {
        self.tree.check_reference(reference)?;
        let persistent = self.values.borrow().get(&reference.id()).cloned();
        // Bookkeeping says live but the value is gone: the collector got there
        // first. Report it exactly like a disposed reference.
        let persistent = persistent.ok_or_else(|| ScopeError::DisposedReference {
            reference: reference.id(),
            scope: reference.scope_name().to_string(),
        })?;
        caught(ctx, persistent.restore(ctx))
    }

    pub(crate) fn drop_value(&self, reference: ReferenceId) -> bool {
        let removed = self.values.borrow_mut().remove(&reference);
        let found = removed.is_some();
        drop(removed);
        metrics! {
            if found {
                self.stats.borrow_mut().increment("references.released", 1);
            }
        }
        found
    }
}

/// The script engine plus everything native code holds inside it.
pub struct Engine {
    shared: Rc<EngineShared>,
    context: Context,
    runtime: Runtime,
}

impl Engine {
    pub(crate) fn new(
        settings: &EngineSettings,
        loader: Arc<dyn ModuleLoader>,
        tree: Arc<ScopeTree>,
    ) -> Result<Self, ScriptError> {
        let runtime = Runtime::new().map_err(|err| ScriptError::Init(err.to_string()))?;
        if let Some(limit) = settings.memory_limit {
            runtime.set_memory_limit(limit);
        }
        if let Some(limit) = settings.max_stack_size {
            runtime.set_max_stack_size(limit);
        }
        if let Some(threshold) = settings.gc_threshold {
            runtime.set_gc_threshold(threshold);
        }
        let context = Context::full(&runtime).map_err(|err| ScriptError::Init(err.to_string()))?;

        Ok(Self {
            shared: Rc::new(EngineShared {
                tree,
                loader,
                values: RefCell::new(HashMap::new()),
                modules: RefCell::new(HashMap::new()),
                stats: RefCell::new(Counter::new()),
            }),
            context,
            runtime,
        })
    }

    pub fn tree(&self) -> &Arc<ScopeTree> {
        &self.shared.tree
    }

    pub fn root_scope(&self) -> ScopeId {
        self.shared.tree.root()
    }

    /// Run `f` with the engine context entered.
    pub fn with_context<F, R>(&self, f: F) -> R
    where
        F: FnOnce(Ctx<'_>) -> R,
    {
        self.context.with(f)
    }

    /// Hand an engine value to native code through `scope`.
    pub fn register<'js>(
        &self,
        ctx: &Ctx<'js>,
        scope: ScopeId,
        value: Value<'js>,
    ) -> Result<NativeReference, ScriptError> {
        self.shared.store(ctx, scope, value)
    }

    /// Engine value behind `reference`. Fails once its scope has been disposed.
    pub fn resolve<'js>(
        &self,
        ctx: &Ctx<'js>,
        reference: &NativeReference,
    ) -> Result<Value<'js>, ScriptError> {
        self.shared.load(ctx, reference)
    }

    /// Drop the engine values of references already unregistered by a scope
    /// disposal. Missing values are expected (collector ran first) and only logged.
    pub fn release(&self, references: &[ReferenceId]) -> usize {
        let mut released = 0;
        for reference in references {
            if self.shared.drop_value(*reference) {
                released += 1;
            } else {
                tracing::debug!(reference = %reference, "reference already released");
            }
        }
        tracing::debug!(released, requested = references.len(), "released references");
        released
    }

    /// Back-channel for the engine's own collector reclaiming a value.
    ///
    /// Safe to call before or after the owning scope is disposed; the second
    /// release of the same reference does nothing.
    pub fn collect(&self, reference: ReferenceId) -> bool {
        let unregistered = self.shared.tree.release_reference(reference);
        let dropped = self.shared.drop_value(reference);
        unregistered || dropped
    }

    /// Evaluate `path` if needed and return a reference to its exports owned by `scope`.
    ///
    /// A disposed `scope` fails before the module is loaded or run.
    pub fn push_module(&self, scope: ScopeId, path: &str) -> Result<NativeReference, ScriptError> {
        self.shared.tree.check_scope(scope)?;
        let path = normalize_path(path);
        self.context.with(|ctx| {
            let exports = self.shared.module_exports(&ctx, &path)?;
            self.shared.store(&ctx, scope, exports)
        })
    }

    /// Compile `path` and its imports up to `max_depth` hops. Returns the number of
    /// modules compiled by this call.
    pub fn preload(&self, path: &str, max_depth: usize) -> Result<usize, ScriptError> {
        let path = normalize_path(path);
        self.context
            .with(|ctx| self.shared.preload_modules(&ctx, &path, max_depth))
    }

    /// Swap out the module at `path` and notify its observers.
    ///
    /// The cached module is dropped so the next push loads the loader's current
    /// source. Each observer is checked again right before it fires, so one
    /// unregistered by an earlier callback or a disposal on another thread is
    /// skipped. A disposal that lands while a callback is already running does
    /// not interrupt it. Returns the number of observers notified.
    pub fn reload_module(&self, path: &str) -> usize {
        let path = normalize_path(path);
        let invalidated = self.shared.invalidate_module(&path);

        let mut fired = 0;
        for (observer, callback) in self.shared.tree.observers_for(&path) {
            if !self.shared.tree.has_observer(observer) {
                continue;
            }
            if panic::catch_unwind(AssertUnwindSafe(|| callback())).is_err() {
                tracing::warn!(module = %path, "hot reload observer panicked");
            }
            fired += 1;
        }
        metrics! {
            self.shared
                .stats
                .borrow_mut()
                .increment("reload.observers_fired", fired);
        }
        tracing::debug!(module = %path, invalidated, observers = fired, "hot reloaded module");
        fired
    }

    /// True once `path` has been compiled (by preload or first use).
    pub fn is_module_loaded(&self, path: &str) -> bool {
        self.shared
            .modules
            .borrow()
            .contains_key(&normalize_path(path))
    }

    pub fn is_module_evaluated(&self, path: &str) -> bool {
        self.shared
            .modules
            .borrow()
            .get(&normalize_path(path))
            .map_or(false, ModuleHandle::is_evaluated)
    }

    /// Paths of every compiled module, sorted.
    pub fn loaded_modules(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.shared.modules.borrow().keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Marshal the value behind `reference` to JSON.
    pub fn read_json(&self, reference: &NativeReference) -> Result<serde_json::Value, ScriptError> {
        self.context.with(|ctx| {
            let value = self.shared.load(&ctx, reference)?;
            marshal::to_json(&ctx, value)
        })
    }

    /// Property `key` of the object behind `reference`, as a new reference in `scope`.
    pub fn get_property(
        &self,
        scope: ScopeId,
        reference: &NativeReference,
        key: &str,
    ) -> Result<NativeReference, ScriptError> {
        self.shared.tree.check_scope(scope)?;
        self.context.with(|ctx| {
            let object = self
                .shared
                .load(&ctx, reference)?
                .into_object()
                .ok_or_else(|| ScriptError::Marshal(format!("{} is not an object", reference)))?;
            let value: Value = caught(&ctx, object.get(key))?;
            self.shared.store(&ctx, scope, value)
        })
    }

    /// Call the function stored under `name` on the object behind `reference`.
    pub fn call_export(
        &self,
        reference: &NativeReference,
        name: &str,
        args: &[serde_json::Value],
    ) -> Result<serde_json::Value, ScriptError> {
        self.context.with(|ctx| {
            let object = self
                .shared
                .load(&ctx, reference)?
                .into_object()
                .ok_or_else(|| ScriptError::NotCallable(format!("{} is not an object", reference)))?;
            let member: Value = caught(&ctx, object.get(name))?;
            let function = member
                .into_function()
                .ok_or_else(|| ScriptError::NotCallable(name.to_string()))?;
            let args = args
                .iter()
                .map(|arg| marshal::from_json(&ctx, arg))
                .collect::<Result<Vec<_>, _>>()?;
            let result: Value = caught(&ctx, function.call((This(object), Rest(args))))?;
            marshal::to_json(&ctx, result)
        })
    }

    /// Call the function behind `reference`; the result is registered in `scope`.
    pub fn call(
        &self,
        scope: ScopeId,
        reference: &NativeReference,
        args: &[serde_json::Value],
    ) -> Result<NativeReference, ScriptError> {
        self.shared.tree.check_scope(scope)?;
        self.context.with(|ctx| {
            let function = self
                .shared
                .load(&ctx, reference)?
                .into_function()
                .ok_or_else(|| ScriptError::NotCallable(reference.to_string()))?;
            let args = args
                .iter()
                .map(|arg| marshal::from_json(&ctx, arg))
                .collect::<Result<Vec<_>, _>>()?;
            let result: Value = caught(&ctx, function.call((Rest(args),)))?;
            self.shared.store(&ctx, scope, result)
        })
    }

    /// Evaluate a script and marshal its completion value.
    pub fn eval_json(&self, source: &str) -> Result<serde_json::Value, ScriptError> {
        self.context.with(|ctx| {
            let value: Value = caught(&ctx, ctx.eval(source))?;
            marshal::to_json(&ctx, value)
        })
    }

    /// Number of engine values currently held for native references.
    pub fn live_values(&self) -> usize {
        self.shared.values.borrow().len()
    }

    /// Snapshot of the engine counters. Empty unless the `metrics` feature is on.
    pub fn stats(&self) -> Vec<(String, usize)> {
        self.shared.stats.borrow().snapshot()
    }

    pub(crate) fn record_task(&self) {
        metrics! {
            self.shared.stats.borrow_mut().increment("tasks.executed", 1);
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // Every persistent handle must be gone before the runtime is freed.
        let values = std::mem::take(&mut *self.shared.values.borrow_mut());
        let modules = std::mem::take(&mut *self.shared.modules.borrow_mut());
        drop(values);
        drop(modules);
        self.runtime.run_gc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::StaticModuleLoader;

    fn engine_with(loader: StaticModuleLoader) -> Engine {
        let tree = Arc::new(ScopeTree::new("root"));
        Engine::new(&EngineSettings::default(), Arc::new(loader), tree).unwrap()
    }

    #[test]
    fn resolve_fails_after_scope_disposal() {
        let engine = engine_with(StaticModuleLoader::new());
        let scope = engine.tree().create_child(engine.root_scope(), "task").unwrap();
        let reference = engine
            .with_context(|ctx| {
                let value: Value = ctx.eval("({ answer: 42 })").unwrap();
                engine.register(&ctx, scope, value)
            })
            .unwrap();
        assert_eq!(
            engine.read_json(&reference).unwrap(),
            serde_json::json!({ "answer": 42 })
        );

        let disposal = engine.tree().dispose(scope).unwrap();
        // Bookkeeping fails fast even before the engine values are dropped.
        assert!(matches!(
            engine.read_json(&reference),
            Err(ScriptError::Scope(ScopeError::DisposedReference { .. }))
        ));
        assert_eq!(engine.release(&disposal.references), 1);
        assert_eq!(engine.live_values(), 0);
    }

    #[test]
    fn collector_and_disposal_release_once() {
        let engine = engine_with(StaticModuleLoader::new());
        let scope = engine.tree().create_child(engine.root_scope(), "gc").unwrap();
        let reference = engine
            .with_context(|ctx| {
                let value: Value = ctx.eval("[1, 2, 3]").unwrap();
                engine.register(&ctx, scope, value)
            })
            .unwrap();

        assert!(engine.collect(reference.id()));
        assert!(!engine.collect(reference.id()));
        let disposal = engine.tree().dispose(scope).unwrap();
        assert!(disposal.references.is_empty());
        assert_eq!(engine.release(&[reference.id()]), 0);
    }

    #[test]
    fn push_module_caches_evaluation() {
        let loader = StaticModuleLoader::new().with_module(
            "app/Counter",
            "globalThis.loads = (globalThis.loads || 0) + 1; exports.value = 7;",
        );
        let engine = engine_with(loader);
        let root = engine.root_scope();

        let first = engine.push_module(root, "app/Counter").unwrap();
        let second = engine.push_module(root, "./app/Counter.js").unwrap();
        assert_ne!(first, second);
        assert_eq!(engine.eval_json("globalThis.loads").unwrap(), 1);
        assert!(engine.is_module_evaluated("app/Counter"));
    }

    #[test]
    fn missing_module_is_reported_by_path() {
        let engine = engine_with(StaticModuleLoader::new());
        match engine.push_module(engine.root_scope(), "app/Nope") {
            Err(ScriptError::ModuleNotFound { path }) => assert_eq!(path, "app/Nope"),
            other => panic!("expected ModuleNotFound, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn throwing_module_can_be_retried() {
        let loader = StaticModuleLoader::new().with_module(
            "app/Flaky",
            "globalThis.attempts = (globalThis.attempts || 0) + 1;\
             if (globalThis.attempts < 2) { throw new Error('not yet'); }\
             exports.ok = true;",
        );
        let engine = engine_with(loader);
        let root = engine.root_scope();

        assert!(matches!(
            engine.push_module(root, "app/Flaky"),
            Err(ScriptError::Engine(_))
        ));
        assert!(!engine.is_module_evaluated("app/Flaky"));
        let reference = engine.push_module(root, "app/Flaky").unwrap();
        assert_eq!(
            engine.read_json(&reference).unwrap(),
            serde_json::json!({ "ok": true })
        );
    }

    #[test]
    fn circular_require_sees_partial_exports() {
        let loader = StaticModuleLoader::new()
            .with_module(
                "app/A",
                "exports.name = 'a'; const b = require('app/B'); exports.peer = b.name;",
            )
            .with_module(
                "app/B",
                "const a = require('app/A'); exports.name = 'b'; exports.sawA = a.name;",
            );
        let engine = engine_with(loader);

        let a = engine.push_module(engine.root_scope(), "app/A").unwrap();
        assert_eq!(
            engine.read_json(&a).unwrap(),
            serde_json::json!({ "name": "a", "peer": "b" })
        );
        let b = engine.push_module(engine.root_scope(), "app/B").unwrap();
        assert_eq!(
            engine.read_json(&b).unwrap(),
            serde_json::json!({ "name": "b", "sawA": "a" })
        );
    }

    #[cfg(feature = "metrics")]
    #[test]
    fn counters_track_reference_traffic() {
        let loader = StaticModuleLoader::new().with_module("app/Widget", "exports.x = 1;");
        let engine = engine_with(loader);
        let scope = engine.tree().create_child(engine.root_scope(), "counted").unwrap();
        engine.push_module(scope, "app/Widget").unwrap();
        let disposal = engine.tree().dispose(scope).unwrap();
        engine.release(&disposal.references);

        let stats: HashMap<String, usize> = engine.stats().into_iter().collect();
        assert_eq!(stats["modules.compiled"], 1);
        assert_eq!(stats["modules.evaluated"], 1);
        // Module entry in the root plus the scope's reference.
        assert_eq!(stats["references.registered"], 2);
        assert_eq!(stats["references.released"], 1);
    }

    #[test]
    fn call_export_and_call_marshal_arguments() {
        let loader = StaticModuleLoader::new().with_module(
            "app/Math",
            "exports.add = function (a, b) { return a + b; };\
             exports.makeGreeter = function (name) { return function () { return 'hi ' + name; }; };",
        );
        let engine = engine_with(loader);
        let root = engine.root_scope();
        let math = engine.push_module(root, "app/Math").unwrap();

        let sum = engine
            .call_export(&math, "add", &[serde_json::json!(2), serde_json::json!(3)])
            .unwrap();
        assert_eq!(sum, serde_json::json!(5));

        let factory = engine.get_property(root, &math, "makeGreeter").unwrap();
        let greeter = engine.call(root, &factory, &[serde_json::json!("ada")]).unwrap();
        let greeting = engine.call(root, &greeter, &[]).unwrap();
        assert_eq!(engine.read_json(&greeting).unwrap(), serde_json::json!("hi ada"));

        assert!(matches!(
            engine.call_export(&math, "missing", &[]),
            Err(ScriptError::NotCallable(_))
        ));
    }

    #[test]
    fn push_into_disposed_scope_never_runs_the_module() {
        let loader = StaticModuleLoader::new().with_module(
            "app/SideEffect",
            "globalThis.ran = (globalThis.ran || 0) + 1; exports.ok = true;",
        );
        let engine = engine_with(loader);
        let scope = engine.tree().create_child(engine.root_scope(), "dead").unwrap();
        let live = engine.push_module(engine.root_scope(), "app/SideEffect").unwrap();
        engine.tree().dispose(scope).unwrap();

        assert!(matches!(
            engine.push_module(scope, "app/SideEffect"),
            Err(ScriptError::Scope(ScopeError::ScopeDisposed { ref scope })) if scope == "dead"
        ));
        assert!(matches!(
            engine.get_property(scope, &live, "ok"),
            Err(ScriptError::Scope(ScopeError::ScopeDisposed { .. }))
        ));
        assert_eq!(engine.eval_json("globalThis.ran").unwrap(), 1);

        engine.reload_module("app/SideEffect");
        assert!(engine.push_module(scope, "app/SideEffect").is_err());
        assert!(!engine.is_module_loaded("app/SideEffect"));
        assert_eq!(engine.eval_json("globalThis.ran").unwrap(), 1);
    }

    #[test]
    fn reload_skips_observers_unregistered_mid_notification() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let engine = engine_with(StaticModuleLoader::new());
        let tree = engine.tree().clone();
        let watcher = tree.create_child(engine.root_scope(), "watcher").unwrap();
        let late_calls = Arc::new(AtomicUsize::new(0));

        let disposer = tree.clone();
        tree.add_observer(
            engine.root_scope(),
            "app/Widget",
            Arc::new(move || {
                disposer.dispose(watcher).unwrap();
            }),
        )
        .unwrap();
        let counter = late_calls.clone();
        tree.add_observer(
            watcher,
            "app/Widget",
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

        assert_eq!(engine.reload_module("app/Widget"), 1);
        assert_eq!(late_calls.load(Ordering::SeqCst), 0);
    }
}
