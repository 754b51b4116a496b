//! Module cache, evaluation and preloading
//!
//! Modules are CommonJS-style bodies wrapped as
//! `function (module, exports, require) { ... }`. Loading a module compiles that
//! wrapper; evaluating it runs the wrapper once and caches the `module` object as
//! an entry reference owned by the root scope. `require` is lazy, so a module's
//! imports are only evaluated when its code actually asks for them.

use crate::engine::{caught, EngineShared};
use crate::loader::normalize_path;
use crate::ScriptError;
use rquickjs::{Ctx, Exception, Function, Object, Persistent, Value};
use std::collections::{HashSet, VecDeque};
use std::rc::{Rc, Weak};
use tether_core::NativeReference;
use tether_metrics::metrics;

/// A compiled module.
pub struct ModuleHandle {
    path: String,
    imports: Vec<String>,
    factory: Persistent<Function<'static>>,
    entry: Option<NativeReference>,
}

impl ModuleHandle {
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Direct imports as declared by the loader.
    pub fn imports(&self) -> &[String] {
        &self.imports
    }

    /// Cached reference to the evaluated `module` object, if evaluated.
    pub fn entry(&self) -> Option<&NativeReference> {
        self.entry.as_ref()
    }

    pub fn is_evaluated(&self) -> bool {
        self.entry.is_some()
    }
}

impl EngineShared {
    /// Compile `path` unless it already is. Returns whether a compile happened.
    pub(crate) fn compile_module<'js>(
        &self,
        ctx: &Ctx<'js>,
        path: &str,
    ) -> Result<bool, ScriptError> {
        if self.modules.borrow().contains_key(path) {
            return Ok(false);
        }

        let source = self
            .loader
            .load(path)
            .map_err(|err| ScriptError::from_load(path, err))?;
        let wrapped = format!(
            "(function (module, exports, require) {{\n{}\n}})",
            source.code
        );
        let factory: Function = caught(ctx, ctx.eval(wrapped))?;

        self.modules.borrow_mut().insert(
            path.to_string(),
            ModuleHandle {
                path: path.to_string(),
                imports: source.imports,
                factory: Persistent::save(ctx, factory),
                entry: None,
            },
        );
        metrics! {
            self.stats.borrow_mut().increment("modules.compiled", 1);
        }
        tracing::debug!(module = %path, "compiled module");
        Ok(true)
    }

    /// Current `module.exports` of `path`, evaluating the module on first use.
    ///
    /// The module object is cached before the body runs, so a circular `require`
    /// observes the partially filled exports instead of recursing.
    pub(crate) fn module_exports<'js>(
        self: &Rc<Self>,
        ctx: &Ctx<'js>,
        path: &str,
    ) -> Result<Value<'js>, ScriptError> {
        self.compile_module(ctx, path)?;

        let (entry, factory) = {
            let modules = self.modules.borrow();
            let handle = modules
                .get(path)
                .ok_or_else(|| ScriptError::ModuleNotFound {
                    path: path.to_string(),
                })?;
            (handle.entry.clone(), handle.factory.clone())
        };

        if let Some(entry) = entry {
            let module = self.load(ctx, &entry)?;
            let module = module
                .into_object()
                .ok_or_else(|| ScriptError::Engine(format!("module '{}' is corrupt", path)))?;
            return caught(ctx, module.get("exports"));
        }

        let module = caught(ctx, Object::new(ctx.clone()))?;
        let exports = caught(ctx, Object::new(ctx.clone()))?;
        caught(ctx, module.set("exports", exports.clone()))?;

        let entry = self.store(ctx, self.tree.root(), module.clone().into_value())?;
        if let Some(handle) = self.modules.borrow_mut().get_mut(path) {
            handle.entry = Some(entry.clone());
        }

        let require = require_function(ctx, Rc::downgrade(self))?;
        let factory = caught(ctx, factory.restore(ctx))?;
        let ran: Result<(), ScriptError> =
            caught(ctx, factory.call((module.clone(), exports, require)));
        if let Err(err) = ran {
            // Forget the half-built module so the next request runs it again.
            if let Some(handle) = self.modules.borrow_mut().get_mut(path) {
                handle.entry = None;
            }
            self.tree.release_reference(entry.id());
            self.drop_value(entry.id());
            return Err(err);
        }

        metrics! {
            self.stats.borrow_mut().increment("modules.evaluated", 1);
        }
        tracing::debug!(module = %path, "evaluated module");
        caught(ctx, module.get("exports"))
    }

    /// Compile `path` and, breadth first, its imports up to `max_depth` hops.
    ///
    /// Each module is visited at most once per walk, so import cycles terminate.
    /// The root must load; failures further down are logged and skipped.
    pub(crate) fn preload_modules<'js>(
        &self,
        ctx: &Ctx<'js>,
        path: &str,
        max_depth: usize,
    ) -> Result<usize, ScriptError> {
        if max_depth == 0 {
            return Err(ScriptError::InvalidPreloadDepth);
        }

        let mut compiled = 0;
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        visited.insert(path.to_string());
        queue.push_back((path.to_string(), max_depth));

        while let Some((current, depth)) = queue.pop_front() {
            match self.compile_module(ctx, &current) {
                Ok(true) => compiled += 1,
                Ok(false) => {}
                Err(err) if current == path => return Err(err),
                Err(err) => {
                    tracing::warn!(module = %current, root = %path, %err, "skipping import during preload");
                    continue;
                }
            }
            if depth <= 1 {
                continue;
            }

            let imports = self
                .modules
                .borrow()
                .get(&current)
                .map(|handle| handle.imports.clone())
                .unwrap_or_default();
            for import in imports {
                if visited.insert(import.clone()) {
                    queue.push_back((import, depth - 1));
                }
            }
        }

        tracing::debug!(module = %path, max_depth, compiled, "preloaded module");
        Ok(compiled)
    }

    /// Drop the cached module so the next request loads the new source.
    pub(crate) fn invalidate_module(&self, path: &str) -> bool {
        let removed = self.modules.borrow_mut().remove(path);
        let Some(handle) = removed else {
            return false;
        };
        if let Some(entry) = handle.entry {
            self.tree.release_reference(entry.id());
            self.drop_value(entry.id());
        }
        true
    }
}

fn require_function<'js>(
    ctx: &Ctx<'js>,
    shared: Weak<EngineShared>,
) -> Result<Function<'js>, ScriptError> {
    let require = Function::new(
        ctx.clone(),
        move |ctx: Ctx<'js>, path: String| -> rquickjs::Result<Value<'js>> {
            let Some(shared) = shared.upgrade() else {
                return Err(Exception::throw_message(&ctx, "engine has shut down"));
            };
            let path = normalize_path(&path);
            shared
                .module_exports(&ctx, &path)
                .map_err(|err| Exception::throw_message(&ctx, &err.to_string()))
        },
    );
    caught(ctx, require)
}
