//! Scope tree and native reference registry
//!
//! The tree is pure bookkeeping: it knows which scope owns which reference and
//! observer, and which scopes are gone. It never touches engine values, so every
//! method may be called from any thread. Everything lives behind one lock so a
//! disposal is atomic with respect to registrations racing against it.
//!
//! A disposed scope keeps its node until its owner lets go of it
//! ([`ScopeTree::reclaim`]); after that only the id is remembered as retired.

use crate::{NativeReference, ObserverId, ReferenceId, ScopeError, ScopeId};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Callback fired when a module is hot reloaded.
pub type ReloadCallback = Arc<dyn Fn() + Send + Sync>;

/// Everything a single `dispose` call released.
///
/// Scopes are listed children first. The caller is responsible for dropping the
/// engine values behind `references` on the engine thread.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Disposal {
    pub scopes: Vec<ScopeId>,
    pub references: Vec<ReferenceId>,
    pub observers: usize,
}

impl Disposal {
    /// True when the call was a no-op (scope already disposed).
    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }
}

struct ScopeNode {
    name: Arc<str>,
    parent: Option<ScopeId>,
    children: Vec<ScopeId>,
    references: BTreeSet<ReferenceId>,
    observers: Vec<ObserverId>,
    disposed: bool,
    // Owner is gone; the node is dropped as soon as it is disposed.
    released: bool,
}

impl ScopeNode {
    fn new(name: Arc<str>, parent: Option<ScopeId>) -> Self {
        Self {
            name,
            parent,
            children: Vec::new(),
            references: BTreeSet::new(),
            observers: Vec::new(),
            disposed: false,
            released: false,
        }
    }
}

struct ObserverEntry {
    path: String,
    scope: ScopeId,
    callback: ReloadCallback,
}

struct TreeState {
    next_id: u64,
    scopes: HashMap<ScopeId, ScopeNode>,
    // Only live references.
    references: HashMap<ReferenceId, ScopeId>,
    observers: HashMap<ObserverId, ObserverEntry>,
}

impl TreeState {
    fn allocate(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Ids are never reused, so an allocated id with no node was reclaimed.
    fn was_reclaimed(&self, scope: ScopeId) -> bool {
        scope.raw() < self.next_id && !self.scopes.contains_key(&scope)
    }

    fn live_node(&self, scope: ScopeId) -> Result<&ScopeNode, ScopeError> {
        let Some(node) = self.scopes.get(&scope) else {
            if self.was_reclaimed(scope) {
                return Err(ScopeError::ScopeDisposed {
                    scope: scope.to_string(),
                });
            }
            return Err(ScopeError::UnknownScope(scope));
        };
        if node.disposed {
            return Err(ScopeError::ScopeDisposed {
                scope: node.name.to_string(),
            });
        }
        Ok(node)
    }

    /// Live subtree rooted at `scope`, children before parents.
    fn live_subtree(&self, scope: ScopeId) -> Vec<ScopeId> {
        let mut order = Vec::new();
        let mut stack = vec![(scope, false)];
        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                order.push(id);
                continue;
            }
            stack.push((id, true));
            if let Some(node) = self.scopes.get(&id) {
                for child in node.children.iter().rev() {
                    if self.scopes.get(child).map_or(false, |c| !c.disposed) {
                        stack.push((*child, false));
                    }
                }
            }
        }
        order
    }

    fn dispose_node(&mut self, scope: ScopeId, disposal: &mut Disposal) {
        let Some(node) = self.scopes.get_mut(&scope) else {
            return;
        };
        node.disposed = true;
        node.children.clear();
        let references = std::mem::take(&mut node.references);
        let observers = std::mem::take(&mut node.observers);
        if node.released {
            self.scopes.remove(&scope);
        }

        for reference in references {
            self.references.remove(&reference);
            disposal.references.push(reference);
        }
        for observer in observers {
            if self.observers.remove(&observer).is_some() {
                disposal.observers += 1;
            }
        }
        disposal.scopes.push(scope);
    }
}

/// Hierarchy of scopes plus the registry of references they own.
pub struct ScopeTree {
    root: ScopeId,
    state: Mutex<TreeState>,
}

impl ScopeTree {
    /// Create a tree containing only the root scope.
    pub fn new(root_name: impl Into<String>) -> Self {
        let root = ScopeId::new(0);
        let root_name: String = root_name.into();
        let mut scopes = HashMap::new();
        scopes.insert(root, ScopeNode::new(root_name.into(), None));
        Self {
            root,
            state: Mutex::new(TreeState {
                next_id: 1,
                scopes,
                references: HashMap::new(),
                observers: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TreeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[inline]
    pub fn root(&self) -> ScopeId {
        self.root
    }

    /// Allocate a child of `parent`. Bookkeeping only; no engine access.
    pub fn create_child(
        &self,
        parent: ScopeId,
        name: impl Into<String>,
    ) -> Result<ScopeId, ScopeError> {
        let mut state = self.lock();
        state.live_node(parent)?;

        let id = ScopeId::new(state.allocate());
        let name: String = name.into();
        let name: Arc<str> = name.into();
        tracing::debug!(scope = %id, name = %name, parent = %parent, "created scope");
        state.scopes.insert(id, ScopeNode::new(name, Some(parent)));
        if let Some(node) = state.scopes.get_mut(&parent) {
            node.children.push(id);
        }
        Ok(id)
    }

    /// Dispose `scope` and every live descendant.
    ///
    /// Calling this on an already disposed scope returns an empty [`Disposal`].
    /// References and observers of the disposed scopes are unregistered before
    /// this returns; new registrations against them fail from that point on.
    pub fn dispose(&self, scope: ScopeId) -> Result<Disposal, ScopeError> {
        if scope == self.root {
            return Err(ScopeError::IllegalRootDisposal);
        }

        let mut state = self.lock();
        let Some(node) = state.scopes.get(&scope) else {
            if state.was_reclaimed(scope) {
                return Ok(Disposal::default());
            }
            return Err(ScopeError::UnknownScope(scope));
        };
        if node.disposed {
            return Ok(Disposal::default());
        }
        let parent = node.parent;
        let name = node.name.clone();

        let mut disposal = Disposal::default();
        for id in state.live_subtree(scope) {
            state.dispose_node(id, &mut disposal);
        }
        if let Some(parent) = parent.and_then(|p| state.scopes.get_mut(&p)) {
            parent.children.retain(|child| *child != scope);
        }

        tracing::debug!(
            scope = %scope,
            name = %name,
            scopes = disposal.scopes.len(),
            references = disposal.references.len(),
            observers = disposal.observers,
            "disposed scope"
        );
        Ok(disposal)
    }

    /// Tell the tree nothing will name `scope` again.
    ///
    /// A disposed scope is dropped right away; a live one is dropped as soon as an
    /// ancestor disposes it. The root is never reclaimed. Returns whether the
    /// node was dropped by this call.
    pub fn reclaim(&self, scope: ScopeId) -> bool {
        if scope == self.root {
            return false;
        }
        let mut state = self.lock();
        let Some(node) = state.scopes.get_mut(&scope) else {
            return false;
        };
        node.released = true;
        if node.disposed {
            state.scopes.remove(&scope);
            return true;
        }
        false
    }

    /// Number of scope nodes held, the root included.
    pub fn scope_count(&self) -> usize {
        self.lock().scopes.len()
    }

    /// Reclaimed scopes report as disposed.
    pub fn is_disposed(&self, scope: ScopeId) -> Result<bool, ScopeError> {
        let state = self.lock();
        match state.scopes.get(&scope) {
            Some(node) => Ok(node.disposed),
            None if state.was_reclaimed(scope) => Ok(true),
            None => Err(ScopeError::UnknownScope(scope)),
        }
    }

    /// Fail with [`ScopeError::ScopeDisposed`] unless `scope` accepts new work.
    pub fn check_scope(&self, scope: ScopeId) -> Result<(), ScopeError> {
        self.lock().live_node(scope).map(|_| ())
    }

    /// Diagnostic name of a scope, disposed or not, until it is reclaimed.
    pub fn scope_name(&self, scope: ScopeId) -> Option<String> {
        self.lock()
            .scopes
            .get(&scope)
            .map(|node| node.name.to_string())
    }

    pub fn parent(&self, scope: ScopeId) -> Option<ScopeId> {
        self.lock().scopes.get(&scope).and_then(|node| node.parent)
    }

    /// Live children of `scope`, in creation order.
    pub fn children(&self, scope: ScopeId) -> Vec<ScopeId> {
        self.lock()
            .scopes
            .get(&scope)
            .map(|node| node.children.clone())
            .unwrap_or_default()
    }

    /// Record a new reference owned by `scope`.
    ///
    /// Must only be called by engine-thread code that is about to store the
    /// matching engine value.
    pub fn register_reference(&self, scope: ScopeId) -> Result<NativeReference, ScopeError> {
        let mut state = self.lock();
        let name = state.live_node(scope)?.name.clone();

        let id = ReferenceId::new(state.allocate());
        state.references.insert(id, scope);
        if let Some(node) = state.scopes.get_mut(&scope) {
            node.references.insert(id);
        }
        Ok(NativeReference::new(id, scope, name))
    }

    /// Unregister a single reference. Returns `false` if it was already released,
    /// either by its scope's disposal or by an earlier call.
    pub fn release_reference(&self, reference: ReferenceId) -> bool {
        let mut state = self.lock();
        let Some(scope) = state.references.remove(&reference) else {
            return false;
        };
        if let Some(node) = state.scopes.get_mut(&scope) {
            node.references.remove(&reference);
        }
        true
    }

    /// Fail with [`ScopeError::DisposedReference`] unless `reference` is live.
    pub fn check_reference(&self, reference: &NativeReference) -> Result<(), ScopeError> {
        let state = self.lock();
        match state.references.get(&reference.id()) {
            Some(scope) if *scope == reference.scope() => Ok(()),
            _ => Err(ScopeError::DisposedReference {
                reference: reference.id(),
                scope: reference.scope_name().to_string(),
            }),
        }
    }

    pub fn live_reference_count(&self, scope: ScopeId) -> usize {
        self.lock()
            .scopes
            .get(&scope)
            .map_or(0, |node| node.references.len())
    }

    /// Register a hot reload observer owned by `scope`.
    pub fn add_observer(
        &self,
        scope: ScopeId,
        path: impl Into<String>,
        callback: ReloadCallback,
    ) -> Result<ObserverId, ScopeError> {
        let mut state = self.lock();
        state.live_node(scope)?;

        let id = ObserverId::new(state.allocate());
        state.observers.insert(
            id,
            ObserverEntry {
                path: path.into(),
                scope,
                callback,
            },
        );
        if let Some(node) = state.scopes.get_mut(&scope) {
            node.observers.push(id);
        }
        Ok(id)
    }

    /// Unregister an observer before its scope ends. Returns `false` if it was
    /// already gone.
    pub fn remove_observer(&self, observer: ObserverId) -> bool {
        let mut state = self.lock();
        let Some(entry) = state.observers.remove(&observer) else {
            return false;
        };
        if let Some(node) = state.scopes.get_mut(&entry.scope) {
            node.observers.retain(|id| *id != observer);
        }
        true
    }

    /// True while `observer` is registered.
    pub fn has_observer(&self, observer: ObserverId) -> bool {
        self.lock().observers.contains_key(&observer)
    }

    /// Snapshot of the observers currently watching `path`, in registration order.
    ///
    /// Callers running the callbacks should skip entries for which
    /// [`has_observer`](Self::has_observer) has turned false in the meantime.
    pub fn observers_for(&self, path: &str) -> Vec<(ObserverId, ReloadCallback)> {
        let state = self.lock();
        let mut matching: Vec<(ObserverId, ReloadCallback)> = state
            .observers
            .iter()
            .filter(|(_, entry)| entry.path == path)
            .map(|(id, entry)| (*id, entry.callback.clone()))
            .collect();
        matching.sort_by_key(|(id, _)| id.raw());
        matching
    }
}
