//! Opaque identifiers handed out by the scope tree
//!
//! Ids are monotonically allocated and never reused, so a stale id can always be
//! told apart from a live one.

use std::fmt;
use std::sync::Arc;

/// Identifier of a scope in the [`ScopeTree`](crate::ScopeTree).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(u64);

impl ScopeId {
    pub(crate) const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Return the raw value backing this id.
    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scope#{}", self.0)
    }
}

/// Identifier of a native reference in the registry.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReferenceId(u64);

impl ReferenceId {
    pub(crate) const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ReferenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ref#{}", self.0)
    }
}

/// Identifier of a hot reload observer registration.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

impl ObserverId {
    pub(crate) const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Handle to a value living inside the script engine.
///
/// The handle is plain data: it names the registry entry and the scope that owns
/// it. The engine-side value itself is only reachable from the engine thread, and
/// only while the registry still reports the entry as live. The owner's name
/// travels with the handle so errors can name it after the scope is reclaimed.
///
/// ```ignore
/// let widget = scope.push_module("app/Widget")?;
/// scope.dispose()?;
/// // resolving `widget` now fails with ScopeError::DisposedReference
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NativeReference {
    id: ReferenceId,
    scope: ScopeId,
    scope_name: Arc<str>,
}

impl NativeReference {
    pub(crate) fn new(id: ReferenceId, scope: ScopeId, scope_name: Arc<str>) -> Self {
        Self {
            id,
            scope,
            scope_name,
        }
    }

    pub fn id(&self) -> ReferenceId {
        self.id
    }

    /// Scope that owns this reference.
    pub fn scope(&self) -> ScopeId {
        self.scope
    }

    /// Diagnostic name of the owning scope.
    pub fn scope_name(&self) -> &str {
        &self.scope_name
    }
}

impl fmt::Display for NativeReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} in {}", self.id, self.scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_reference_and_scope() {
        let reference = NativeReference::new(ReferenceId::new(7), ScopeId::new(3), "panel".into());
        assert_eq!(reference.to_string(), "ref#7 in scope#3");
        assert_eq!(reference.scope_name(), "panel");
    }
}
