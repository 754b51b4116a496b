use crate::{ReferenceId, ScopeId};
use thiserror::Error;

/// Lifetime violations detected by the scope tree.
///
/// These always indicate a bug in the caller (using something after its scope
/// ended) and are never swallowed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScopeError {
    #[error("scope '{scope}' has been disposed")]
    ScopeDisposed { scope: String },

    #[error("reference {reference} (owned by scope '{scope}') has been released")]
    DisposedReference { reference: ReferenceId, scope: String },

    #[error("the root scope cannot be disposed")]
    IllegalRootDisposal,

    #[error("unknown scope {0}")]
    UnknownScope(ScopeId),
}
