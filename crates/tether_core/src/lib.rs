//! Tether Core
//!
//! Lifetime bookkeeping shared by every thread that talks to the script engine:
//! - Scope tree (nested lifetimes with deterministic disposal)
//! - Native reference registry (which scope owns which engine value)
//! - Hot reload observer registrations
//!
//! Nothing in this crate touches the engine itself.

mod error;
mod ids;
pub mod scope;

pub use error::ScopeError;
pub use ids::{NativeReference, ObserverId, ReferenceId, ScopeId};
pub use scope::{Disposal, ReloadCallback, ScopeTree};

/// Bridge version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
