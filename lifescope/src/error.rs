//! Error types for the scope runtime

use lifescope_types::{ScopeId, ScopeKind};
use std::time::Duration;
use thiserror::Error;

/// Error returned by user-supplied callbacks: listeners, destruction hooks
/// and singleton lifecycle hooks. These are logged, never propagated.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Top-level scope error
///
/// Every variant is a programmer-error fault: fatal to the call, never to
/// the process.
#[derive(Debug, Error)]
pub enum ScopeError {
    /// `destroy_scope` called on a destroyed scope
    #[error("{kind} scope {id} is already destroyed")]
    AlreadyDestroyed { kind: ScopeKind, id: ScopeId },

    /// `destroy_scope` called while another destruction is running
    #[error("{kind} scope {id} is already in destruction")]
    AlreadyInDestruction { kind: ScopeKind, id: ScopeId },

    /// Attribute access on a destroyed scope
    #[error("{kind} scope {id} has been destroyed")]
    Destroyed { kind: ScopeKind, id: ScopeId },

    /// Mutation or child lookup on a scope that is being destroyed
    #[error("{kind} scope {id} is no longer valid")]
    NotValid { kind: ScopeKind, id: ScopeId },

    /// `init_scope` called twice
    #[error("{kind} scope {id} was already initialized")]
    AlreadyInitialized { kind: ScopeKind, id: ScopeId },

    /// A second global scope was installed
    #[error("global scope {existing} is already present")]
    GlobalAlreadyPresent { existing: ScopeId },

    /// No global scope, or the installed one is no longer valid
    #[error("no valid global scope is present")]
    NoGlobalScope,

    /// No request scope is bound to the calling thread
    #[error("no request scope is active on this thread")]
    NoRequestScope,

    /// The current request is not attached to a session
    #[error("request {request} carries no session id")]
    NoSessionId { request: ScopeId },

    /// Get-or-create against a session that is being torn down
    #[error("session {id} is being ended")]
    SessionEnding { id: String },

    /// The session id was invalidated and may never be used again
    #[error("session id {id} was invalidated")]
    SessionInvalidated { id: String },

    /// A scope lock could not be acquired in time
    #[error("timed out after {waited:?} waiting for the lock of {kind} scope {id}")]
    LockTimeout {
        kind: ScopeKind,
        id: ScopeId,
        waited: Duration,
    },

    /// The session registry lock could not be acquired in time
    #[error("timed out after {waited:?} waiting for the session registry lock")]
    RegistryLockTimeout { waited: Duration },

    /// Singleton resolution errors
    #[error("singleton error: {0}")]
    Singleton(#[from] SingletonError),
}

/// Singleton resolution errors
#[derive(Debug, Error)]
pub enum SingletonError {
    /// No factory was registered for the type in this scope kind
    #[error("no factory registered for {type_name} in {kind} scopes")]
    NotRegistered {
        kind: ScopeKind,
        type_name: &'static str,
    },

    /// The attribute under a singleton key holds another type
    #[error("attribute {key} in {kind} scope {id} does not hold a {type_name}")]
    TypeMismatch {
        kind: ScopeKind,
        id: ScopeId,
        key: String,
        type_name: &'static str,
    },
}

/// Result type using ScopeError
pub type Result<T> = std::result::Result<T, ScopeError>;
