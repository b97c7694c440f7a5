//! Lifescope - hierarchical scopes and scope-bound singletons
//!
//! This crate provides a thread-safe registry of nested lifetime scopes.
//! Objects are created once per lifetime boundary (process, application,
//! user session, request) and torn down deterministically when that
//! boundary ends.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                           Runtime                            │
//! │      (global slot, per-thread request slot, listeners)       │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  ┌──────────────────────────┐    ┌────────────────────────┐  │
//! │  │       GlobalScope        │    │ RequestScope (thread)  │  │
//! │  │  ┌────────────────────┐  │    └────────────────────────┘  │
//! │  │  │ ApplicationScope*  │  │                                │
//! │  │  └────────────────────┘  │                                │
//! │  │  ┌────────────────────┐  │                                │
//! │  │  │  SessionRegistry   │──┼──▶ SessionScope*              │
//! │  │  │    (singleton)     │  │     └─ SessionApplication*     │
//! │  │  └────────────────────┘  │                                │
//! │  └──────────────────────────┘                                │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Core Concepts
//!
//! ## Scopes
//!
//! Every scope is an [`AttributeContainer`] with an id and a one-way state
//! machine (`Valid -> InDestruction -> Destroyed`). Destroying a scope
//! destroys what it owns first, then notifies destruction-aware attribute
//! values, then clears its attributes.
//!
//! ## Singletons
//!
//! A [`Singleton`] is created lazily, at most once per scope instance, from
//! a factory registered per scope kind. Concurrent first accesses agree on
//! one instance.
//!
//! ## Lifecycle listeners
//!
//! [`LifecycleListener`]s observe every begin/end transition. A failing
//! listener is logged and never blocks the transition.
//!
//! ## Session renewal
//!
//! [`Runtime::renew_session`] moves a session to a fresh id, carrying only
//! attributes marked with [`AttributeValue::surviving_renewal`].
//!
//! # Example
//!
//! ```rust
//! use lifescope::{AttributeValue, Runtime, RuntimeConfig, Scope, ScopeKind, Singleton};
//!
//! #[derive(Default)]
//! struct Cart;
//! impl Singleton for Cart {}
//!
//! let runtime = Runtime::new(RuntimeConfig::default()).unwrap();
//! runtime.begin_global().unwrap();
//! runtime.register_singleton(ScopeKind::Session, Cart::default);
//!
//! runtime.begin_request("shop", "request-1", Some("session-1")).unwrap();
//! let session = runtime.session_scope(true).unwrap().unwrap();
//! session
//!     .set("user", AttributeValue::new(String::from("ada")).surviving_renewal())
//!     .unwrap();
//! let cart = runtime.singleton::<Cart>(ScopeKind::Session).unwrap();
//!
//! let renewed = runtime.renew_session().unwrap();
//! assert!(renewed.get("user").unwrap().is_some());
//! assert!(session.is_destroyed());
//! # drop(cart);
//!
//! runtime.end_request().unwrap();
//! runtime.shutdown().unwrap();
//! ```

// Modules
pub mod attributes;
pub mod config;
pub mod error;
pub mod host;
pub mod lifecycle;
pub mod metrics;
pub mod renewal;
pub mod runtime;
pub mod scope;
pub mod session_registry;
pub mod singleton;

// Re-exports for convenience
pub use attributes::{AttributeContainer, AttributeMap, AttributeValue, DestructionAware};
pub use config::{ConfigError, RuntimeConfig, SessionTeardown};
pub use error::{CallbackError, Result, ScopeError, SingletonError};
pub use host::{DetachedSessionHost, SessionHost};
pub use lifecycle::{LifecycleListener, LifecycleListeners, ListenerResult, Transition};
pub use metrics::{KindCounts, MetricsSnapshot, ScopeMetrics};
pub use renewal::RenewalSnapshot;
pub use runtime::{Runtime, RuntimeBuilder};
pub use scope::{
    ApplicationScope, GlobalScope, RequestScope, Scope, ScopeCore, SessionApplicationScope,
    SessionScope,
};
pub use session_registry::SessionRegistry;
pub use singleton::{Singleton, SingletonRegistry};

pub use lifescope_types::{Change, ScopeId, ScopeKind, ScopeState};
