//! Scopes
//!
//! A scope is an attribute container with an identity and a one-way
//! destruction state machine:
//!
//! ```text
//!   Valid ──destroy_scope()──▶ InDestruction ──▶ Destroyed
//! ```
//!
//! Five kinds are composed by containment:
//!
//! ```text
//!   Global ─owns─▶ Application*
//!   Session ─owns─▶ SessionApplication*      (sessions live in the SessionRegistry)
//!   Request                                  (bound to a thread of control)
//! ```
//!
//! A scope always destroys everything it owns before its own attributes
//! are cleared.

mod application;
mod global;
mod request;
mod session;

pub use application::ApplicationScope;
pub use global::GlobalScope;
pub use request::RequestScope;
pub use session::{SessionApplicationScope, SessionScope};

use crate::attributes::{AttributeContainer, AttributeMap, AttributeValue};
use crate::config::RuntimeConfig;
use crate::error::{Result, ScopeError};
use crate::lifecycle::{
    panic_message, LifecycleListener, LifecycleListeners, ListenerResult, Transition,
};
use crate::metrics::ScopeMetrics;
use chrono::{DateTime, Utc};
use lifescope_types::{Change, ScopeId, ScopeKind, ScopeState};
use once_cell::sync::OnceCell;
use parking_lot::{ReentrantMutex, RwLock};
use std::cell::Cell;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Everything a scope needs from its runtime
#[derive(Debug, Default)]
pub(crate) struct ScopeEnv {
    pub(crate) config: RuntimeConfig,
    pub(crate) listeners: LifecycleListeners,
    pub(crate) metrics: ScopeMetrics,
}

impl ScopeEnv {
    pub(crate) fn new(config: RuntimeConfig, listeners: LifecycleListeners) -> Self {
        ScopeEnv {
            config,
            listeners,
            metrics: ScopeMetrics::new(),
        }
    }

    /// Count a scope as begun and notify listeners
    pub(crate) fn began<F>(&self, kind: ScopeKind, id: &ScopeId, call: F)
    where
        F: Fn(&dyn LifecycleListener) -> ListenerResult,
    {
        self.metrics.record_began(kind);
        debug!(%kind, scope = %id, "Scope began");
        self.listeners
            .dispatch(kind, Transition::Began, id, &self.metrics, call);
    }

    /// Notify listeners that a scope is about to be destroyed
    pub(crate) fn ending<F>(&self, kind: ScopeKind, id: &ScopeId, call: F)
    where
        F: Fn(&dyn LifecycleListener) -> ListenerResult,
    {
        debug!(%kind, scope = %id, "Scope ending");
        self.listeners
            .dispatch(kind, Transition::Ending, id, &self.metrics, call);
    }
}

/// Which lifecycle events of a scope have gone out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Announced {
    Pending,
    Began,
    Ended,
}

/// State shared by every scope kind: identity, attributes and the
/// destruction state machine
///
/// Lock order is always state, then attributes. Mutations hold the state
/// lock shared while they write attributes, so once `InDestruction` is
/// visible no mutation can still be in flight.
#[derive(Debug)]
pub struct ScopeCore {
    id: ScopeId,
    kind: ScopeKind,
    state: RwLock<ScopeState>,
    attributes: AttributeContainer,
    initialized_at: OnceCell<DateTime<Utc>>,
    announced: ReentrantMutex<Cell<Announced>>,
    env: Arc<ScopeEnv>,
}

impl ScopeCore {
    pub(crate) fn new(kind: ScopeKind, id: ScopeId, env: Arc<ScopeEnv>) -> Self {
        let timeout = env.config.lock_timeout();
        ScopeCore {
            id,
            kind,
            state: RwLock::new(ScopeState::Valid),
            attributes: AttributeContainer::new(timeout),
            initialized_at: OnceCell::new(),
            announced: ReentrantMutex::new(Cell::new(Announced::Pending)),
            env,
        }
    }

    pub fn id(&self) -> &ScopeId {
        &self.id
    }

    pub fn kind(&self) -> ScopeKind {
        self.kind
    }

    pub fn state(&self) -> ScopeState {
        *self.state.read_recursive()
    }

    pub fn is_valid(&self) -> bool {
        self.state().is_valid()
    }

    pub fn is_destroyed(&self) -> bool {
        self.state().is_destroyed()
    }

    /// When `init_scope` ran, if it has
    pub fn initialized_at(&self) -> Option<DateTime<Utc>> {
        self.initialized_at.get().copied()
    }

    pub(crate) fn env(&self) -> &Arc<ScopeEnv> {
        &self.env
    }

    /// Fire this scope's begin event
    ///
    /// The scope is always counted as begun, but listeners are skipped when
    /// its ending event was already claimed by a concurrent teardown.
    pub(crate) fn announce_began<F>(&self, call: F)
    where
        F: Fn(&dyn LifecycleListener) -> ListenerResult,
    {
        let announced = self.announced.lock();
        match announced.get() {
            Announced::Pending => {
                announced.set(Announced::Began);
                self.env.began(self.kind, &self.id, call);
            }
            Announced::Began => {}
            Announced::Ended => {
                self.env.metrics.record_began(self.kind);
                debug!(
                    kind = %self.kind,
                    scope = %self.id,
                    "Scope ended before its begin event; not announced"
                );
            }
        }
    }

    /// Fire this scope's ending event, once, and only after its begin event
    pub(crate) fn announce_ending<F>(&self, call: F)
    where
        F: Fn(&dyn LifecycleListener) -> ListenerResult,
    {
        let announced = self.announced.lock();
        if announced.replace(Announced::Ended) == Announced::Began {
            self.env.ending(self.kind, &self.id, call);
        }
    }

    pub(crate) fn lock_timeout(&self) -> ScopeError {
        ScopeError::LockTimeout {
            kind: self.kind,
            id: self.id.clone(),
            waited: self.attributes.timeout(),
        }
    }

    fn destroyed(&self) -> ScopeError {
        ScopeError::Destroyed {
            kind: self.kind,
            id: self.id.clone(),
        }
    }

    pub(crate) fn not_valid(&self) -> ScopeError {
        match self.state() {
            ScopeState::Destroyed => self.destroyed(),
            _ => ScopeError::NotValid {
                kind: self.kind,
                id: self.id.clone(),
            },
        }
    }

    pub(crate) fn init(&self) -> Result<()> {
        if !self.is_valid() {
            return Err(self.not_valid());
        }
        self.initialized_at
            .set(Utc::now())
            .map_err(|_| ScopeError::AlreadyInitialized {
                kind: self.kind,
                id: self.id.clone(),
            })
    }

    /// Read attributes; allowed until the scope is destroyed
    pub(crate) fn read_attributes<R>(&self, f: impl FnOnce(&AttributeMap) -> R) -> Result<R> {
        if self.is_destroyed() {
            return Err(self.destroyed());
        }
        self.attributes.read(f).map_err(|_| self.lock_timeout())
    }

    /// Mutate attributes; only allowed while the scope is valid
    pub(crate) fn write_attributes<R>(&self, f: impl FnOnce(&mut AttributeMap) -> R) -> Result<R> {
        let state = self
            .state
            .try_read_recursive_for(self.attributes.timeout())
            .ok_or_else(|| self.lock_timeout())?;
        if !state.is_valid() {
            drop(state);
            return Err(self.not_valid());
        }
        let result = self.attributes.write(f).map_err(|_| self.lock_timeout());
        drop(state);
        result
    }

    pub fn get(&self, name: &str) -> Result<Option<AttributeValue>> {
        self.read_attributes(|attributes| attributes.get(name).cloned())
    }

    pub fn set(&self, name: &str, value: AttributeValue) -> Result<Change> {
        self.write_attributes(|attributes| attributes.set(name, value))
    }

    pub fn remove(&self, name: &str) -> Result<Change> {
        self.write_attributes(|attributes| attributes.remove(name))
    }

    pub fn entries(&self) -> Result<Vec<(String, AttributeValue)>> {
        self.read_attributes(|attributes| attributes.entries())
    }

    pub fn names(&self) -> Result<Vec<String>> {
        self.read_attributes(|attributes| attributes.names())
    }

    fn begin_destruction(&self) -> Result<()> {
        let mut state = self
            .state
            .try_write_for(self.attributes.timeout())
            .ok_or_else(|| self.lock_timeout())?;
        match *state {
            ScopeState::Destroyed => Err(ScopeError::AlreadyDestroyed {
                kind: self.kind,
                id: self.id.clone(),
            }),
            ScopeState::InDestruction => Err(ScopeError::AlreadyInDestruction {
                kind: self.kind,
                id: self.id.clone(),
            }),
            ScopeState::Valid => {
                *state = ScopeState::InDestruction;
                Ok(())
            }
        }
    }

    /// Notify every destruction-aware value, isolating failures
    fn run_destruction_hooks(&self) -> Result<()> {
        let entries = self.entries()?;
        for (name, value) in entries {
            let outcome = catch_unwind(AssertUnwindSafe(|| value.notify_destruction(&self.id)));
            match outcome {
                Ok(None) | Ok(Some(Ok(()))) => {}
                Ok(Some(Err(err))) => {
                    self.env.metrics.record_hook_failure();
                    warn!(
                        kind = %self.kind,
                        scope = %self.id,
                        attribute = %name,
                        error = %err,
                        "Destruction hook failed"
                    );
                }
                Err(payload) => {
                    self.env.metrics.record_hook_failure();
                    error!(
                        kind = %self.kind,
                        scope = %self.id,
                        attribute = %name,
                        panic = %panic_message(payload.as_ref()),
                        "Destruction hook panicked"
                    );
                }
            }
        }
        Ok(())
    }

    fn finish_destruction(&self) -> Result<()> {
        let mut state = self
            .state
            .try_write_for(self.attributes.timeout())
            .ok_or_else(|| self.lock_timeout())?;
        debug_assert!(state.can_transition_to(ScopeState::Destroyed));
        self.attributes.clear().map_err(|_| self.lock_timeout())?;
        *state = ScopeState::Destroyed;
        drop(state);
        self.env.metrics.record_destroyed(self.kind);
        Ok(())
    }
}

/// Common behavior of the five scope kinds
///
/// Implementors supply their [`ScopeCore`] and, when they own child scopes,
/// [`destroy_owned_scopes`](Scope::destroy_owned_scopes). Everything else is
/// provided.
pub trait Scope: Send + Sync + 'static {
    fn core(&self) -> &ScopeCore;

    /// Destroy every child scope, firing each child's `*_ending` event
    /// right before its destruction
    fn destroy_owned_scopes(&self) -> Result<()> {
        Ok(())
    }

    /// Runs once the scope is `Destroyed`
    fn post_destroy(&self) {}

    fn id(&self) -> &ScopeId {
        self.core().id()
    }

    fn kind(&self) -> ScopeKind {
        self.core().kind()
    }

    fn state(&self) -> ScopeState {
        self.core().state()
    }

    fn is_valid(&self) -> bool {
        self.core().is_valid()
    }

    fn is_destroyed(&self) -> bool {
        self.core().is_destroyed()
    }

    fn get(&self, name: &str) -> Result<Option<AttributeValue>> {
        self.core().get(name)
    }

    fn set(&self, name: &str, value: AttributeValue) -> Result<Change> {
        self.core().set(name, value)
    }

    fn remove(&self, name: &str) -> Result<Change> {
        self.core().remove(name)
    }

    /// Copy of every attribute, ordered by name
    fn attributes(&self) -> Result<Vec<(String, AttributeValue)>> {
        self.core().entries()
    }

    fn attribute_names(&self) -> Result<Vec<String>> {
        self.core().names()
    }

    fn init_scope(&self) -> Result<()> {
        self.core().init()
    }

    /// Tear the scope down
    ///
    /// Owned scopes go first, then destruction hooks run against the still
    /// populated container, then the attributes are cleared and the scope
    /// becomes `Destroyed`. Calling this twice is a fault.
    ///
    /// A failure while destroying owned scopes or running hooks does not
    /// leave the scope stuck in `InDestruction`: it still becomes
    /// `Destroyed`, and the first failure is returned afterwards.
    fn destroy_scope(&self) -> Result<()> {
        let core = self.core();
        core.begin_destruction()?;
        debug!(kind = %core.kind(), scope = %core.id(), "Destroying scope");

        let owned = self.destroy_owned_scopes();
        if let Err(err) = &owned {
            error!(
                kind = %core.kind(),
                scope = %core.id(),
                error = %err,
                "Failed to destroy owned scopes"
            );
        }
        let hooks = core.run_destruction_hooks();
        if let Err(err) = &hooks {
            error!(
                kind = %core.kind(),
                scope = %core.id(),
                error = %err,
                "Failed to run destruction hooks"
            );
        }
        core.finish_destruction()?;

        self.post_destroy();
        owned.and(hooks)
    }
}

/// Child scopes owned by a parent, created on demand
///
/// Lookups probe under the read lock and fall back to a write-locked
/// re-probe before creating, so concurrent callers agree on one child.
#[derive(Debug)]
pub(crate) struct ChildScopes<C> {
    children: RwLock<HashMap<ScopeId, Arc<C>>>,
}

impl<C: Scope> ChildScopes<C> {
    pub(crate) fn new() -> Self {
        ChildScopes {
            children: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn get(&self, parent: &ScopeCore, id: &ScopeId) -> Result<Option<Arc<C>>> {
        if !parent.is_valid() {
            return Err(parent.not_valid());
        }
        let children = self
            .children
            .try_read_for(parent.attributes.timeout())
            .ok_or_else(|| parent.lock_timeout())?;
        Ok(children.get(id).cloned())
    }

    /// Return the child, creating and initializing it if absent
    ///
    /// The flag is `true` when this call created the child; the caller fires
    /// the begin event after the lock is released.
    pub(crate) fn get_or_create(
        &self,
        parent: &ScopeCore,
        id: &ScopeId,
        make: impl FnOnce() -> C,
    ) -> Result<(Arc<C>, bool)> {
        if let Some(existing) = self.get(parent, id)? {
            return Ok((existing, false));
        }

        let mut children = self
            .children
            .try_write_for(parent.attributes.timeout())
            .ok_or_else(|| parent.lock_timeout())?;
        if let Some(existing) = children.get(id) {
            return Ok((existing.clone(), false));
        }
        // Owned scopes are drained under this lock once the parent leaves
        // Valid, so checking here keeps children from outliving it.
        if !parent.is_valid() {
            return Err(parent.not_valid());
        }
        let child = Arc::new(make());
        child.init_scope()?;
        children.insert(id.clone(), child.clone());
        Ok((child, true))
    }

    pub(crate) fn all(&self) -> Vec<Arc<C>> {
        let mut all: Vec<_> = self.children.read().values().cloned().collect();
        all.sort_by(|a, b| a.id().cmp(b.id()));
        all
    }

    pub(crate) fn ids(&self) -> Vec<ScopeId> {
        let mut ids: Vec<_> = self.children.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub(crate) fn len(&self) -> usize {
        self.children.read().len()
    }

    /// Remove every child, ordered by id
    pub(crate) fn drain(&self, parent: &ScopeCore) -> Result<Vec<Arc<C>>> {
        let mut children = self
            .children
            .try_write_for(parent.attributes.timeout())
            .ok_or_else(|| parent.lock_timeout())?;
        let mut drained: Vec<_> = children.drain().map(|(_, child)| child).collect();
        drained.sort_by(|a, b| a.id().cmp(b.id()));
        Ok(drained)
    }
}

/// Fire `ending` for each child then destroy it; a failed child is logged
/// and the rest still go
pub(crate) fn destroy_children<C, F>(
    parent: &ScopeCore,
    children: &ChildScopes<C>,
    ending: F,
) -> Result<()>
where
    C: Scope,
    F: Fn(&C, &dyn LifecycleListener) -> ListenerResult,
{
    for child in children.drain(parent)? {
        child
            .core()
            .announce_ending(|listener| ending(&*child, listener));
        if let Err(err) = child.destroy_scope() {
            error!(
                kind = %child.kind(),
                scope = %child.id(),
                parent = %parent.id(),
                error = %err,
                "Failed to destroy owned scope"
            );
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) fn test_env() -> Arc<ScopeEnv> {
    Arc::new(ScopeEnv::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::DestructionAware;
    use crate::error::CallbackError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Leaf {
        core: ScopeCore,
    }

    impl Scope for Leaf {
        fn core(&self) -> &ScopeCore {
            &self.core
        }
    }

    fn leaf(id: &str) -> Leaf {
        Leaf {
            core: ScopeCore::new(ScopeKind::Request, ScopeId::new(id), test_env()),
        }
    }

    struct SeesSibling {
        scope: Arc<Leaf>,
        saw: AtomicUsize,
    }

    impl DestructionAware for SeesSibling {
        fn on_scope_destruction(&self, _scope: &ScopeId) -> std::result::Result<(), CallbackError> {
            // The container is still populated and readable while hooks run
            if self.scope.get("sibling")?.is_some() {
                self.saw.fetch_add(1, Ordering::SeqCst);
            }
            assert_eq!(self.scope.state(), ScopeState::InDestruction);
            assert!(self.scope.set("late", AttributeValue::new(1u8)).is_err());
            Ok(())
        }
    }

    struct Failing;

    impl DestructionAware for Failing {
        fn on_scope_destruction(&self, _scope: &ScopeId) -> std::result::Result<(), CallbackError> {
            Err("refused".into())
        }
    }

    #[test]
    fn test_init_only_once() {
        let scope = leaf("r");
        assert!(scope.core().initialized_at().is_none());
        scope.init_scope().unwrap();
        assert!(scope.core().initialized_at().is_some());
        assert!(matches!(
            scope.init_scope(),
            Err(ScopeError::AlreadyInitialized { .. })
        ));
    }

    #[test]
    fn test_destroy_runs_hooks_then_clears() {
        let scope = Arc::new(leaf("r"));
        let watcher = Arc::new(SeesSibling {
            scope: scope.clone(),
            saw: AtomicUsize::new(0),
        });
        scope.set("sibling", AttributeValue::new(1u8)).unwrap();
        scope
            .set("watcher", AttributeValue::destruction_aware(watcher.clone()))
            .unwrap();
        scope
            .set("failing", AttributeValue::destruction_aware(Arc::new(Failing)))
            .unwrap();

        scope.destroy_scope().unwrap();

        assert_eq!(watcher.saw.load(Ordering::SeqCst), 1);
        assert!(scope.is_destroyed());
        assert_eq!(scope.core().env().metrics.snapshot().hook_failures, 1);
        assert_eq!(
            scope.core().env().metrics.snapshot().scopes_destroyed.request,
            1
        );
    }

    #[test]
    fn test_double_destroy_is_a_fault() {
        let scope = leaf("r");
        scope.destroy_scope().unwrap();
        assert!(matches!(
            scope.destroy_scope(),
            Err(ScopeError::AlreadyDestroyed { .. })
        ));
    }

    #[test]
    fn test_no_attribute_use_after_destruction() {
        let scope = leaf("r");
        scope.set("a", AttributeValue::new(1u8)).unwrap();
        scope.destroy_scope().unwrap();

        assert!(matches!(scope.get("a"), Err(ScopeError::Destroyed { .. })));
        assert!(matches!(
            scope.set("a", AttributeValue::new(2u8)),
            Err(ScopeError::Destroyed { .. })
        ));
        assert!(scope.remove("a").is_err());
        assert!(scope.attributes().is_err());
        assert!(scope.init_scope().is_err());
    }

    /// Tries to destroy its own scope from inside the destruction hook
    struct Reentrant {
        scope: Arc<Leaf>,
        outcome: parking_lot::Mutex<Option<Result<()>>>,
    }

    impl DestructionAware for Reentrant {
        fn on_scope_destruction(&self, _scope: &ScopeId) -> std::result::Result<(), CallbackError> {
            *self.outcome.lock() = Some(self.scope.destroy_scope());
            Ok(())
        }
    }

    #[test]
    fn test_destroy_during_destruction_is_a_fault() {
        let scope = Arc::new(leaf("r"));
        let hook = Arc::new(Reentrant {
            scope: scope.clone(),
            outcome: parking_lot::Mutex::new(None),
        });
        scope
            .set("hook", AttributeValue::destruction_aware(hook.clone()))
            .unwrap();

        scope.destroy_scope().unwrap();

        assert!(matches!(
            hook.outcome.lock().take(),
            Some(Err(ScopeError::AlreadyInDestruction { .. }))
        ));
        assert!(scope.is_destroyed());
    }

    /// Scope whose owned-scope teardown always fails
    struct BrokenOwner {
        core: ScopeCore,
    }

    impl Scope for BrokenOwner {
        fn core(&self) -> &ScopeCore {
            &self.core
        }

        fn destroy_owned_scopes(&self) -> Result<()> {
            Err(self.core.lock_timeout())
        }
    }

    #[test]
    fn test_failed_teardown_step_still_finishes_destruction() {
        let scope = BrokenOwner {
            core: ScopeCore::new(ScopeKind::Global, ScopeId::new("g"), test_env()),
        };
        scope.set("a", AttributeValue::new(1u8)).unwrap();

        assert!(matches!(
            scope.destroy_scope(),
            Err(ScopeError::LockTimeout { .. })
        ));
        assert!(scope.is_destroyed());
        assert!(matches!(
            scope.destroy_scope(),
            Err(ScopeError::AlreadyDestroyed { .. })
        ));
        assert_eq!(
            scope.core().env().metrics.snapshot().scopes_destroyed.global,
            1
        );
    }

    struct Silent;

    impl LifecycleListener for Silent {}

    fn announcing_leaf(id: &str) -> Leaf {
        let listeners: Vec<Arc<dyn LifecycleListener>> = vec![Arc::new(Silent)];
        let env = ScopeEnv::new(RuntimeConfig::default(), LifecycleListeners::new(listeners));
        Leaf {
            core: ScopeCore::new(ScopeKind::Request, ScopeId::new(id), Arc::new(env)),
        }
    }

    #[test]
    fn test_ending_is_announced_once_after_began() {
        let events = parking_lot::Mutex::new(Vec::new());
        let record = |event: &'static str| -> ListenerResult {
            events.lock().push(event);
            Ok(())
        };

        // Ended before it began: listeners hear neither event
        let early = announcing_leaf("early");
        early.core().announce_ending(|_| record("ending"));
        early.core().announce_began(|_| record("began"));
        assert!(events.lock().is_empty());
        assert_eq!(early.core().env().metrics.snapshot().scopes_begun.request, 1);

        let scope = announcing_leaf("r");
        for _ in 0..2 {
            scope.core().announce_began(|_| record("began"));
        }
        for _ in 0..2 {
            scope.core().announce_ending(|_| record("ending"));
        }
        assert_eq!(*events.lock(), vec!["began", "ending"]);
    }

    #[test]
    fn test_child_scopes_refuse_creation_once_parent_invalid() {
        let parent = leaf("p");
        let children: ChildScopes<Leaf> = ChildScopes::new();
        let (first, created) = children
            .get_or_create(parent.core(), &ScopeId::new("c"), || leaf("c"))
            .unwrap();
        assert!(created);
        let (again, created) = children
            .get_or_create(parent.core(), &ScopeId::new("c"), || leaf("c"))
            .unwrap();
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &again));

        parent.destroy_scope().unwrap();
        assert!(children
            .get_or_create(parent.core(), &ScopeId::new("d"), || leaf("d"))
            .is_err());
    }
}
