//! Runtime - owner of the global and request slots
//!
//! The runtime is the scope manager. It holds the one global scope and one
//! request scope per thread of control, and resolves every other scope
//! through them:
//!
//! - application scopes through the global scope,
//! - sessions through the global scope's [`SessionRegistry`], keyed by the
//!   current request's session id,
//! - session-application scopes through their session.
//!
//! A runtime is created explicitly and passed to whatever serves requests.
//! Dropping it and building a new one is the reset mechanism.

use crate::config::{ConfigError, RuntimeConfig};
use crate::error::{Result, ScopeError};
use crate::host::{DetachedSessionHost, SessionHost};
use crate::lifecycle::{LifecycleListener, LifecycleListeners};
use crate::metrics::ScopeMetrics;
use crate::renewal::RenewalSnapshot;
use crate::scope::{
    ApplicationScope, GlobalScope, RequestScope, Scope, ScopeEnv, SessionApplicationScope,
    SessionScope,
};
use crate::session_registry::SessionRegistry;
use crate::singleton::{self, Singleton, SingletonRegistry};
use dashmap::DashMap;
use lifescope_types::{ScopeId, ScopeKind};
use parking_lot::RwLock;
use std::any::Any;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tracing::{debug, error, info, warn};

/// Factories for every scope kind
#[derive(Debug)]
struct SingletonRegistries {
    global: SingletonRegistry<GlobalScope>,
    application: SingletonRegistry<ApplicationScope>,
    session: SingletonRegistry<SessionScope>,
    session_application: SingletonRegistry<SessionApplicationScope>,
    request: SingletonRegistry<RequestScope>,
}

impl SingletonRegistries {
    fn new() -> Self {
        SingletonRegistries {
            global: SingletonRegistry::new(ScopeKind::Global),
            application: SingletonRegistry::new(ScopeKind::Application),
            session: SingletonRegistry::new(ScopeKind::Session),
            session_application: SingletonRegistry::new(ScopeKind::SessionApplication),
            request: SingletonRegistry::new(ScopeKind::Request),
        }
    }
}

/// Builder for [`Runtime`]
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    listeners: Vec<Arc<dyn LifecycleListener>>,
    host: Arc<dyn SessionHost>,
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        RuntimeBuilder {
            config: RuntimeConfig::default(),
            listeners: Vec::new(),
            host: Arc::new(DetachedSessionHost),
        }
    }
}

impl RuntimeBuilder {
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Append a lifecycle listener; listeners run in registration order
    pub fn listener<L: LifecycleListener + 'static>(self, listener: L) -> Self {
        self.shared_listener(Arc::new(listener))
    }

    pub fn shared_listener(mut self, listener: Arc<dyn LifecycleListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn session_host<H: SessionHost + 'static>(mut self, host: H) -> Self {
        self.host = Arc::new(host);
        self
    }

    /// Validate the configuration and freeze the listener list
    pub fn build(self) -> std::result::Result<Runtime, ConfigError> {
        self.config.validate()?;
        let env = ScopeEnv::new(self.config, LifecycleListeners::new(self.listeners));
        Ok(Runtime {
            env: Arc::new(env),
            host: self.host,
            global: RwLock::new(None),
            requests: DashMap::new(),
            singletons: SingletonRegistries::new(),
        })
    }
}

/// The scope manager
pub struct Runtime {
    env: Arc<ScopeEnv>,
    host: Arc<dyn SessionHost>,
    /// Set once; keeps the ended global scope so it cannot be replaced
    global: RwLock<Option<Arc<GlobalScope>>>,
    /// One entry per thread with an active request. An entry is only
    /// removed by `end_request`, by the next `begin_request` on the same
    /// thread, or by `shutdown`; a thread that exits mid-request leaves its
    /// entry behind until then.
    requests: DashMap<ThreadId, Arc<RequestScope>>,
    singletons: SingletonRegistries,
}

impl Runtime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }

    /// Runtime with `config`, no listeners and a detached session host
    pub fn new(config: RuntimeConfig) -> std::result::Result<Self, ConfigError> {
        Self::builder().config(config).build()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.env.config
    }

    pub fn metrics(&self) -> &ScopeMetrics {
        &self.env.metrics
    }

    pub fn listeners(&self) -> &LifecycleListeners {
        &self.env.listeners
    }

    // ===== Global scope =====

    /// Install the global scope under `id`
    ///
    /// Fails with `GlobalAlreadyPresent` on any second call, even after the
    /// first global scope has ended.
    pub fn set_global_scope(&self, id: &str) -> Result<Arc<GlobalScope>> {
        let global = {
            let mut slot = self.global.write();
            if let Some(existing) = slot.as_ref() {
                return Err(ScopeError::GlobalAlreadyPresent {
                    existing: existing.id().clone(),
                });
            }
            let global = Arc::new(GlobalScope::new(ScopeId::new(id), self.env.clone()));
            global.init_scope()?;
            *slot = Some(global.clone());
            global
        };
        global
            .core()
            .announce_began(|listener| listener.global_began(&global));
        info!(scope = %global.id(), "Global scope began");
        Ok(global)
    }

    /// Install the global scope under the configured id
    pub fn begin_global(&self) -> Result<Arc<GlobalScope>> {
        self.set_global_scope(&self.env.config.global_id)
    }

    /// The global scope, if present and still valid
    pub fn global_scope(&self) -> Result<Arc<GlobalScope>> {
        match self.global.read().as_ref() {
            Some(global) if global.is_valid() => Ok(global.clone()),
            _ => Err(ScopeError::NoGlobalScope),
        }
    }

    /// Destroy the global scope and everything it owns
    pub fn end_global(&self) -> Result<()> {
        let global = self.global_scope()?;
        global
            .core()
            .announce_ending(|listener| listener.global_ending(&global));
        global.destroy_scope()?;
        info!(scope = %global.id(), "Global scope ended");
        Ok(())
    }

    // ===== Request scope =====

    /// Begin a request on the calling thread
    ///
    /// A request still active on this thread is force-ended first.
    pub fn begin_request(
        &self,
        application_id: &str,
        scope_id: &str,
        session_id: Option<&str>,
    ) -> Result<Arc<RequestScope>> {
        self.global_scope()?;

        let thread = thread::current().id();
        if let Some((_, stale)) = self.requests.remove(&thread) {
            self.env.metrics.record_stale_request();
            warn!(
                stale = %stale.id(),
                request = scope_id,
                "Request scope still active on this thread; ending it"
            );
            if let Err(err) = self.finish_request(&stale) {
                error!(request = %stale.id(), error = %err, "Failed to end stale request");
            }
        }

        let request = Arc::new(RequestScope::new(
            ScopeId::new(scope_id),
            ScopeId::new(application_id),
            session_id.map(str::to_string),
            self.env.clone(),
        ));
        request.init_scope()?;
        self.requests.insert(thread, request.clone());
        request
            .core()
            .announce_began(|listener| listener.request_began(&request));
        Ok(request)
    }

    /// End the calling thread's request; without one this only logs
    pub fn end_request(&self) -> Result<()> {
        match self.requests.remove(&thread::current().id()) {
            Some((_, request)) => self.finish_request(&request),
            None => {
                warn!("end_request called with no active request");
                Ok(())
            }
        }
    }

    fn finish_request(&self, request: &RequestScope) -> Result<()> {
        request
            .core()
            .announce_ending(|listener| listener.request_ending(request));
        request.destroy_scope()
    }

    /// The calling thread's request
    pub fn current_request(&self) -> Result<Arc<RequestScope>> {
        self.requests
            .get(&thread::current().id())
            .map(|entry| entry.value().clone())
            .ok_or(ScopeError::NoRequestScope)
    }

    /// Requests active across all threads
    pub fn active_requests(&self) -> usize {
        self.requests.len()
    }

    // ===== Scope resolution =====

    pub fn application_scope(
        &self,
        id: &str,
        create: bool,
    ) -> Result<Option<Arc<ApplicationScope>>> {
        self.global_scope()?.application_scope(id, create)
    }

    /// Application scope of the current request
    pub fn current_application_scope(
        &self,
        create: bool,
    ) -> Result<Option<Arc<ApplicationScope>>> {
        let request = self.current_request()?;
        self.application_scope(request.application_id().as_str(), create)
    }

    pub fn session_registry(&self) -> Result<Arc<SessionRegistry>> {
        self.global_scope()?.session_registry()
    }

    /// Session of the current request
    ///
    /// With `create`, a request without a session id, or whose id was
    /// invalidated by renewal or `end_session`, gets a fresh id from the
    /// session host.
    pub fn session_scope(&self, create: bool) -> Result<Option<Arc<SessionScope>>> {
        let request = self.current_request()?;
        let registry = self.session_registry()?;
        match (request.session_id(), create) {
            (Some(id), true) => match registry.get_or_begin(&id) {
                Err(ScopeError::SessionInvalidated { .. }) => {
                    debug!(
                        request = %request.id(),
                        session = %id,
                        "Session id was invalidated; minting a new one"
                    );
                    self.begin_fresh_session(&request, &registry).map(Some)
                }
                found => found.map(Some),
            },
            (Some(id), false) => registry.session(&id),
            (None, true) => self.begin_fresh_session(&request, &registry).map(Some),
            (None, false) => Ok(None),
        }
    }

    fn begin_fresh_session(
        &self,
        request: &RequestScope,
        registry: &SessionRegistry,
    ) -> Result<Arc<SessionScope>> {
        let id = self.host.create_session_id();
        request.set_session_id(id.clone());
        registry.get_or_begin(&id)
    }

    pub fn session_application_scope(
        &self,
        application_id: &str,
        create: bool,
    ) -> Result<Option<Arc<SessionApplicationScope>>> {
        match self.session_scope(create)? {
            Some(session) => session.session_application_scope(application_id, create),
            None => Ok(None),
        }
    }

    /// Session-application scope of the current request's application
    pub fn current_session_application_scope(
        &self,
        create: bool,
    ) -> Result<Option<Arc<SessionApplicationScope>>> {
        let request = self.current_request()?;
        self.session_application_scope(request.application_id().as_str(), create)
    }

    fn require_application(&self) -> Result<Arc<ApplicationScope>> {
        let request = self.current_request()?;
        self.global_scope()?
            .get_or_create_application(request.application_id())
    }

    fn require_session(&self) -> Result<Arc<SessionScope>> {
        let request = self.current_request()?;
        self.session_scope(true)?.ok_or(ScopeError::NoSessionId {
            request: request.id().clone(),
        })
    }

    fn require_session_application(&self) -> Result<Arc<SessionApplicationScope>> {
        let request = self.current_request()?;
        self.require_session()?
            .get_or_create_application(request.application_id())
    }

    /// The current scope of `kind`, if it exists, without creating anything
    pub fn current_scope(&self, kind: ScopeKind) -> Result<Option<Arc<dyn Scope>>> {
        let scope: Option<Arc<dyn Scope>> = match kind {
            ScopeKind::Global => Some(self.global_scope()?),
            ScopeKind::Application => self
                .current_application_scope(false)?
                .map(|scope| scope as Arc<dyn Scope>),
            ScopeKind::Session => self
                .session_scope(false)?
                .map(|scope| scope as Arc<dyn Scope>),
            ScopeKind::SessionApplication => self
                .current_session_application_scope(false)?
                .map(|scope| scope as Arc<dyn Scope>),
            ScopeKind::Request => Some(self.current_request()?),
        };
        Ok(scope)
    }

    // ===== Sessions =====

    /// End the session `id` and tell the host to drop it
    ///
    /// The host is told even if the registry has no such session.
    pub fn end_session(&self, id: &str) -> Result<bool> {
        let registry = self.session_registry()?;
        let invalidated = registry.invalidate(id);
        let ended = registry.end_by_id(id);
        self.host.invalidate(id);
        invalidated?;
        ended
    }

    /// Move the current session to a fresh id
    ///
    /// Renewal-safe attributes of the session and its session-application
    /// scopes are carried over; the old session is invalidated and ended.
    pub fn renew_session(&self) -> Result<Arc<SessionScope>> {
        let request = self.current_request()?;
        let old_id = request.session_id().ok_or_else(|| ScopeError::NoSessionId {
            request: request.id().clone(),
        })?;
        let registry = self.session_registry()?;

        let old = registry.session(&old_id)?;
        let snapshot = match &old {
            Some(session) => RenewalSnapshot::capture(session)?,
            None => RenewalSnapshot::default(),
        };

        registry.invalidate(&old_id)?;
        self.host.invalidate(&old_id);
        if let Some(session) = &old {
            registry.end(session)?;
        }

        let new_id = self.host.create_session_id();
        request.set_session_id(new_id.clone());
        let renewed = registry.get_or_begin(&new_id)?;
        snapshot.replay(&renewed)?;

        self.env.metrics.record_session_renewal();
        info!(old = %old_id, new = %new_id, "Session renewed");
        Ok(renewed)
    }

    // ===== Singletons =====

    /// Register the factory for `T` in scopes of `kind`
    ///
    /// Returns `true` if a previous factory was replaced.
    pub fn register_singleton<T, F>(&self, kind: ScopeKind, factory: F) -> bool
    where
        T: Singleton,
        F: Fn() -> T + Send + Sync + 'static,
    {
        match kind {
            ScopeKind::Global => self.singletons.global.register(factory),
            ScopeKind::Application => self.singletons.application.register(factory),
            ScopeKind::Session => self.singletons.session.register(factory),
            ScopeKind::SessionApplication => {
                self.singletons.session_application.register(factory)
            }
            ScopeKind::Request => self.singletons.request.register(factory),
        }
    }

    /// The instance of `T` in the current scope of `kind`, created on first
    /// use; application and session scopes are created as needed
    pub fn singleton<T: Singleton>(&self, kind: ScopeKind) -> Result<Arc<T>> {
        match kind {
            ScopeKind::Global => self.singletons.global.get(&*self.global_scope()?),
            ScopeKind::Application => self
                .singletons
                .application
                .get(&*self.require_application()?),
            ScopeKind::Session => self.singletons.session.get(&*self.require_session()?),
            ScopeKind::SessionApplication => self
                .singletons
                .session_application
                .get(&*self.require_session_application()?),
            ScopeKind::Request => self.singletons.request.get(&*self.current_request()?),
        }
    }

    /// Whether `T` exists in the current scope of `kind`; never creates a
    /// scope or an instance
    pub fn is_singleton_instantiated<T: Singleton>(&self, kind: ScopeKind) -> Result<bool> {
        match self.current_scope(kind)? {
            Some(scope) => singleton::is_instantiated::<T>(&*scope),
            None => Ok(false),
        }
    }

    /// Every singleton in the current scope of `kind`
    pub fn all_singletons(&self, kind: ScopeKind) -> Result<Vec<Arc<dyn Singleton>>> {
        match self.current_scope(kind)? {
            Some(scope) => singleton::all(&*scope),
            None => Ok(Vec::new()),
        }
    }

    /// Every attribute of type `T` in the current scope of `kind`
    pub fn all_singletons_of<T: Any + Send + Sync>(
        &self,
        kind: ScopeKind,
    ) -> Result<Vec<Arc<T>>> {
        match self.current_scope(kind)? {
            Some(scope) => singleton::all_of::<T>(&*scope),
            None => Ok(Vec::new()),
        }
    }

    // ===== Shutdown =====

    /// End every active request on every thread, then the global scope
    ///
    /// This also ends requests left behind by threads that exited without
    /// calling `end_request`.
    pub fn shutdown(&self) -> Result<()> {
        let threads: Vec<ThreadId> = self.requests.iter().map(|entry| *entry.key()).collect();
        for thread in threads {
            if let Some((_, request)) = self.requests.remove(&thread) {
                if let Err(err) = self.finish_request(&request) {
                    error!(request = %request.id(), error = %err, "Failed to end request");
                }
            }
        }
        match self.global_scope() {
            Ok(_) => self.end_global(),
            Err(ScopeError::NoGlobalScope) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.env.config)
            .field("listeners", &self.env.listeners)
            .field("global", &self.global.read().as_ref().map(|g| g.id().clone()))
            .field("active_requests", &self.requests.len())
            .field("singletons", &self.singletons)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::AttributeValue;

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig::default()).unwrap()
    }

    #[test]
    fn test_global_slot_is_set_once() {
        let runtime = runtime();
        assert!(matches!(runtime.global_scope(), Err(ScopeError::NoGlobalScope)));

        let global = runtime.begin_global().unwrap();
        assert_eq!(global.id().as_str(), "global");
        assert!(matches!(
            runtime.set_global_scope("other"),
            Err(ScopeError::GlobalAlreadyPresent { .. })
        ));

        runtime.end_global().unwrap();
        assert!(matches!(runtime.global_scope(), Err(ScopeError::NoGlobalScope)));
        assert!(matches!(
            runtime.begin_global(),
            Err(ScopeError::GlobalAlreadyPresent { .. })
        ));
    }

    #[test]
    fn test_request_requires_global() {
        let runtime = runtime();
        assert!(matches!(
            runtime.begin_request("app", "r1", None),
            Err(ScopeError::NoGlobalScope)
        ));
        assert!(matches!(
            runtime.application_scope("app", true),
            Err(ScopeError::NoGlobalScope)
        ));
    }

    #[test]
    fn test_stale_request_is_force_ended() {
        let runtime = runtime();
        runtime.begin_global().unwrap();
        let first = runtime.begin_request("app", "r1", None).unwrap();
        let second = runtime.begin_request("app", "r2", None).unwrap();

        assert!(first.is_destroyed());
        assert!(second.is_valid());
        assert_eq!(runtime.metrics().snapshot().stale_requests, 1);
        assert_eq!(runtime.current_request().unwrap().id().as_str(), "r2");
    }

    #[test]
    fn test_request_abandoned_by_exited_thread_ends_at_shutdown() {
        let runtime = runtime();
        runtime.begin_global().unwrap();

        let abandoned = std::thread::scope(|s| {
            s.spawn(|| runtime.begin_request("app", "orphan", None).unwrap())
                .join()
                .unwrap()
        });

        assert_eq!(runtime.active_requests(), 1);
        assert!(abandoned.is_valid());

        runtime.shutdown().unwrap();
        assert!(abandoned.is_destroyed());
        assert_eq!(runtime.active_requests(), 0);
    }

    #[test]
    fn test_ended_session_id_is_not_reused() {
        let runtime = runtime();
        runtime.begin_global().unwrap();
        runtime.begin_request("app", "r1", Some("s1")).unwrap();
        let first = runtime.session_scope(true).unwrap().unwrap();
        runtime.end_request().unwrap();

        assert!(runtime.end_session("s1").unwrap());
        assert!(first.is_destroyed());

        let request = runtime.begin_request("app", "r2", Some("s1")).unwrap();
        assert!(runtime.session_scope(false).unwrap().is_none());
        let second = runtime.session_scope(true).unwrap().unwrap();

        assert_ne!(second.id().as_str(), "s1");
        assert_eq!(request.session_id().as_deref(), Some(second.id().as_str()));
        assert!(runtime.session_registry().unwrap().session("s1").unwrap().is_none());
    }

    #[test]
    fn test_double_end_request_is_recoverable() {
        let runtime = runtime();
        runtime.begin_global().unwrap();
        runtime.begin_request("app", "r1", None).unwrap();
        runtime.end_request().unwrap();
        runtime.end_request().unwrap();
        assert!(matches!(
            runtime.current_request(),
            Err(ScopeError::NoRequestScope)
        ));
    }

    #[test]
    fn test_session_created_on_demand() {
        let runtime = runtime();
        runtime.begin_global().unwrap();
        let request = runtime.begin_request("app", "r1", None).unwrap();

        assert!(runtime.session_scope(false).unwrap().is_none());
        let session = runtime.session_scope(true).unwrap().unwrap();
        assert_eq!(request.session_id().as_deref(), Some(session.id().as_str()));

        let again = runtime.session_scope(false).unwrap().unwrap();
        assert!(Arc::ptr_eq(&session, &again));
    }

    #[test]
    fn test_renew_session_moves_surviving_attributes() {
        let runtime = runtime();
        runtime.begin_global().unwrap();
        runtime.begin_request("app", "r1", Some("old")).unwrap();
        let old = runtime.session_scope(true).unwrap().unwrap();
        old.set("token", AttributeValue::new(7u32).surviving_renewal())
            .unwrap();

        let renewed = runtime.renew_session().unwrap();

        assert!(old.is_destroyed());
        assert_ne!(renewed.id().as_str(), "old");
        assert_eq!(
            renewed.get("token").unwrap().unwrap().downcast_ref::<u32>(),
            Some(&7)
        );
        let registry = runtime.session_registry().unwrap();
        assert!(registry.session("old").unwrap().is_none());
        assert_eq!(runtime.metrics().snapshot().session_renewals, 1);
    }

    #[test]
    fn test_renew_without_session_is_a_fault() {
        let runtime = runtime();
        runtime.begin_global().unwrap();
        runtime.begin_request("app", "r1", None).unwrap();
        assert!(matches!(
            runtime.renew_session(),
            Err(ScopeError::NoSessionId { .. })
        ));
    }

    #[derive(Default)]
    struct Cache;

    impl Singleton for Cache {}

    #[test]
    fn test_singletons_by_kind() {
        let runtime = runtime();
        runtime.begin_global().unwrap();
        runtime.begin_request("app", "r1", Some("s1")).unwrap();
        runtime.register_singleton(ScopeKind::Session, Cache::default);

        assert!(!runtime
            .is_singleton_instantiated::<Cache>(ScopeKind::Session)
            .unwrap());
        let first = runtime.singleton::<Cache>(ScopeKind::Session).unwrap();
        let second = runtime.singleton::<Cache>(ScopeKind::Session).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(runtime
            .is_singleton_instantiated::<Cache>(ScopeKind::Session)
            .unwrap());
        let all = runtime.all_singletons_of::<Cache>(ScopeKind::Session).unwrap();
        assert_eq!(all.len(), 1);

        assert!(matches!(
            runtime.singleton::<Cache>(ScopeKind::Application),
            Err(ScopeError::Singleton(_))
        ));
    }

    #[test]
    fn test_shutdown_ends_everything() {
        let runtime = runtime();
        let global = runtime.begin_global().unwrap();
        let request = runtime.begin_request("app", "r1", Some("s1")).unwrap();
        let session = runtime.session_scope(true).unwrap().unwrap();
        let app = runtime.current_application_scope(true).unwrap().unwrap();

        runtime.shutdown().unwrap();

        assert!(request.is_destroyed());
        assert!(app.is_destroyed());
        assert!(session.is_destroyed());
        assert!(global.is_destroyed());
        assert_eq!(runtime.active_requests(), 0);
        runtime.shutdown().unwrap();
    }
}
