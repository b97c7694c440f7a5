//! Scope-local singletons
//!
//! A singleton is stored as an ordinary attribute under
//! `"singleton." + type name`, so there is at most one instance of a type
//! per scope instance while sibling scopes each get their own.
//!
//! # Instantiation protocol
//!
//! 1. Probe under the read lock and return the instance if present.
//! 2. Otherwise take the write lock, re-probe, and only if still absent run
//!    the factory and store the instance.
//! 3. After the lock is released, and only if this call created the
//!    instance, run [`Singleton::post_construct`].
//!
//! Factories run under the scope's write lock and must not touch the scope.
//! `post_construct` runs unlocked and may resolve other singletons.

use crate::attributes::AttributeValue;
use crate::error::{CallbackError, Result, ScopeError, SingletonError};
use crate::lifecycle::panic_message;
use crate::scope::Scope;
use dashmap::DashMap;
use lifescope_types::ScopeKind;
use std::any::{type_name, Any, TypeId};
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, warn};

const SINGLETON_PREFIX: &str = "singleton.";

/// An object that exists at most once per scope instance
#[allow(unused_variables)]
pub trait Singleton: Any + Send + Sync {
    /// Runs once, right after the instance is registered in `scope`
    fn post_construct(&self, scope: &dyn Scope) -> std::result::Result<(), CallbackError> {
        Ok(())
    }

    /// Runs while the owning scope is being destroyed
    fn pre_destroy(&self) -> std::result::Result<(), CallbackError> {
        Ok(())
    }
}

/// Attribute key a singleton of type `T` is stored under
pub fn singleton_key<T: ?Sized>() -> String {
    format!("{}{}", SINGLETON_PREFIX, type_name::<T>())
}

fn type_mismatch<T>(scope: &dyn Scope, key: &str) -> ScopeError {
    SingletonError::TypeMismatch {
        kind: scope.kind(),
        id: scope.id().clone(),
        key: key.to_string(),
        type_name: type_name::<T>(),
    }
    .into()
}

fn downcast_entry<T: Singleton>(
    scope: &dyn Scope,
    key: &str,
    value: &AttributeValue,
) -> Result<Arc<T>> {
    value
        .downcast::<T>()
        .ok_or_else(|| type_mismatch::<T>(scope, key))
}

/// The registered instance of `T`, without instantiating it
pub fn lookup<T: Singleton>(scope: &dyn Scope) -> Result<Option<Arc<T>>> {
    let key = singleton_key::<T>();
    let found = scope
        .core()
        .read_attributes(|attributes| attributes.get(&key).cloned())?;
    match found {
        Some(value) => downcast_entry::<T>(scope, &key, &value).map(Some),
        None => Ok(None),
    }
}

/// Return the instance of `T` in `scope`, creating it with `factory` on
/// first access
pub fn get_or_create<T, F>(scope: &dyn Scope, factory: F) -> Result<Arc<T>>
where
    T: Singleton,
    F: FnOnce() -> T,
{
    if let Some(instance) = lookup::<T>(scope)? {
        return Ok(instance);
    }

    let key = singleton_key::<T>();
    let (instance, created) = scope.core().write_attributes(|attributes| {
        if let Some(existing) = attributes.get(&key) {
            return downcast_entry::<T>(scope, &key, existing).map(|instance| (instance, false));
        }
        let instance = Arc::new(factory());
        attributes.set(key.as_str(), AttributeValue::singleton(instance.clone()));
        Ok((instance, true))
    })??;

    if created {
        let env = scope.core().env();
        env.metrics.record_singleton_instantiated();
        debug!(
            kind = %scope.kind(),
            scope = %scope.id(),
            singleton = type_name::<T>(),
            "Singleton instantiated"
        );
        match catch_unwind(AssertUnwindSafe(|| instance.post_construct(scope))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                env.metrics.record_hook_failure();
                warn!(
                    kind = %scope.kind(),
                    scope = %scope.id(),
                    singleton = type_name::<T>(),
                    error = %err,
                    "Singleton post-construct hook failed"
                );
            }
            Err(payload) => {
                env.metrics.record_hook_failure();
                error!(
                    kind = %scope.kind(),
                    scope = %scope.id(),
                    singleton = type_name::<T>(),
                    panic = %panic_message(payload.as_ref()),
                    "Singleton post-construct hook panicked"
                );
            }
        }
    }
    Ok(instance)
}

/// Whether an instance of `T` exists in `scope`; never instantiates
pub fn is_instantiated<T: Singleton>(scope: &dyn Scope) -> Result<bool> {
    let key = singleton_key::<T>();
    scope
        .core()
        .read_attributes(|attributes| attributes.contains(&key))
}

/// Copy of every singleton registered in `scope`, ordered by key
pub fn all(scope: &dyn Scope) -> Result<Vec<Arc<dyn Singleton>>> {
    scope.core().read_attributes(|attributes| {
        attributes
            .entries()
            .into_iter()
            .filter(|(name, _)| name.starts_with(SINGLETON_PREFIX))
            .filter_map(|(_, value)| value.as_singleton().cloned())
            .collect()
    })
}

/// Copy of every attribute value in `scope` that is a `T`
pub fn all_of<T: Any + Send + Sync>(scope: &dyn Scope) -> Result<Vec<Arc<T>>> {
    scope.core().read_attributes(|attributes| {
        attributes
            .entries()
            .into_iter()
            .filter_map(|(_, value)| value.downcast::<T>())
            .collect()
    })
}

type Factory<T> = Arc<dyn Fn() -> T + Send + Sync>;

/// Per-type factories for the singletons of one scope kind
///
/// `S` pins the registry to a scope type, so a factory registered for
/// session scopes cannot be resolved against an application scope.
pub struct SingletonRegistry<S> {
    kind: ScopeKind,
    factories: DashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    _scope: PhantomData<fn(&S)>,
}

impl<S: Scope> SingletonRegistry<S> {
    pub fn new(kind: ScopeKind) -> Self {
        SingletonRegistry {
            kind,
            factories: DashMap::new(),
            _scope: PhantomData,
        }
    }

    pub fn kind(&self) -> ScopeKind {
        self.kind
    }

    /// Register the factory for `T`; returns `true` if one was replaced
    pub fn register<T, F>(&self, factory: F) -> bool
    where
        T: Singleton,
        F: Fn() -> T + Send + Sync + 'static,
    {
        let factory: Factory<T> = Arc::new(factory);
        self.factories
            .insert(TypeId::of::<T>(), Arc::new(factory))
            .is_some()
    }

    pub fn register_default<T: Singleton + Default>(&self) -> bool {
        self.register(T::default)
    }

    pub fn is_registered<T: Singleton>(&self) -> bool {
        self.factories.contains_key(&TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    fn factory<T: Singleton>(&self) -> Option<Factory<T>> {
        let erased = self.factories.get(&TypeId::of::<T>())?.value().clone();
        erased
            .downcast::<Factory<T>>()
            .ok()
            .map(|factory| (*factory).clone())
    }

    /// Resolve `T` in `scope`, instantiating it from its factory on first use
    pub fn get<T: Singleton>(&self, scope: &S) -> Result<Arc<T>> {
        if let Some(instance) = lookup::<T>(scope)? {
            return Ok(instance);
        }
        let factory = self
            .factory::<T>()
            .ok_or(SingletonError::NotRegistered {
                kind: self.kind,
                type_name: type_name::<T>(),
            })?;
        get_or_create(scope, || factory())
    }

    pub fn is_instantiated<T: Singleton>(&self, scope: &S) -> Result<bool> {
        is_instantiated::<T>(scope)
    }

    pub fn all(&self, scope: &S) -> Result<Vec<Arc<dyn Singleton>>> {
        all(scope)
    }

    pub fn all_of<T: Any + Send + Sync>(&self, scope: &S) -> Result<Vec<Arc<T>>> {
        all_of::<T>(scope)
    }
}

impl<S> std::fmt::Debug for SingletonRegistry<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingletonRegistry")
            .field("kind", &self.kind)
            .field("factories", &self.factories.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::{test_env, ApplicationScope};
    use lifescope_types::ScopeId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter {
        hits: AtomicUsize,
    }

    impl Singleton for Counter {}

    struct Dependent {
        counter_seen: AtomicUsize,
    }

    impl Singleton for Dependent {
        fn post_construct(&self, scope: &dyn Scope) -> std::result::Result<(), CallbackError> {
            // Unlocked: resolving another singleton from here must not deadlock
            let counter = get_or_create(scope, Counter::default)?;
            counter.hits.fetch_add(1, Ordering::SeqCst);
            self.counter_seen.store(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Faulty;

    impl Singleton for Faulty {
        fn post_construct(&self, _scope: &dyn Scope) -> std::result::Result<(), CallbackError> {
            Err("cannot start".into())
        }
    }

    fn scope() -> ApplicationScope {
        let scope = ApplicationScope::new(ScopeId::new("app"), test_env());
        scope.init_scope().unwrap();
        scope
    }

    #[test]
    fn test_key_is_prefixed_type_name() {
        assert_eq!(
            singleton_key::<Counter>(),
            format!("singleton.{}", type_name::<Counter>())
        );
    }

    #[test]
    fn test_get_or_create_reuses_instance() {
        let scope = scope();
        assert!(!is_instantiated::<Counter>(&scope).unwrap());
        let first = get_or_create(&scope, Counter::default).unwrap();
        let second = get_or_create(&scope, || -> Counter { panic!("factory ran twice") }).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(is_instantiated::<Counter>(&scope).unwrap());
        assert_eq!(
            scope.core().env().metrics.snapshot().singletons_instantiated,
            1
        );
    }

    #[test]
    fn test_post_construct_may_resolve_other_singletons() {
        let scope = scope();
        let dependent = get_or_create(&scope, || Dependent {
            counter_seen: AtomicUsize::new(0),
        })
        .unwrap();
        assert_eq!(dependent.counter_seen.load(Ordering::SeqCst), 1);
        let counter = lookup::<Counter>(&scope).unwrap().unwrap();
        assert_eq!(counter.hits.load(Ordering::SeqCst), 1);
        assert_eq!(all(&scope).unwrap().len(), 2);
    }

    #[test]
    fn test_failed_post_construct_keeps_instance() {
        let scope = scope();
        get_or_create(&scope, || Faulty).unwrap();
        assert!(is_instantiated::<Faulty>(&scope).unwrap());
        assert_eq!(scope.core().env().metrics.snapshot().hook_failures, 1);
    }

    #[test]
    fn test_type_mismatch_under_singleton_key() {
        let scope = scope();
        scope
            .set(&singleton_key::<Counter>(), AttributeValue::new(5u32))
            .unwrap();
        assert!(matches!(
            lookup::<Counter>(&scope),
            Err(ScopeError::Singleton(SingletonError::TypeMismatch { .. }))
        ));
    }

    #[test]
    fn test_registry_requires_factory() {
        let registry: SingletonRegistry<ApplicationScope> =
            SingletonRegistry::new(ScopeKind::Application);
        let scope = scope();
        assert!(matches!(
            registry.get::<Counter>(&scope),
            Err(ScopeError::Singleton(SingletonError::NotRegistered { .. }))
        ));

        assert!(!registry.register_default::<Counter>());
        assert!(registry.register_default::<Counter>());
        assert!(registry.is_registered::<Counter>());

        let instance = registry.get::<Counter>(&scope).unwrap();
        assert!(Arc::ptr_eq(&instance, &registry.get::<Counter>(&scope).unwrap()));
        assert!(registry.is_instantiated::<Counter>(&scope).unwrap());
        assert_eq!(registry.all_of::<Counter>(&scope).unwrap().len(), 1);
    }

    #[test]
    fn test_pre_destroy_runs_with_scope_destruction() {
        struct Closer(Arc<AtomicUsize>);
        impl Singleton for Closer {
            fn pre_destroy(&self) -> std::result::Result<(), CallbackError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let closed = Arc::new(AtomicUsize::new(0));
        let scope = scope();
        let handle = closed.clone();
        get_or_create(&scope, move || Closer(handle)).unwrap();
        scope.destroy_scope().unwrap();
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }
}
