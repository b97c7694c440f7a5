//! Type-erased attribute values
//!
//! An [`AttributeValue`] is a cheap, cloneable handle to an
//! `Arc<dyn Any + Send + Sync>`. Capabilities that the scope machinery cares
//! about are declared when the value is built rather than discovered at
//! destruction time:
//! - how two values compare when an attribute is overwritten,
//! - whether the value wants to hear about its scope's destruction,
//! - whether the value is carried over when a session is renewed.

use crate::error::CallbackError;
use crate::singleton::Singleton;
use lifescope_types::ScopeId;
use std::any::{type_name, Any};
use std::fmt;
use std::sync::Arc;

/// Capability of values that must be told when their scope is destroyed
///
/// The hook runs while the scope is `InDestruction`, before its attributes
/// are cleared, so sibling attributes are still readable.
pub trait DestructionAware: Send + Sync {
    fn on_scope_destruction(&self, scope: &ScopeId) -> Result<(), CallbackError>;
}

type ErasedEq = fn(&(dyn Any + Send + Sync), &(dyn Any + Send + Sync)) -> bool;

fn value_eq<T: PartialEq + 'static>(
    left: &(dyn Any + Send + Sync),
    right: &(dyn Any + Send + Sync),
) -> bool {
    match (left.downcast_ref::<T>(), right.downcast_ref::<T>()) {
        (Some(left), Some(right)) => left == right,
        _ => false,
    }
}

#[derive(Clone)]
enum Hook {
    None,
    Aware(Arc<dyn DestructionAware>),
    Singleton(Arc<dyn Singleton>),
}

/// A value stored in a scope
#[derive(Clone)]
pub struct AttributeValue {
    value: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
    /// `None` means identity equality
    eq: Option<ErasedEq>,
    hook: Hook,
    survives_renewal: bool,
}

impl AttributeValue {
    /// Wrap a plain value; overwriting it with an equal value is `Unchanged`
    pub fn new<T>(value: T) -> Self
    where
        T: Any + Send + Sync + PartialEq,
    {
        AttributeValue {
            value: Arc::new(value),
            type_name: type_name::<T>(),
            eq: Some(value_eq::<T>),
            hook: Hook::None,
            survives_renewal: false,
        }
    }

    /// Store an already shared value, compared by identity
    pub fn shared<T>(value: Arc<T>) -> Self
    where
        T: Any + Send + Sync,
    {
        AttributeValue {
            value,
            type_name: type_name::<T>(),
            eq: None,
            hook: Hook::None,
            survives_renewal: false,
        }
    }

    /// Store a value that is notified when its scope is destroyed
    pub fn destruction_aware<T>(value: Arc<T>) -> Self
    where
        T: DestructionAware + Any,
    {
        let hook: Arc<dyn DestructionAware> = value.clone();
        AttributeValue {
            value,
            type_name: type_name::<T>(),
            eq: None,
            hook: Hook::Aware(hook),
            survives_renewal: false,
        }
    }

    pub(crate) fn singleton<T: Singleton>(instance: Arc<T>) -> Self {
        let hook: Arc<dyn Singleton> = instance.clone();
        AttributeValue {
            value: instance,
            type_name: type_name::<T>(),
            eq: None,
            hook: Hook::Singleton(hook),
            survives_renewal: false,
        }
    }

    /// Mark the value as safe to copy into a renewed session
    pub fn surviving_renewal(mut self) -> Self {
        self.survives_renewal = true;
        self
    }

    pub fn survives_renewal(&self) -> bool {
        self.survives_renewal
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn is<T: Any>(&self) -> bool {
        self.value.is::<T>()
    }

    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.value.clone().downcast::<T>().ok()
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    /// Whether storing `other` over `self` would be a no-op
    pub fn same_as(&self, other: &AttributeValue) -> bool {
        if Arc::ptr_eq(&self.value, &other.value) {
            return true;
        }
        match (self.eq, other.eq) {
            (Some(eq), Some(_)) => eq(self.value.as_ref(), other.value.as_ref()),
            _ => false,
        }
    }

    pub(crate) fn as_singleton(&self) -> Option<&Arc<dyn Singleton>> {
        match &self.hook {
            Hook::Singleton(instance) => Some(instance),
            _ => None,
        }
    }

    /// Run the destruction capability, if the value has one
    pub(crate) fn notify_destruction(&self, scope: &ScopeId) -> Option<Result<(), CallbackError>> {
        match &self.hook {
            Hook::None => None,
            Hook::Aware(aware) => Some(aware.on_scope_destruction(scope)),
            Hook::Singleton(instance) => Some(instance.pre_destroy()),
        }
    }
}

impl fmt::Debug for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttributeValue")
            .field("type_name", &self.type_name)
            .field("survives_renewal", &self.survives_renewal)
            .finish_non_exhaustive()
    }
}
