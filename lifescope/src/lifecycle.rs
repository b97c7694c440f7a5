//! Lifecycle listeners
//!
//! Listeners are registered on the [`RuntimeBuilder`](crate::RuntimeBuilder)
//! and frozen when the runtime is built. Every begin/end transition of a
//! scope is fanned out to them in registration order. A listener that
//! returns an error or panics is logged and skipped; the transition and the
//! remaining listeners always proceed.

use crate::error::CallbackError;
use crate::metrics::ScopeMetrics;
use crate::scope::{
    ApplicationScope, GlobalScope, RequestScope, SessionApplicationScope, SessionScope,
};
use lifescope_types::{ScopeId, ScopeKind};
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{error, warn};

pub type ListenerResult = Result<(), CallbackError>;

/// Observer of scope transitions
///
/// `*_began` fires after the scope is initialized and reachable.
/// `*_ending` fires immediately before the scope's destruction starts.
#[allow(unused_variables)]
pub trait LifecycleListener: Send + Sync {
    /// Name used in log records
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn global_began(&self, scope: &GlobalScope) -> ListenerResult {
        Ok(())
    }

    fn global_ending(&self, scope: &GlobalScope) -> ListenerResult {
        Ok(())
    }

    fn application_began(&self, scope: &ApplicationScope) -> ListenerResult {
        Ok(())
    }

    fn application_ending(&self, scope: &ApplicationScope) -> ListenerResult {
        Ok(())
    }

    fn session_began(&self, scope: &SessionScope) -> ListenerResult {
        Ok(())
    }

    fn session_ending(&self, scope: &SessionScope) -> ListenerResult {
        Ok(())
    }

    fn session_application_began(&self, scope: &SessionApplicationScope) -> ListenerResult {
        Ok(())
    }

    fn session_application_ending(&self, scope: &SessionApplicationScope) -> ListenerResult {
        Ok(())
    }

    fn request_began(&self, scope: &RequestScope) -> ListenerResult {
        Ok(())
    }

    fn request_ending(&self, scope: &RequestScope) -> ListenerResult {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Began,
    Ending,
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transition::Began => f.write_str("began"),
            Transition::Ending => f.write_str("ending"),
        }
    }
}

/// Ordered, immutable listener list
#[derive(Clone, Default)]
pub struct LifecycleListeners {
    listeners: Vec<Arc<dyn LifecycleListener>>,
}

impl LifecycleListeners {
    pub fn new(listeners: Vec<Arc<dyn LifecycleListener>>) -> Self {
        LifecycleListeners { listeners }
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.listeners.iter().map(|l| l.name().to_string()).collect()
    }

    /// Invoke `call` on every listener, isolating each one
    pub(crate) fn dispatch<F>(
        &self,
        kind: ScopeKind,
        transition: Transition,
        scope: &ScopeId,
        metrics: &ScopeMetrics,
        call: F,
    ) where
        F: Fn(&dyn LifecycleListener) -> ListenerResult,
    {
        for listener in &self.listeners {
            match catch_unwind(AssertUnwindSafe(|| call(listener.as_ref()))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    metrics.record_listener_failure();
                    warn!(
                        listener = listener.name(),
                        %kind,
                        scope = %scope,
                        %transition,
                        error = %err,
                        "Lifecycle listener failed"
                    );
                }
                Err(payload) => {
                    metrics.record_listener_failure();
                    error!(
                        listener = listener.name(),
                        %kind,
                        scope = %scope,
                        %transition,
                        panic = %panic_message(payload.as_ref()),
                        "Lifecycle listener panicked"
                    );
                }
            }
        }
    }
}

impl fmt::Debug for LifecycleListeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// Best-effort text of a panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        String::from("non-string panic payload")
    }
}
