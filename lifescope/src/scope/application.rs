use super::{Scope, ScopeCore, ScopeEnv};
use lifescope_types::{ScopeId, ScopeKind};
use std::sync::Arc;

/// Per-application scope, reachable only through the global scope
#[derive(Debug)]
pub struct ApplicationScope {
    core: ScopeCore,
}

impl ApplicationScope {
    pub(crate) fn new(id: ScopeId, env: Arc<ScopeEnv>) -> Self {
        ApplicationScope {
            core: ScopeCore::new(ScopeKind::Application, id, env),
        }
    }
}

impl Scope for ApplicationScope {
    fn core(&self) -> &ScopeCore {
        &self.core
    }
}
