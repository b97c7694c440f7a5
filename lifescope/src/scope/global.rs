//! The process-wide scope

use super::{destroy_children, ApplicationScope, ChildScopes, Scope, ScopeCore, ScopeEnv};
use crate::error::Result;
use crate::session_registry::SessionRegistry;
use crate::singleton;
use lifescope_types::{ScopeId, ScopeKind};
use std::sync::Arc;
use tracing::info;

/// Root of the hierarchy; owns every application scope
#[derive(Debug)]
pub struct GlobalScope {
    core: ScopeCore,
    applications: ChildScopes<ApplicationScope>,
}

impl GlobalScope {
    pub(crate) fn new(id: ScopeId, env: Arc<ScopeEnv>) -> Self {
        GlobalScope {
            core: ScopeCore::new(ScopeKind::Global, id, env),
            applications: ChildScopes::new(),
        }
    }

    /// Resolve an application scope, creating it when `create` is set
    pub fn application_scope(
        &self,
        id: &str,
        create: bool,
    ) -> Result<Option<Arc<ApplicationScope>>> {
        let id = ScopeId::new(id);
        if create {
            self.get_or_create_application(&id).map(Some)
        } else {
            self.applications.get(&self.core, &id)
        }
    }

    pub(crate) fn get_or_create_application(
        &self,
        id: &ScopeId,
    ) -> Result<Arc<ApplicationScope>> {
        let env = self.core.env();
        let (application, created) = self.applications.get_or_create(&self.core, id, || {
            ApplicationScope::new(id.clone(), env.clone())
        })?;
        if created {
            application
                .core()
                .announce_began(|listener| listener.application_began(&application));
        }
        Ok(application)
    }

    /// Live application scopes, ordered by id
    pub fn application_scopes(&self) -> Vec<Arc<ApplicationScope>> {
        self.applications.all()
    }

    pub fn application_ids(&self) -> Vec<ScopeId> {
        self.applications.ids()
    }

    pub fn application_count(&self) -> usize {
        self.applications.len()
    }

    /// The session registry singleton of this global scope
    pub fn session_registry(&self) -> Result<Arc<SessionRegistry>> {
        let env = self.core.env().clone();
        singleton::get_or_create(self, move || SessionRegistry::new(env))
    }
}

impl Scope for GlobalScope {
    fn core(&self) -> &ScopeCore {
        &self.core
    }

    fn destroy_owned_scopes(&self) -> Result<()> {
        destroy_children(&self.core, &self.applications, |application, listener| {
            listener.application_ending(application)
        })
    }

    fn post_destroy(&self) {
        info!(scope = %self.core.id(), "Global scope destroyed");
    }
}
