//! Session and session-application scopes

use super::{destroy_children, ChildScopes, Scope, ScopeCore, ScopeEnv};
use crate::error::Result;
use lifescope_types::{ScopeId, ScopeKind};
use std::sync::Arc;

/// Per-session scope, tracked by the
/// [`SessionRegistry`](crate::SessionRegistry)
#[derive(Debug)]
pub struct SessionScope {
    core: ScopeCore,
    applications: ChildScopes<SessionApplicationScope>,
}

impl SessionScope {
    pub(crate) fn new(id: ScopeId, env: Arc<ScopeEnv>) -> Self {
        SessionScope {
            core: ScopeCore::new(ScopeKind::Session, id, env),
            applications: ChildScopes::new(),
        }
    }

    /// Resolve the scope of `application_id` within this session
    pub fn session_application_scope(
        &self,
        application_id: &str,
        create: bool,
    ) -> Result<Option<Arc<SessionApplicationScope>>> {
        let id = ScopeId::new(application_id);
        if create {
            self.get_or_create_application(&id).map(Some)
        } else {
            self.applications.get(&self.core, &id)
        }
    }

    pub(crate) fn get_or_create_application(
        &self,
        application_id: &ScopeId,
    ) -> Result<Arc<SessionApplicationScope>> {
        let env = self.core.env();
        let session_id = self.core.id().clone();
        let (scope, created) =
            self.applications
                .get_or_create(&self.core, application_id, move || {
                    SessionApplicationScope::new(application_id.clone(), session_id, env.clone())
                })?;
        if created {
            scope
                .core()
                .announce_began(|listener| listener.session_application_began(&scope));
        }
        Ok(scope)
    }

    /// Live session-application scopes, ordered by application id
    pub fn session_application_scopes(&self) -> Vec<Arc<SessionApplicationScope>> {
        self.applications.all()
    }

    pub fn application_ids(&self) -> Vec<ScopeId> {
        self.applications.ids()
    }
}

impl Scope for SessionScope {
    fn core(&self) -> &ScopeCore {
        &self.core
    }

    fn destroy_owned_scopes(&self) -> Result<()> {
        destroy_children(&self.core, &self.applications, |scope, listener| {
            listener.session_application_ending(scope)
        })
    }
}

/// Scope of one application within one session
///
/// Its id is `<session id>.<application id>`, unique across sessions; the
/// session owns it under the bare application id.
#[derive(Debug)]
pub struct SessionApplicationScope {
    core: ScopeCore,
    application_id: ScopeId,
    session_id: ScopeId,
}

impl SessionApplicationScope {
    pub(crate) fn new(application_id: ScopeId, session_id: ScopeId, env: Arc<ScopeEnv>) -> Self {
        let id = ScopeId::new(format!("{}.{}", session_id, application_id));
        SessionApplicationScope {
            core: ScopeCore::new(ScopeKind::SessionApplication, id, env),
            application_id,
            session_id,
        }
    }

    pub fn application_id(&self) -> &ScopeId {
        &self.application_id
    }

    pub fn session_id(&self) -> &ScopeId {
        &self.session_id
    }
}

impl Scope for SessionApplicationScope {
    fn core(&self) -> &ScopeCore {
        &self.core
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::AttributeValue;
    use crate::scope::test_env;

    #[test]
    fn test_children_are_keyed_by_application() {
        let session = SessionScope::new(ScopeId::new("s1"), test_env());
        session.init_scope().unwrap();

        let app = session
            .session_application_scope("app1", true)
            .unwrap()
            .unwrap();
        assert_eq!(app.application_id().as_str(), "app1");
        assert_eq!(app.session_id().as_str(), "s1");
        assert_eq!(app.id().as_str(), "s1.app1");
        assert_eq!(session.application_ids(), vec![ScopeId::new("app1")]);
        assert!(session
            .session_application_scope("app2", false)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_same_application_gets_distinct_ids_per_session() {
        let env = test_env();
        let first = SessionScope::new(ScopeId::new("s1"), env.clone());
        let second = SessionScope::new(ScopeId::new("s2"), env);
        first.init_scope().unwrap();
        second.init_scope().unwrap();

        let a = first
            .session_application_scope("app1", true)
            .unwrap()
            .unwrap();
        let b = second
            .session_application_scope("app1", true)
            .unwrap()
            .unwrap();

        assert_ne!(a.id(), b.id());
        assert_eq!(a.application_id(), b.application_id());
        assert!(Arc::ptr_eq(
            &a,
            &first
                .session_application_scope("app1", false)
                .unwrap()
                .unwrap()
        ));
    }

    #[test]
    fn test_destroying_session_destroys_children() {
        let session = SessionScope::new(ScopeId::new("s1"), test_env());
        session.init_scope().unwrap();
        let app = session
            .session_application_scope("app1", true)
            .unwrap()
            .unwrap();
        app.set("c", AttributeValue::new(2u8)).unwrap();

        session.destroy_scope().unwrap();

        assert!(app.is_destroyed());
        assert!(session.session_application_scopes().is_empty());
        let metrics = session.core().env().metrics.snapshot();
        assert_eq!(metrics.scopes_destroyed.session_application, 1);
        assert_eq!(metrics.scopes_destroyed.session, 1);
    }
}
