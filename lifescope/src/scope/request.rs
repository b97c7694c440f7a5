use super::{Scope, ScopeCore, ScopeEnv};
use lifescope_types::{ScopeId, ScopeKind};
use parking_lot::RwLock;
use std::sync::Arc;
use std::thread::{self, ThreadId};

/// Per-request scope, bound to the thread that began it
#[derive(Debug)]
pub struct RequestScope {
    core: ScopeCore,
    application_id: ScopeId,
    session_id: RwLock<Option<String>>,
    thread: ThreadId,
}

impl RequestScope {
    pub(crate) fn new(
        id: ScopeId,
        application_id: ScopeId,
        session_id: Option<String>,
        env: Arc<ScopeEnv>,
    ) -> Self {
        RequestScope {
            core: ScopeCore::new(ScopeKind::Request, id, env),
            application_id,
            session_id: RwLock::new(session_id),
            thread: thread::current().id(),
        }
    }

    /// Application the request is served by
    pub fn application_id(&self) -> &ScopeId {
        &self.application_id
    }

    /// Session the request is attached to, if any
    pub fn session_id(&self) -> Option<String> {
        self.session_id.read().clone()
    }

    pub(crate) fn set_session_id(&self, session_id: String) {
        *self.session_id.write() = Some(session_id);
    }

    pub fn thread(&self) -> ThreadId {
        self.thread
    }
}

impl Scope for RequestScope {
    fn core(&self) -> &ScopeCore {
        &self.core
    }
}
