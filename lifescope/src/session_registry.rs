//! Registry of live sessions
//!
//! The registry is a singleton of the global scope. It maps session ids to
//! [`SessionScope`]s and keeps the set of ids whose end-of-session sequence
//! is running. Both live behind one lock. An id in that set makes further
//! `end` calls no-ops and refuses to hand out a session under that id.
//!
//! Ids invalidated at the session host are remembered for the registry's
//! lifetime and never registered again.

use crate::config::SessionTeardown;
use crate::error::{CallbackError, Result, ScopeError};
use crate::scope::{Scope, ScopeEnv, SessionScope};
use crate::singleton::Singleton;
use lifescope_types::ScopeId;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

#[derive(Debug, Default)]
struct SessionTable {
    sessions: HashMap<String, Arc<SessionScope>>,
    in_destruction: HashSet<String>,
    invalidated: HashSet<String>,
}

impl SessionTable {
    /// Why `id` cannot be registered right now, if it cannot
    fn refusal(&self, id: &str) -> Option<ScopeError> {
        if self.invalidated.contains(id) {
            Some(ScopeError::SessionInvalidated { id: id.to_string() })
        } else if self.in_destruction.contains(id) {
            Some(ScopeError::SessionEnding { id: id.to_string() })
        } else {
            None
        }
    }
}

/// Live sessions of one global scope
#[derive(Debug)]
pub struct SessionRegistry {
    env: Arc<ScopeEnv>,
    table: RwLock<SessionTable>,
    unique_sessions: AtomicU64,
}

/// Removes an id from the in-destruction set however `end` exits
struct EndingGuard<'a> {
    registry: &'a SessionRegistry,
    id: &'a str,
}

impl Drop for EndingGuard<'_> {
    fn drop(&mut self) {
        self.registry.table.write().in_destruction.remove(self.id);
    }
}

impl SessionRegistry {
    pub(crate) fn new(env: Arc<ScopeEnv>) -> Self {
        SessionRegistry {
            env,
            table: RwLock::new(SessionTable::default()),
            unique_sessions: AtomicU64::new(0),
        }
    }

    fn read_table(&self) -> Result<RwLockReadGuard<'_, SessionTable>> {
        let timeout = self.env.config.lock_timeout();
        self.table
            .try_read_for(timeout)
            .ok_or(ScopeError::RegistryLockTimeout { waited: timeout })
    }

    fn write_table(&self) -> Result<RwLockWriteGuard<'_, SessionTable>> {
        let timeout = self.env.config.lock_timeout();
        self.table
            .try_write_for(timeout)
            .ok_or(ScopeError::RegistryLockTimeout { waited: timeout })
    }

    fn announce(&self, session: &SessionScope) {
        self.unique_sessions.fetch_add(1, Ordering::Relaxed);
        self.env.metrics.record_unique_session();
        session
            .core()
            .announce_began(|listener| listener.session_began(session));
    }

    /// Begin a session under `id`
    ///
    /// An existing live entry under the same id is replaced and logged; it
    /// is not destroyed.
    pub fn begin(&self, id: &str) -> Result<Arc<SessionScope>> {
        let session = Arc::new(SessionScope::new(ScopeId::new(id), self.env.clone()));
        session.init_scope()?;
        {
            let mut table = self.write_table()?;
            if let Some(refusal) = table.refusal(id) {
                return Err(refusal);
            }
            if table
                .sessions
                .insert(id.to_string(), session.clone())
                .is_some()
            {
                error!(session = id, "Session id was already registered; replacing entry");
            }
        }
        self.announce(&session);
        Ok(session)
    }

    /// The live session under `id`
    pub fn session(&self, id: &str) -> Result<Option<Arc<SessionScope>>> {
        Ok(self.read_table()?.sessions.get(id).cloned())
    }

    /// The live session under `id`, begun if absent
    pub fn get_or_begin(&self, id: &str) -> Result<Arc<SessionScope>> {
        if let Some(session) = self.session(id)? {
            return Ok(session);
        }

        let session = {
            let mut table = self.write_table()?;
            if let Some(session) = table.sessions.get(id) {
                return Ok(session.clone());
            }
            if let Some(refusal) = table.refusal(id) {
                return Err(refusal);
            }
            let session = Arc::new(SessionScope::new(ScopeId::new(id), self.env.clone()));
            session.init_scope()?;
            table.sessions.insert(id.to_string(), session.clone());
            session
        };
        self.announce(&session);
        Ok(session)
    }

    /// Run the end-of-session sequence
    ///
    /// Returns `false` without doing anything when the session is already
    /// being ended by another caller or was already destroyed.
    pub fn end(&self, session: &Arc<SessionScope>) -> Result<bool> {
        let id = session.id().as_str();
        {
            let mut table = self.write_table()?;
            if !table.in_destruction.insert(id.to_string()) {
                debug!(session = id, "Session is already ending");
                return Ok(false);
            }
            if table
                .sessions
                .get(id)
                .is_some_and(|live| Arc::ptr_eq(live, session))
            {
                table.sessions.remove(id);
            }
        }
        let _guard = EndingGuard { registry: self, id };

        if !session.is_valid() {
            debug!(session = id, state = %session.state(), "Session already torn down");
            return Ok(false);
        }
        session
            .core()
            .announce_ending(|listener| listener.session_ending(session));
        session.destroy_scope()?;
        Ok(true)
    }

    /// End the session registered under `id`
    pub fn end_by_id(&self, id: &str) -> Result<bool> {
        match self.session(id)? {
            Some(session) => self.end(&session),
            None => {
                warn!(session = id, "Attempted to end an unknown session");
                Ok(false)
            }
        }
    }

    /// Refuse every later `begin` or `get_or_begin` under `id`
    ///
    /// A live session under `id` is left alone; end it separately.
    pub fn invalidate(&self, id: &str) -> Result<()> {
        self.write_table()?.invalidated.insert(id.to_string());
        Ok(())
    }

    pub fn is_invalidated(&self, id: &str) -> bool {
        self.table.read().invalidated.contains(id)
    }

    /// Drop the session from the registry without destroying it
    pub fn deregister(&self, id: &str) -> Result<Option<Arc<SessionScope>>> {
        Ok(self.write_table()?.sessions.remove(id))
    }

    fn snapshot(&self) -> Result<Vec<Arc<SessionScope>>> {
        let mut sessions: Vec<_> = self.read_table()?.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| a.id().cmp(b.id()));
        Ok(sessions)
    }

    /// End every live session; returns how many were destroyed
    pub fn destroy_all(&self) -> Result<usize> {
        let mut destroyed = 0;
        for session in self.snapshot()? {
            match self.end(&session) {
                Ok(true) => destroyed += 1,
                Ok(false) => {}
                Err(err) => {
                    error!(session = %session.id(), error = %err, "Failed to end session");
                }
            }
        }
        Ok(destroyed)
    }

    /// Deregister every live session without destroying any
    pub fn deregister_all(&self) -> Result<usize> {
        let mut table = self.write_table()?;
        let count = table.sessions.len();
        table.sessions.clear();
        Ok(count)
    }

    /// Apply the configured teardown policy to every live session
    pub fn teardown(&self) -> Result<usize> {
        match self.env.config.session_teardown {
            SessionTeardown::Destroy => self.destroy_all(),
            SessionTeardown::Deregister => self.deregister_all(),
        }
    }

    pub fn len(&self) -> usize {
        self.table.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of live sessions, sorted
    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.table.read().sessions.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Sessions ever begun through this registry
    pub fn unique_sessions(&self) -> u64 {
        self.unique_sessions.load(Ordering::Relaxed)
    }
}

impl Singleton for SessionRegistry {
    fn pre_destroy(&self) -> std::result::Result<(), CallbackError> {
        let count = self.teardown()?;
        debug!(
            sessions = count,
            policy = ?self.env.config.session_teardown,
            "Session registry torn down"
        );
        Ok(())
    }
}
