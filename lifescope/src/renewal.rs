//! Session renewal
//!
//! Renewing a session moves its renewal-safe attributes to a session with a
//! fresh id. Only values built with
//! [`AttributeValue::surviving_renewal`] are carried; they are copied by
//! handle, never mutated.

use crate::attributes::AttributeValue;
use crate::error::Result;
use crate::scope::{Scope, SessionScope};
use lifescope_types::ScopeId;

type Entries = Vec<(String, AttributeValue)>;

fn surviving(scope: &dyn Scope) -> Result<Entries> {
    Ok(scope
        .attributes()?
        .into_iter()
        .filter(|(_, value)| value.survives_renewal())
        .collect())
}

/// Renewal-safe attributes of a session and its session-application scopes
#[derive(Debug, Clone, Default)]
pub struct RenewalSnapshot {
    session: Entries,
    applications: Vec<(ScopeId, Entries)>,
}

impl RenewalSnapshot {
    /// Copy every renewal-safe attribute out of `session`
    ///
    /// Session-application scopes without any such attribute are left out.
    pub fn capture(session: &SessionScope) -> Result<Self> {
        let mut applications = Vec::new();
        for scope in session.session_application_scopes() {
            let entries = surviving(&*scope)?;
            if !entries.is_empty() {
                applications.push((scope.application_id().clone(), entries));
            }
        }
        Ok(RenewalSnapshot {
            session: surviving(session)?,
            applications,
        })
    }

    /// Write the snapshot into `target`, re-creating each session-application
    /// scope before its attributes
    pub fn replay(&self, target: &SessionScope) -> Result<()> {
        for (name, value) in &self.session {
            target.set(name, value.clone())?;
        }
        for (application_id, entries) in &self.applications {
            let scope = target.get_or_create_application(application_id)?;
            for (name, value) in entries {
                scope.set(name, value.clone())?;
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.session.is_empty() && self.applications.is_empty()
    }

    /// Names of the captured session attributes
    pub fn session_attribute_names(&self) -> Vec<&str> {
        self.session.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Application ids with captured attributes
    pub fn application_ids(&self) -> Vec<&ScopeId> {
        self.applications.iter().map(|(id, _)| id).collect()
    }
}
