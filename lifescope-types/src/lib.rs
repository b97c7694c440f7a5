//! Shared types for lifescope
//!
//! This crate provides the vocabulary used across the lifescope workspace:
//! scope identifiers, the five scope kinds, the destruction state machine and
//! the changed/unchanged outcome reported by attribute mutations.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Scope identifier, unique within its kind
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScopeId(pub String);

impl ScopeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ScopeId {
    fn from(id: &str) -> Self {
        ScopeId(id.to_string())
    }
}

impl From<String> for ScopeId {
    fn from(id: String) -> Self {
        ScopeId(id)
    }
}

/// The lifetime boundary a scope is tied to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeKind {
    /// Process-wide, owns the application scopes
    Global,
    /// One per application, owned by the global scope
    Application,
    /// One per user session, tracked by the session registry
    Session,
    /// One per (session, application) pair, owned by the session
    SessionApplication,
    /// One per in-flight request, bound to a thread of control
    Request,
}

impl ScopeKind {
    /// Every kind, outermost first
    pub const ALL: [ScopeKind; 5] = [
        ScopeKind::Global,
        ScopeKind::Application,
        ScopeKind::Session,
        ScopeKind::SessionApplication,
        ScopeKind::Request,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ScopeKind::Global => "global",
            ScopeKind::Application => "application",
            ScopeKind::Session => "session",
            ScopeKind::SessionApplication => "session_application",
            ScopeKind::Request => "request",
        }
    }

    /// Position in [`ScopeKind::ALL`], handy for per-kind counters
    pub fn index(&self) -> usize {
        match self {
            ScopeKind::Global => 0,
            ScopeKind::Application => 1,
            ScopeKind::Session => 2,
            ScopeKind::SessionApplication => 3,
            ScopeKind::Request => 4,
        }
    }
}

impl fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Destruction state of a scope
///
/// States only move forward: `Valid -> InDestruction -> Destroyed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeState {
    /// The scope is live and accepts mutations
    Valid,
    /// Teardown has started; readers still see the attributes
    InDestruction,
    /// Terminal state
    Destroyed,
}

impl ScopeState {
    pub fn is_valid(&self) -> bool {
        *self == ScopeState::Valid
    }

    pub fn is_destroyed(&self) -> bool {
        *self == ScopeState::Destroyed
    }

    /// Whether `self -> next` is one of the two legal transitions
    pub fn can_transition_to(&self, next: ScopeState) -> bool {
        matches!(
            (self, next),
            (ScopeState::Valid, ScopeState::InDestruction)
                | (ScopeState::InDestruction, ScopeState::Destroyed)
        )
    }
}

impl fmt::Display for ScopeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ScopeState::Valid => "valid",
            ScopeState::InDestruction => "in-destruction",
            ScopeState::Destroyed => "destroyed",
        };
        f.write_str(label)
    }
}

/// Outcome of an attribute mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Change {
    Changed,
    Unchanged,
}

impl Change {
    pub fn is_changed(&self) -> bool {
        *self == Change::Changed
    }
}

impl From<bool> for Change {
    fn from(changed: bool) -> Self {
        if changed {
            Change::Changed
        } else {
            Change::Unchanged
        }
    }
}
