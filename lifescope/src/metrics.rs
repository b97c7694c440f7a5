//! Runtime metrics
//!
//! Lock-free counters shared by every scope of a runtime. Counters only
//! grow; take a [`MetricsSnapshot`] to read them consistently enough for
//! reporting.

use lifescope_types::ScopeKind;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for one runtime
#[derive(Debug, Default)]
pub struct ScopeMetrics {
    /// Scopes that completed `init_scope`, indexed by [`ScopeKind::index`]
    began: [AtomicU64; 5],

    /// Scopes that reached `Destroyed`, indexed by [`ScopeKind::index`]
    destroyed: [AtomicU64; 5],

    /// Sessions ever begun through the session registry
    unique_sessions: AtomicU64,

    singletons_instantiated: AtomicU64,

    /// Destruction hooks and singleton hooks that failed or panicked
    hook_failures: AtomicU64,

    listener_failures: AtomicU64,

    /// Stale request scopes force-ended by `begin_request`
    stale_requests: AtomicU64,

    session_renewals: AtomicU64,
}

impl ScopeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_began(&self, kind: ScopeKind) {
        self.began[kind.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_destroyed(&self, kind: ScopeKind) {
        self.destroyed[kind.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unique_session(&self) {
        self.unique_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_singleton_instantiated(&self) {
        self.singletons_instantiated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_hook_failure(&self) {
        self.hook_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_listener_failure(&self) {
        self.listener_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_request(&self) {
        self.stale_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_renewal(&self) {
        self.session_renewals.fetch_add(1, Ordering::Relaxed);
    }

    /// Scopes of `kind` that have begun but not yet been destroyed
    pub fn live(&self, kind: ScopeKind) -> u64 {
        let began = self.began[kind.index()].load(Ordering::Relaxed);
        let destroyed = self.destroyed[kind.index()].load(Ordering::Relaxed);
        began.saturating_sub(destroyed)
    }

    /// Get a snapshot of current metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            scopes_begun: KindCounts::load(&self.began),
            scopes_destroyed: KindCounts::load(&self.destroyed),
            unique_sessions: self.unique_sessions.load(Ordering::Relaxed),
            singletons_instantiated: self.singletons_instantiated.load(Ordering::Relaxed),
            hook_failures: self.hook_failures.load(Ordering::Relaxed),
            listener_failures: self.listener_failures.load(Ordering::Relaxed),
            stale_requests: self.stale_requests.load(Ordering::Relaxed),
            session_renewals: self.session_renewals.load(Ordering::Relaxed),
        }
    }
}

/// One counter per scope kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindCounts {
    pub global: u64,
    pub application: u64,
    pub session: u64,
    pub session_application: u64,
    pub request: u64,
}

impl KindCounts {
    fn load(counters: &[AtomicU64; 5]) -> Self {
        let at = |kind: ScopeKind| counters[kind.index()].load(Ordering::Relaxed);
        KindCounts {
            global: at(ScopeKind::Global),
            application: at(ScopeKind::Application),
            session: at(ScopeKind::Session),
            session_application: at(ScopeKind::SessionApplication),
            request: at(ScopeKind::Request),
        }
    }

    pub fn get(&self, kind: ScopeKind) -> u64 {
        match kind {
            ScopeKind::Global => self.global,
            ScopeKind::Application => self.application,
            ScopeKind::Session => self.session,
            ScopeKind::SessionApplication => self.session_application,
            ScopeKind::Request => self.request,
        }
    }

    pub fn total(&self) -> u64 {
        ScopeKind::ALL.iter().map(|kind| self.get(*kind)).sum()
    }
}

/// Snapshot of runtime metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub scopes_begun: KindCounts,
    pub scopes_destroyed: KindCounts,
    pub unique_sessions: u64,
    pub singletons_instantiated: u64,
    pub hook_failures: u64,
    pub listener_failures: u64,
    pub stale_requests: u64,
    pub session_renewals: u64,
}

impl MetricsSnapshot {
    /// Format as a human-readable report
    pub fn format_report(&self) -> String {
        let mut report = String::new();
        report.push_str(&format!(
            "{:<22} {:>10} {:>10}\n",
            "Scope kind", "Begun", "Destroyed"
        ));
        report.push_str(&format!("{}\n", "-".repeat(44)));
        for kind in ScopeKind::ALL {
            report.push_str(&format!(
                "{:<22} {:>10} {:>10}\n",
                kind.as_str(),
                self.scopes_begun.get(kind),
                self.scopes_destroyed.get(kind)
            ));
        }
        report.push('\n');
        report.push_str(&format!("Unique sessions:         {}\n", self.unique_sessions));
        report.push_str(&format!(
            "Singletons instantiated: {}\n",
            self.singletons_instantiated
        ));
        report.push_str(&format!("Session renewals:        {}\n", self.session_renewals));
        report.push_str(&format!("Stale requests:          {}\n", self.stale_requests));
        report.push_str(&format!("Hook failures:           {}\n", self.hook_failures));
        report.push_str(&format!("Listener failures:       {}\n", self.listener_failures));
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_kind_counters() {
        let metrics = ScopeMetrics::new();
        metrics.record_began(ScopeKind::Session);
        metrics.record_began(ScopeKind::Session);
        metrics.record_destroyed(ScopeKind::Session);
        metrics.record_began(ScopeKind::Request);

        assert_eq!(metrics.live(ScopeKind::Session), 1);
        assert_eq!(metrics.live(ScopeKind::Global), 0);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.scopes_begun.session, 2);
        assert_eq!(snapshot.scopes_destroyed.session, 1);
        assert_eq!(snapshot.scopes_begun.total(), 3);
    }

    #[test]
    fn test_report_lists_every_kind() {
        let metrics = ScopeMetrics::new();
        metrics.record_session_renewal();
        let report = metrics.snapshot().format_report();

        for kind in ScopeKind::ALL {
            assert!(report.contains(kind.as_str()));
        }
        assert!(report.contains("Session renewals:        1"));
    }
}
