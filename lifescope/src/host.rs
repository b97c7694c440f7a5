//! Boundary to whatever owns sessions outside the runtime

use uuid::Uuid;

/// The host's view of sessions
///
/// The runtime asks the host for fresh session ids and tells it when a
/// session id must no longer be honoured.
pub trait SessionHost: Send + Sync {
    /// Mint a new, unguessable session id
    fn create_session_id(&self) -> String;

    /// Stop honouring `session_id`
    fn invalidate(&self, session_id: &str);
}

/// Host with no external session store: ids are random UUIDs and
/// invalidation is a no-op
#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedSessionHost;

impl SessionHost for DetachedSessionHost {
    fn create_session_id(&self) -> String {
        Uuid::new_v4().to_string()
    }

    fn invalidate(&self, _session_id: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detached_ids_are_unique() {
        let host = DetachedSessionHost;
        let a = host.create_session_id();
        let b = host.create_session_id();
        assert_ne!(a, b);
        assert!(Uuid::parse_str(&a).is_ok());
    }
}
