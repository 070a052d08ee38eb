//! Identifier → session routing for Backhaul Relay

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};

use crate::session::TunnelSession;

/// Registry of the single live session per private-server identifier
#[derive(Clone, Default)]
pub struct Registry {
    sessions: Arc<DashMap<String, Arc<TunnelSession>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `session` as the holder of its identifier.
    ///
    /// Returns the session it replaced; the caller must tear that one down.
    pub fn register(&self, session: Arc<TunnelSession>) -> Option<Arc<TunnelSession>> {
        let identifier = session.identifier().to_string();
        let session_id = session.session_id();
        let previous = self.sessions.insert(identifier.clone(), session);

        match &previous {
            Some(old) => info!(
                %identifier,
                session_id,
                replaced = old.session_id(),
                "session registered, superseding previous holder"
            ),
            None => info!(%identifier, session_id, "session registered"),
        }
        previous
    }

    pub fn lookup(&self, identifier: &str) -> Option<Arc<TunnelSession>> {
        self.sessions
            .get(identifier)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Remove the mapping only if `session` is still the current holder
    pub fn unregister_if_current(&self, identifier: &str, session: &TunnelSession) -> bool {
        let removed = self
            .sessions
            .remove_if(identifier, |_, current| {
                std::ptr::eq(Arc::as_ptr(current), session)
            })
            .is_some();

        if removed {
            info!(%identifier, session_id = session.session_id(), "session unregistered");
        } else {
            debug!(
                %identifier,
                session_id = session.session_id(),
                "stale session not unregistered, a newer holder is current"
            );
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
