use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;
use schema::{AuthState, Principal, Session, SessionStore};

/// In-memory session table the HTTP transport resolves session ids against.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Session) -> Arc<Session> {
        let session = Arc::new(session);
        self.sessions
            .write()
            .insert(session.session_id().to_string(), Arc::clone(&session));
        session
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(session_id).cloned()
    }

    /// Looks the session up, creating an anonymous one on first sight.
    pub fn get_or_create(&self, session_id: &str) -> Arc<Session> {
        if let Some(session) = self.get(session_id) {
            return session;
        }
        let mut sessions = self.sessions.write();
        Arc::clone(
            sessions
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(Session::anonymous(session_id))),
        )
    }

    pub fn remove(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.write().remove(session_id)
    }

    pub fn authenticate(&self, session_id: &str, principal: Principal) -> Arc<Session> {
        let session = self.get_or_create(session_id);
        session.set_auth_state(AuthState::Authenticated(principal));
        session
    }

    pub fn fail_authentication(&self, session_id: &str, reason: &str) -> Arc<Session> {
        let session = self.get_or_create(session_id);
        session.set_auth_state(AuthState::Failed {
            reason: reason.to_string(),
        });
        session
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}
