// ABOUTME: Session registry mapping session ids to their live sandboxes
// The only cross-session shared state; owned by the session service, never global

use super::active::ActiveSession;
use super::SessionError;
use crate::models::SessionId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

pub type SandboxRef = Arc<ActiveSession>;

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, SandboxRef>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh random 128-bit identifier.
    pub fn create(&self) -> SessionId {
        SessionId::new()
    }

    /// Bind `session` to `id` and move it to `Running`.
    pub async fn register(&self, id: SessionId, session: SandboxRef) -> Result<(), SessionError> {
        debug_assert_eq!(id, session.id(), "session registered under a foreign id");
        {
            let mut sessions = self.sessions.write().await;
            if sessions.contains_key(&id) {
                return Err(SessionError::DuplicateSession(id));
            }
            sessions.insert(id, Arc::clone(&session));
        }
        session.activate().await;
        debug!("Registered session {}", id);
        Ok(())
    }

    pub async fn resolve(&self, id: SessionId) -> Result<SandboxRef, SessionError> {
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(SessionError::UnknownSession(id))
    }

    pub async fn remove(&self, id: SessionId) -> Option<SandboxRef> {
        let removed = self.sessions.write().await.remove(&id);
        if removed.is_some() {
            debug!("Removed session {}", id);
        }
        removed
    }

    pub async fn ids(&self) -> Vec<SessionId> {
        self.sessions.read().await.keys().copied().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Remove and return every session.
    pub async fn drain(&self) -> Vec<SandboxRef> {
        self.sessions.write().await.drain().map(|(_, session)| session).collect()
    }
}
