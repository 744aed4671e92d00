use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{RunStatus, Session, SessionStore};
use crate::error::{MasterpieceError, Result};
use crate::events::{Event, EventKind};

/// Process-local session store
///
/// Sessions live until the process exits; there is no eviction.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

fn not_found(session_id: &str) -> MasterpieceError {
    MasterpieceError::SessionNotFound(session_id.to_string())
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(&self, user_id: &str, root: &str) -> Result<String> {
        let session = Session::new(user_id, root);
        let id = session.id.clone();
        self.sessions.write().await.insert(id.clone(), session);
        tracing::debug!(session_id = %id, user_id, "Session created");
        Ok(id)
    }

    async fn get(&self, session_id: &str) -> Result<Session> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| not_found(session_id))
    }

    async fn append(&self, session_id: &str, kind: EventKind) -> Result<Event> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(session_id).ok_or_else(|| not_found(session_id))?;
        Ok(session.push(kind))
    }

    async fn history(&self, session_id: &str) -> Result<Vec<Event>> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|s| s.events.clone())
            .ok_or_else(|| not_found(session_id))
    }

    async fn begin_run(&self, session_id: &str, root: &str) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(session_id).ok_or_else(|| not_found(session_id))?;
        match session.status {
            RunStatus::Running => Err(MasterpieceError::SessionBusy(session_id.to_string())),
            RunStatus::Failed => Err(MasterpieceError::SessionTerminated(session_id.to_string())),
            RunStatus::AwaitingInput | RunStatus::Completed => {
                session.status = RunStatus::Running;
                session.active_delegate = root.to_string();
                Ok(())
            }
        }
    }

    async fn set_active(&self, session_id: &str, delegate: &str) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(session_id).ok_or_else(|| not_found(session_id))?;
        session.active_delegate = delegate.to_string();
        Ok(())
    }

    async fn finish(&self, session_id: &str, status: RunStatus) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(session_id).ok_or_else(|| not_found(session_id))?;
        session.status = status;
        Ok(())
    }
}
