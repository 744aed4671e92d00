// Session state: the append-only event log of one conversation
//
// Design Decision: Store behind a trait, one writer per session
//
// Rationale: Persistence is someone else's concern, so the orchestrator talks
// to a `SessionStore` and ships with an in-memory implementation. The store
// owns the run status and enforces single-writer-per-session itself:
// `begin_run` flips a session to `Running` atomically, so two concurrent
// submits can never both pass the check.

pub mod store;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::events::{Event, EventKind};

pub use store::InMemorySessionStore;

/// Where a session stands between and during runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Open, waiting for the next `submit`
    AwaitingInput,
    /// A run is in flight
    Running,
    /// Last run ended with a delegate response
    Completed,
    /// Last run ended with a run error; the session accepts no more input
    Failed,
}

impl RunStatus {
    /// Whether a new run may start from this status
    pub fn accepts_input(self) -> bool {
        matches!(self, RunStatus::AwaitingInput | RunStatus::Completed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunStatus::AwaitingInput => "awaiting_input",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub events: Vec<Event>,
    /// Name of the delegate that owns the turn
    pub active_delegate: String,
    pub status: RunStatus,
}

impl Session {
    pub fn new(user_id: impl Into<String>, root: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            created_at: Utc::now(),
            events: Vec::new(),
            active_delegate: root.into(),
            status: RunStatus::AwaitingInput,
        }
    }

    /// Append an event, assigning the next sequence number
    pub fn push(&mut self, kind: EventKind) -> Event {
        let event = Event::new(self.events.len() as u64, kind);
        self.events.push(event.clone());
        event
    }
}

/// Session persistence used by the orchestrator
///
/// Every operation on an unknown id fails with `SessionNotFound`.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Open a session whose active delegate is `root`, returning its id
    async fn create(&self, user_id: &str, root: &str) -> Result<String>;

    /// Snapshot of the whole session
    async fn get(&self, session_id: &str) -> Result<Session>;

    /// Append one event; the store assigns `seq`
    async fn append(&self, session_id: &str, kind: EventKind) -> Result<Event>;

    /// Ordered event log
    async fn history(&self, session_id: &str) -> Result<Vec<Event>>;

    /// Claim the session for a new run starting at `root`
    ///
    /// # Errors
    /// `SessionBusy` while another run is in flight, `SessionTerminated`
    /// after a failed run.
    async fn begin_run(&self, session_id: &str, root: &str) -> Result<()>;

    async fn set_active(&self, session_id: &str, delegate: &str) -> Result<()>;

    /// Release the session with its final status
    async fn finish(&self, session_id: &str, status: RunStatus) -> Result<()>;
}
