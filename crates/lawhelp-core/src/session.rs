use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use tokio::sync::Mutex;

use crate::completion::ChatMessage;

/// Jurisdiction assumed until a turn resolves a more specific one.
pub const DEFAULT_JURISDICTION: &str = "General";

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque per-connection identifier, unique for the life of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chat-{}", self.0)
    }
}

/// Conversation state for one open connection.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    /// Entry 0 is always the system prompt.
    history: Vec<ChatMessage>,
    pub last_jurisdiction: String,
}

impl Session {
    pub fn new(id: SessionId, system_prompt: impl Into<String>) -> Self {
        Self {
            id,
            history: vec![ChatMessage::system(system_prompt)],
            last_jurisdiction: DEFAULT_JURISDICTION.to_string(),
        }
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    /// Append a user or assistant turn. System entries past index 0 are
    /// rejected so the seeded prompt stays first and unique.
    fn push(&mut self, message: ChatMessage) -> bool {
        if message.role == crate::completion::Role::System {
            return false;
        }
        self.history.push(message);
        true
    }
}

/// Process-wide map of live sessions.
///
/// Each entry is only ever touched by the loop that owns its connection; the
/// single table lock makes insert and remove atomic across connections.
#[derive(Clone, Default)]
pub struct SessionTable {
    inner: Arc<Mutex<HashMap<SessionId, Session>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fresh session, replacing any stale entry under the same id.
    pub async fn insert(&self, session: Session) {
        let mut table = self.inner.lock().await;
        table.insert(session.id, session);
    }

    /// Remove a session. Returns false when it was already gone.
    pub async fn remove(&self, id: SessionId) -> bool {
        self.inner.lock().await.remove(&id).is_some()
    }

    pub async fn get(&self, id: SessionId) -> Option<Session> {
        self.inner.lock().await.get(&id).cloned()
    }

    pub async fn contains(&self, id: SessionId) -> bool {
        self.inner.lock().await.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }

    pub async fn last_jurisdiction(&self, id: SessionId) -> Option<String> {
        self.inner
            .lock()
            .await
            .get(&id)
            .map(|s| s.last_jurisdiction.clone())
    }

    /// Record the turn's jurisdiction and user entry, returning the history
    /// to send to the backend.
    pub async fn begin_turn(
        &self,
        id: SessionId,
        jurisdiction: &str,
        user_entry: ChatMessage,
    ) -> Option<Vec<ChatMessage>> {
        let mut table = self.inner.lock().await;
        let session = table.get_mut(&id)?;
        session.last_jurisdiction = jurisdiction.to_string();
        session.push(user_entry);
        Some(session.history.clone())
    }

    pub async fn finish_turn(&self, id: SessionId, assistant_text: &str) -> bool {
        let mut table = self.inner.lock().await;
        match table.get_mut(&id) {
            Some(session) => session.push(ChatMessage::assistant(assistant_text)),
            None => false,
        }
    }
}
