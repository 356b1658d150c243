//! Session persistence: one JSON document per session under a root
//! directory.
//!
//! Every mutation rewrites the session's file wholesale while holding that
//! session's mutex, so concurrent appends to one session serialize instead
//! of losing updates. Write failures are logged and swallowed; the in-memory
//! log stays authoritative for the life of the process.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::session::context::select_context;
use crate::session::message::{Message, MessageContent, MessageInput, Role};
use crate::session::{Session, SessionSummary};

const TITLE_LIMIT: usize = 50;
const DEFAULT_TITLE: &str = "New session";

#[derive(Debug, Error)]
pub enum SessionStoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Invalid session data: {0}")]
    InvalidData(String),

    #[error("tool message requires a tool_call_id")]
    MissingToolCallId,
}

pub struct SessionStore {
    dir: PathBuf,
    sessions: RwLock<HashMap<String, Arc<Mutex<Session>>>>,
}

impl SessionStore {
    /// Open a store rooted at `dir`, loading every session file found there.
    ///
    /// A file that fails to parse or carries no id is deleted rather than
    /// surfaced as an error.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, SessionStoreError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let mut sessions = HashMap::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            match read_session_file(&path).await {
                Ok(session) => {
                    sessions.insert(session.id.clone(), Arc::new(Mutex::new(session)));
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "quarantining unreadable session file");
                    let _ = tokio::fs::remove_file(&path).await;
                }
            }
        }
        debug!(dir = %dir.display(), count = sessions.len(), "session store opened");

        Ok(Self {
            dir,
            sessions: RwLock::new(sessions),
        })
    }

    /// Create a fresh session with a generated id.
    pub async fn create_session(&self, title: Option<String>) -> Session {
        let session = Session::new(
            Uuid::new_v4().to_string(),
            title.unwrap_or_else(|| DEFAULT_TITLE.to_string()),
        );
        let handle = Arc::new(Mutex::new(session.clone()));
        // lock before publishing so the initial write serializes ahead of
        // any append through the shared handle
        let guard = handle.lock().await;
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), Arc::clone(&handle));
        self.persist(&guard).await;
        session
    }

    /// Return the session with `id`, creating it if absent.
    ///
    /// Creation is atomic: racing callers resolve to one shared handle, and
    /// the initial write happens under that session's mutex.
    pub async fn get_or_create(&self, id: &str) -> Session {
        if let Some(handle) = self.handle(id).await {
            return handle.lock().await.clone();
        }

        // re-check under the write lock; the read-lock miss above may be stale
        let (handle, created) = {
            let mut sessions = self.sessions.write().await;
            match sessions.entry(id.to_string()) {
                Entry::Occupied(entry) => (Arc::clone(entry.get()), false),
                Entry::Vacant(entry) => {
                    let handle = Arc::new(Mutex::new(Session::new(
                        id.to_string(),
                        DEFAULT_TITLE.to_string(),
                    )));
                    entry.insert(Arc::clone(&handle));
                    (handle, true)
                }
            }
        };

        let session = handle.lock().await;
        if created {
            self.persist(&session).await;
        }
        session.clone()
    }

    /// Snapshot of the session with `id`, if it exists.
    pub async fn get(&self, id: &str) -> Option<Session> {
        let handle = self.handle(id).await?;
        let session = handle.lock().await;
        Some(session.clone())
    }

    /// Append a message, assigning its id and timestamp.
    ///
    /// The first user message becomes the session title. A tool message
    /// without a `tool_call_id` is refused outright; synthesizing ids here
    /// would mask upstream bugs and break pairing on reload.
    pub async fn append(
        &self,
        session_id: &str,
        input: MessageInput,
    ) -> Result<Message, SessionStoreError> {
        if input.role == Role::Tool && input.tool_call_id.is_none() {
            return Err(SessionStoreError::MissingToolCallId);
        }
        let handle = self
            .handle(session_id)
            .await
            .ok_or_else(|| SessionStoreError::NotFound(session_id.to_string()))?;

        let mut session = handle.lock().await;
        let now = Utc::now();
        let message = Message {
            id: Uuid::new_v4().to_string(),
            role: input.role,
            content: input.content,
            timestamp: now,
            tool_calls: input.tool_calls,
            tool_call_id: input.tool_call_id,
            metadata: input.metadata,
        };

        if message.role == Role::User
            && !session.messages.iter().any(|m| m.role == Role::User)
            && let Some(title) = derive_title(&message.content)
        {
            session.title = title;
        }

        session.messages.push(message.clone());
        session.updated_at = now;
        self.persist(&session).await;
        Ok(message)
    }

    /// The bounded context slice for one turn, prefixed by a transient
    /// system message when a prompt is given. The prefix is never persisted.
    pub async fn read_context(
        &self,
        session_id: &str,
        max_messages: usize,
        system_prompt: Option<&str>,
    ) -> Result<Vec<Message>, SessionStoreError> {
        let handle = self
            .handle(session_id)
            .await
            .ok_or_else(|| SessionStoreError::NotFound(session_id.to_string()))?;
        let session = handle.lock().await;
        let slice = select_context(&session.messages, max_messages);

        let mut out = Vec::with_capacity(slice.len() + 1);
        if let Some(prompt) = system_prompt {
            out.push(Message {
                id: Uuid::new_v4().to_string(),
                role: Role::System,
                content: MessageContent::Text(prompt.to_string()),
                timestamp: Utc::now(),
                tool_calls: Vec::new(),
                tool_call_id: None,
                metadata: None,
            });
        }
        out.extend_from_slice(slice);
        Ok(out)
    }

    /// All sessions, most recently updated first.
    pub async fn list(&self) -> Vec<SessionSummary> {
        let sessions = self.sessions.read().await;
        let mut summaries = Vec::with_capacity(sessions.len());
        for handle in sessions.values() {
            summaries.push(handle.lock().await.summary());
        }
        drop(sessions);
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        summaries
    }

    /// Remove a session and its file. Returns whether it existed.
    pub async fn delete(&self, id: &str) -> bool {
        let removed = self.sessions.write().await.remove(id).is_some();
        if removed {
            let path = self.session_path(id);
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %e, "failed to remove session file");
            }
        }
        removed
    }

    /// Delete sessions whose last update is older than `max_age`.
    /// Returns the number removed.
    pub async fn evict_older_than(&self, max_age: Duration) -> usize {
        let age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let Some(cutoff) = Utc::now().checked_sub_signed(age) else {
            return 0;
        };

        let mut stale = Vec::new();
        {
            let sessions = self.sessions.read().await;
            for (id, handle) in sessions.iter() {
                if handle.lock().await.updated_at < cutoff {
                    stale.push(id.clone());
                }
            }
        }
        let mut count = 0;
        for id in stale {
            if self.delete(&id).await {
                count += 1;
            }
        }
        count
    }

    /// Set one key in the session's context bag and persist.
    pub async fn set_context(
        &self,
        session_id: &str,
        key: &str,
        value: Value,
    ) -> Result<(), SessionStoreError> {
        let handle = self
            .handle(session_id)
            .await
            .ok_or_else(|| SessionStoreError::NotFound(session_id.to_string()))?;
        let mut session = handle.lock().await;
        session.context.insert(key.to_string(), value);
        session.updated_at = Utc::now();
        self.persist(&session).await;
        Ok(())
    }

    /// Read one key from the session's context bag.
    pub async fn context_value(
        &self,
        session_id: &str,
        key: &str,
    ) -> Result<Option<Value>, SessionStoreError> {
        let handle = self
            .handle(session_id)
            .await
            .ok_or_else(|| SessionStoreError::NotFound(session_id.to_string()))?;
        let session = handle.lock().await;
        Ok(session.context.get(key).cloned())
    }

    async fn handle(&self, id: &str) -> Option<Arc<Mutex<Session>>> {
        self.sessions.read().await.get(id).cloned()
    }

    fn session_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Whole-file rewrite. Failures are logged, not propagated; the
    /// in-memory session remains the source of truth.
    async fn persist(&self, session: &Session) {
        let path = self.session_path(&session.id);
        match serde_json::to_string_pretty(session) {
            Ok(json) => {
                if let Err(e) = tokio::fs::write(&path, json).await {
                    warn!(session = %session.id, error = %e, "failed to persist session");
                }
            }
            Err(e) => {
                warn!(session = %session.id, error = %e, "failed to serialize session");
            }
        }
    }
}

async fn read_session_file(path: &Path) -> Result<Session, SessionStoreError> {
    let raw = tokio::fs::read_to_string(path).await?;
    let session: Session = serde_json::from_str(&raw)?;
    if session.id.is_empty() {
        return Err(SessionStoreError::InvalidData(
            "session file has an empty id".to_string(),
        ));
    }
    Ok(session)
}

fn derive_title(content: &MessageContent) -> Option<String> {
    let text = content.text();
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if text.chars().count() > TITLE_LIMIT {
        Some(format!(
            "{}...",
            text.chars().take(TITLE_LIMIT).collect::<String>()
        ))
    } else {
        Some(text.to_string())
    }
}
