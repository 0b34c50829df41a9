//! Best-effort mirror of the in-memory transcript into the datastore.
//!
//! The engine's transcript stays authoritative for display; this layer only
//! records what happened and may lag behind or fail independently.

use crate::models::{ChatMode, ChatSession, ConversationTurn};
use crate::storage::ChatStore;
use anyhow::{Context, Result};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

const TITLE_MAX_CHARS: usize = 50;
const TITLE_KEEP_CHARS: usize = 47;

/// Title shown in the session list, derived from the first user message.
pub fn infer_title(content: &str) -> String {
    let first_line = content.trim().lines().next().unwrap_or_default().trim();
    if first_line.chars().count() > TITLE_MAX_CHARS {
        let kept: String = first_line.chars().take(TITLE_KEEP_CHARS).collect();
        format!("{}...", kept.trim_end())
    } else {
        first_line.to_string()
    }
}

#[derive(Debug, Default)]
struct PersistenceState {
    session_id: Option<Uuid>,
    title_derived: bool,
    // Bumped by reset() so in-flight creations don't resurrect a cleared session
    epoch: u64,
}

pub struct SessionPersistence {
    store: Arc<dyn ChatStore>,
    user_id: Uuid,
    state: Mutex<PersistenceState>,
}

impl SessionPersistence {
    pub fn new(store: Arc<dyn ChatStore>, user_id: Uuid) -> Self {
        Self {
            store,
            user_id,
            state: Mutex::new(PersistenceState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PersistenceState> {
        // State is plain data; a poisoned lock still holds a usable value
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.lock().session_id
    }

    /// Forgets the current session so the next message starts a new one.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.session_id = None;
        state.title_derived = false;
        state.epoch += 1;
    }

    /// Creates the session row on first use and reuses it afterwards.
    pub async fn ensure_session(&self, mode: ChatMode, subject: Option<&str>) -> Result<Uuid> {
        let epoch = {
            let state = self.lock();
            if let Some(id) = state.session_id {
                return Ok(id);
            }
            state.epoch
        };

        let session = self
            .store
            .create_session(self.user_id, mode, subject)
            .await
            .context("Failed to create chat session")?;

        let mut state = self.lock();
        if state.epoch == epoch {
            state.session_id = Some(session.id);
            state.title_derived = false;
        } else {
            log::warn!("Chat was cleared while session {} was being created", session.id);
        }
        Ok(session.id)
    }

    /// Appends a message row; the store bumps the session's `updated_at`.
    pub async fn record_turn(&self, session_id: Uuid, turn: &ConversationTurn) -> Result<()> {
        self.store
            .save_message(session_id, turn)
            .await
            .with_context(|| format!("Failed to save {} message", turn.role.as_str()))
    }

    /// Sets the session title from the first user message, exactly once.
    pub async fn derive_title(&self, session_id: Uuid, first_user_content: &str) -> Result<Option<String>> {
        {
            let mut state = self.lock();
            if state.session_id == Some(session_id) {
                if state.title_derived {
                    return Ok(None);
                }
                state.title_derived = true;
            }
        }

        let title = infer_title(first_user_content);
        if title.is_empty() {
            return Ok(None);
        }
        let updated = self
            .store
            .set_title_if_unset(session_id, &title)
            .await
            .context("Failed to set chat session title")?;

        if updated {
            log::info!("Titled session {}: {}", session_id, title);
            Ok(Some(title))
        } else {
            Ok(None)
        }
    }

    pub async fn load_session(&self, session_id: Uuid) -> Result<Vec<ConversationTurn>> {
        self.store.get_session_messages(session_id).await
    }

    /// Loads a listed session and makes it the target of new turns.
    pub async fn resume(&self, session_id: Uuid) -> Result<(ChatSession, Vec<ConversationTurn>)> {
        let session = self
            .store
            .get_session(session_id)
            .await?
            .with_context(|| format!("Chat session {} not found", session_id))?;
        let turns = self.load_session(session_id).await?;

        let mut state = self.lock();
        state.epoch += 1;
        state.session_id = Some(session.id);
        // Resumed sessions already had their first user turn recorded
        state.title_derived = session.title.is_some() || !turns.is_empty();
        Ok((session, turns))
    }

    pub async fn list_recent(&self, limit: i64) -> Result<Vec<ChatSession>> {
        self.store.list_sessions(self.user_id, limit).await
    }

    /// Removes every message of the session, then the session itself.
    pub async fn delete_session(&self, session_id: Uuid) -> Result<()> {
        if self.session_id() == Some(session_id) {
            self.reset();
        }
        self.store.delete_session(session_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use crate::storage::StorageManager;

    async fn adapter() -> (SessionPersistence, Arc<StorageManager>) {
        let db = Arc::new(StorageManager::in_memory().await.unwrap());
        (SessionPersistence::new(db.clone(), Uuid::new_v4()), db)
    }

    #[test]
    fn short_titles_are_kept() {
        assert_eq!(infer_title("  What is osmosis?  "), "What is osmosis?");
    }

    #[test]
    fn long_titles_are_truncated_with_ellipsis() {
        let long = "Explain the difference between mitosis and meiosis in simple words";
        let title = infer_title(long);
        assert!(title.ends_with("..."));
        assert!(title.chars().count() <= TITLE_MAX_CHARS);
        assert!(long.starts_with(title.trim_end_matches("...")));
    }

    #[test]
    fn exactly_fifty_chars_is_not_truncated() {
        let fifty = "x".repeat(50);
        assert_eq!(infer_title(&fifty), fifty);
    }

    #[tokio::test]
    async fn ensure_session_is_idempotent() {
        let (persistence, db) = adapter().await;
        let first = persistence.ensure_session(ChatMode::Mentor, Some("math")).await.unwrap();
        let second = persistence.ensure_session(ChatMode::Mentor, Some("math")).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(persistence.list_recent(10).await.unwrap().len(), 1);

        let stored = db.get_session(first).await.unwrap().unwrap();
        assert_eq!(stored.subject.as_deref(), Some("math"));
    }

    #[tokio::test]
    async fn title_is_derived_once() {
        let (persistence, db) = adapter().await;
        let id = persistence.ensure_session(ChatMode::Teacher, None).await.unwrap();

        let first = persistence.derive_title(id, "How do vaccines work?").await.unwrap();
        assert_eq!(first.as_deref(), Some("How do vaccines work?"));

        let second = persistence.derive_title(id, "Something else entirely").await.unwrap();
        assert!(second.is_none());

        let stored = db.get_session(id).await.unwrap().unwrap();
        assert_eq!(stored.title.as_deref(), Some("How do vaccines work?"));
    }

    #[tokio::test]
    async fn title_survives_a_fresh_adapter() {
        let (persistence, db) = adapter().await;
        let id = persistence.ensure_session(ChatMode::Teacher, None).await.unwrap();
        persistence.derive_title(id, "Original").await.unwrap();

        let other = SessionPersistence::new(db.clone(), Uuid::new_v4());
        assert!(other.derive_title(id, "Replacement").await.unwrap().is_none());
        let stored = db.get_session(id).await.unwrap().unwrap();
        assert_eq!(stored.title.as_deref(), Some("Original"));
    }

    #[tokio::test]
    async fn delete_leaves_no_orphaned_messages() {
        let (persistence, db) = adapter().await;
        let id = persistence.ensure_session(ChatMode::Mentor, None).await.unwrap();
        for (role, content) in [(Role::User, "q1"), (Role::Assistant, "a1"), (Role::User, "q2")] {
            persistence
                .record_turn(id, &ConversationTurn::new(role, content))
                .await
                .unwrap();
        }
        assert_eq!(persistence.load_session(id).await.unwrap().len(), 3);

        persistence.delete_session(id).await.unwrap();

        assert_eq!(db.count_messages(id).await.unwrap(), 0);
        assert!(db.get_session(id).await.unwrap().is_none());
        assert!(persistence.session_id().is_none());
    }

    #[tokio::test]
    async fn reset_starts_a_new_session() {
        let (persistence, _db) = adapter().await;
        let first = persistence.ensure_session(ChatMode::Mentor, None).await.unwrap();
        persistence.reset();
        let second = persistence.ensure_session(ChatMode::Mentor, None).await.unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn resume_adopts_session_and_returns_turns_in_order() {
        let (persistence, _db) = adapter().await;
        let id = persistence.ensure_session(ChatMode::Mentor, None).await.unwrap();
        persistence
            .record_turn(id, &ConversationTurn::new(Role::User, "first"))
            .await
            .unwrap();
        persistence
            .record_turn(id, &ConversationTurn::new(Role::Assistant, "second"))
            .await
            .unwrap();
        persistence.reset();

        let (session, turns) = persistence.resume(id).await.unwrap();
        assert_eq!(session.id, id);
        assert_eq!(persistence.session_id(), Some(id));
        let contents: Vec<_> = turns.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, ["first", "second"]);

        // Already has a first user turn, so no late title
        assert!(persistence.derive_title(id, "late").await.unwrap().is_none());
    }
}
