//! Conversation state for one open chat view.
//!
//! The engine owns the in-memory transcript (authoritative for display) and
//! drives one turn at a time: `Idle -> Sending -> Streaming -> Idle`, with a
//! detour through `Failed` when the reply cannot be produced. Every clear or
//! resume bumps a generation counter; work belonging to an older generation
//! is dropped instead of being applied to the new transcript.

use crate::access::{AccessGate, Capability};
use crate::api::{ApiMessage, ChatRequest, ModelProxy};
use crate::error::ChatError;
use crate::models::{Attachments, ChatContext, ChatSession, ConversationTurn, CurrentUser, Role, UserRole};
use crate::persistence::SessionPersistence;
use crate::quota::GuestQuotaTracker;
use futures::StreamExt;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

const ATTACHMENT_ONLY_PROMPT: &str = "Please analyze the attached content and explain the key points.";
const NOTICE_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Sending,
    Streaming,
    Failed,
}

impl EngineState {
    pub fn is_busy(&self) -> bool {
        matches!(self, EngineState::Sending | EngineState::Streaming)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// A toast for the UI.
#[derive(Debug, Clone, PartialEq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    Completed(ConversationTurn),
    /// The stream ended without any content; nothing was kept.
    EmptyResponse,
    /// The chat was cleared or replaced while the reply was in flight.
    Discarded,
}

#[derive(Clone)]
pub enum SessionKind {
    Authenticated {
        user: CurrentUser,
        persistence: Arc<SessionPersistence>,
    },
    Guest(GuestQuotaTracker),
}

struct EngineInner {
    state: EngineState,
    generation: u64,
}

enum StreamEnd {
    Finished(String),
    Superseded,
}

/// Renders attachments as a textual preamble in front of the user's text.
pub fn compose_prompt(text: &str, attachments: Option<&Attachments>) -> String {
    let body = if text.is_empty() { ATTACHMENT_ONLY_PROMPT } else { text };
    let Some(attachments) = attachments.filter(|a| !a.is_empty()) else {
        return body.to_string();
    };

    let mut prompt = String::from("[Attached materials]\n");
    for file in &attachments.files {
        let _ = writeln!(prompt, "- File \"{}\" ({}): {}", file.name, file.mime_type, file.url);
    }
    for link in &attachments.links {
        let _ = writeln!(prompt, "- Link \"{}\": {}", link.title, link.url);
    }
    prompt.push('\n');
    prompt.push_str(body);
    prompt
}

#[derive(Clone)]
pub struct ChatEngine {
    inner: Arc<Mutex<EngineInner>>,
    transcript: Arc<watch::Sender<Vec<ConversationTurn>>>,
    notices: broadcast::Sender<Notice>,
    context: ChatContext,
    kind: SessionKind,
    capability: Capability,
    proxy: Arc<dyn ModelProxy>,
    gate: AccessGate,
}

impl ChatEngine {
    pub fn new(context: ChatContext, kind: SessionKind, proxy: Arc<dyn ModelProxy>, gate: AccessGate) -> Self {
        let (transcript, _rx) = watch::channel(Vec::new());
        let (notices, _rx) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(EngineInner {
                state: EngineState::Idle,
                generation: 0,
            })),
            transcript: Arc::new(transcript),
            notices,
            context,
            kind,
            capability: Capability::MentorChat,
            proxy,
            gate,
        }
    }

    /// Gates this engine on a capability other than mentor chat.
    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capability = capability;
        self
    }

    fn lock(&self) -> MutexGuard<'_, EngineInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn context(&self) -> &ChatContext {
        &self.context
    }

    pub fn transcript(&self) -> Vec<ConversationTurn> {
        self.transcript.borrow().clone()
    }

    /// Receives a new snapshot on every transcript mutation.
    pub fn subscribe(&self) -> watch::Receiver<Vec<ConversationTurn>> {
        self.transcript.subscribe()
    }

    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    pub fn state(&self) -> EngineState {
        self.lock().state
    }

    pub fn is_busy(&self) -> bool {
        self.state().is_busy()
    }

    pub fn is_guest(&self) -> bool {
        matches!(self.kind, SessionKind::Guest(_))
    }

    pub fn session_id(&self) -> Option<Uuid> {
        match &self.kind {
            SessionKind::Authenticated { persistence, .. } => persistence.session_id(),
            SessionKind::Guest(_) => None,
        }
    }

    /// `None` for signed-in users, who have no guest quota.
    pub fn remaining_guest_messages(&self) -> Option<u32> {
        match &self.kind {
            SessionKind::Guest(quota) => Some(quota.remaining()),
            SessionKind::Authenticated { .. } => None,
        }
    }

    pub fn has_reached_limit(&self) -> bool {
        match &self.kind {
            SessionKind::Guest(quota) => quota.has_reached_limit(),
            SessionKind::Authenticated { .. } => false,
        }
    }

    fn caller_role(&self) -> Option<UserRole> {
        match &self.kind {
            SessionKind::Authenticated { user, .. } => Some(user.role),
            SessionKind::Guest(_) => None,
        }
    }

    fn access_token(&self) -> Option<&str> {
        match &self.kind {
            SessionKind::Authenticated { user, .. } => user.access_token.as_deref(),
            SessionKind::Guest(_) => None,
        }
    }

    fn check_access(&self) -> Result<(), ChatError> {
        let allowed = match (&self.kind, self.capability) {
            (SessionKind::Guest(_), Capability::MentorChat) => self.gate.guest_allowed(),
            _ => self.gate.allows(self.capability, self.caller_role()),
        };
        if allowed {
            Ok(())
        } else {
            log::warn!("AI {} is disabled for caller {:?}", self.capability, self.caller_role());
            Err(ChatError::AccessDenied(self.capability))
        }
    }

    fn notify(&self, level: NoticeLevel, message: impl Into<String>) {
        let notice = Notice {
            level,
            message: message.into(),
        };
        if self.notices.send(notice).is_err() {
            log::debug!("No notice subscribers");
        }
    }

    fn storage_warning(&self, what: &str, error: &anyhow::Error) {
        log::error!("{}: {:#}", what, error);
        self.notify(
            NoticeLevel::Warning,
            format!("{}. The conversation stays visible here but may be missing later.", what),
        );
    }

    /// Sends one user turn and streams the assistant's reply into the transcript.
    ///
    /// Errors are also published as notices; on failure the user turn stays
    /// and only the assistant placeholder is removed.
    pub async fn send_message(
        &self,
        content: &str,
        attachments: Option<Attachments>,
    ) -> Result<SendOutcome, ChatError> {
        let attachments = attachments.filter(|a| !a.is_empty());
        let text = content.trim();
        if text.is_empty() && attachments.is_none() {
            return Err(ChatError::EmptyMessage);
        }
        if let Err(e) = self.check_access() {
            self.notify(NoticeLevel::Warning, e.user_message());
            return Err(e);
        }

        let (generation, user_turn) = self.begin_turn(text, attachments.as_ref())?;
        let title_source = if text.is_empty() { user_turn.content.as_str() } else { text };
        let session_id = self.persist_user_turn(&user_turn, title_source).await;

        let Some((request, placeholder_id)) = self.start_reply(generation, attachments) else {
            log::info!("Chat was cleared before the request was sent");
            return Ok(SendOutcome::Discarded);
        };

        match self.stream_reply(generation, placeholder_id, &request).await {
            Ok(StreamEnd::Finished(content)) => {
                Ok(self.finish_turn(generation, placeholder_id, content, session_id).await)
            }
            Ok(StreamEnd::Superseded) => {
                log::info!("Dropping reply for a chat that was cleared mid-stream");
                Ok(SendOutcome::Discarded)
            }
            Err(e) => {
                if self.fail_turn(generation, placeholder_id, &e) {
                    Err(e)
                } else {
                    Ok(SendOutcome::Discarded)
                }
            }
        }
    }

    // Optimistically appends the user turn; guests pay one quota unit here.
    fn begin_turn(
        &self,
        text: &str,
        attachments: Option<&Attachments>,
    ) -> Result<(u64, ConversationTurn), ChatError> {
        let mut inner = self.lock();
        if inner.state.is_busy() {
            log::warn!("Ignoring send while a response is in progress");
            return Err(ChatError::Busy);
        }

        if let SessionKind::Guest(quota) = &self.kind {
            if let Err(e) = quota.consume_one() {
                self.notify(NoticeLevel::Warning, e.user_message());
                return Err(e);
            }
        }

        let turn = ConversationTurn::new(Role::User, compose_prompt(text, attachments));
        self.transcript.send_modify(|turns| turns.push(turn.clone()));
        inner.state = EngineState::Sending;
        Ok((inner.generation, turn))
    }

    async fn persist_user_turn(&self, turn: &ConversationTurn, title_source: &str) -> Option<Uuid> {
        let SessionKind::Authenticated { persistence, .. } = &self.kind else {
            return None;
        };

        let session_id = match persistence
            .ensure_session(self.context.mode, self.context.subject.as_deref())
            .await
        {
            Ok(id) => id,
            Err(e) => {
                self.storage_warning("Could not start a saved conversation", &e);
                return None;
            }
        };

        if let Err(e) = persistence.record_turn(session_id, turn).await {
            self.storage_warning("Could not save your message", &e);
            return Some(session_id);
        }
        if let Err(e) = persistence.derive_title(session_id, title_source).await {
            self.storage_warning("Could not name this conversation", &e);
        }
        Some(session_id)
    }

    // Builds the request from the transcript and appends the empty assistant placeholder.
    fn start_reply(&self, generation: u64, attachments: Option<Attachments>) -> Option<(ChatRequest, Uuid)> {
        let mut inner = self.lock();
        if inner.generation != generation {
            return None;
        }

        let messages: Vec<ApiMessage> = self.transcript.borrow().iter().map(ApiMessage::from).collect();
        let placeholder = ConversationTurn::new(Role::Assistant, String::new());
        let placeholder_id = placeholder.id;
        self.transcript.send_modify(|turns| turns.push(placeholder));
        inner.state = EngineState::Streaming;

        let request = ChatRequest {
            messages,
            mode: self.context.mode,
            level: self.context.level.clone(),
            subject: self.context.subject.clone(),
            language: self.context.language.clone(),
            attachments,
            is_guest: self.is_guest(),
        };
        Some((request, placeholder_id))
    }

    async fn stream_reply(
        &self,
        generation: u64,
        placeholder_id: Uuid,
        request: &ChatRequest,
    ) -> Result<StreamEnd, ChatError> {
        let mut deltas = self
            .proxy
            .send_chat_stream_request(request, self.access_token())
            .await?;

        let mut content = String::new();
        while let Some(delta) = deltas.next().await {
            let delta = delta?;
            if !self.apply_delta(generation, placeholder_id, &delta) {
                return Ok(StreamEnd::Superseded);
            }
            content.push_str(&delta);
        }
        Ok(StreamEnd::Finished(content))
    }

    // The only place assistant content grows.
    fn apply_delta(&self, generation: u64, placeholder_id: Uuid, delta: &str) -> bool {
        let inner = self.lock();
        if inner.generation != generation {
            return false;
        }
        self.transcript.send_modify(|turns| {
            if let Some(turn) = turns.iter_mut().rev().find(|t| t.id == placeholder_id) {
                turn.content.push_str(delta);
            }
        });
        true
    }

    fn remove_turn(&self, turn_id: Uuid) {
        self.transcript.send_modify(|turns| turns.retain(|t| t.id != turn_id));
    }

    // Returns false when the failure belongs to a superseded turn.
    fn fail_turn(&self, generation: u64, placeholder_id: Uuid, error: &ChatError) -> bool {
        {
            let mut inner = self.lock();
            if inner.generation != generation {
                log::info!("Ignoring failure of a superseded turn: {}", error);
                return false;
            }
            inner.state = EngineState::Failed;
            self.remove_turn(placeholder_id);
        }

        log::error!("Chat turn failed: {}", error);
        self.notify(NoticeLevel::Error, error.user_message());

        let mut inner = self.lock();
        if inner.generation == generation {
            inner.state = EngineState::Idle;
        }
        true
    }

    async fn finish_turn(
        &self,
        generation: u64,
        placeholder_id: Uuid,
        content: String,
        session_id: Option<Uuid>,
    ) -> SendOutcome {
        let finished = {
            let mut inner = self.lock();
            if inner.generation != generation {
                return SendOutcome::Discarded;
            }
            inner.state = EngineState::Idle;

            if content.is_empty() {
                self.remove_turn(placeholder_id);
                None
            } else {
                self.transcript
                    .borrow()
                    .iter()
                    .rev()
                    .find(|t| t.id == placeholder_id)
                    .cloned()
            }
        };

        let Some(turn) = finished else {
            log::warn!("Model proxy returned an empty response");
            self.notify(NoticeLevel::Warning, "The AI returned an empty answer. Please try again.");
            return SendOutcome::EmptyResponse;
        };
        log::info!("Assistant turn {} completed ({} chars)", turn.id, turn.content.len());

        // Only complete replies are persisted
        if let (SessionKind::Authenticated { persistence, .. }, Some(session_id)) = (&self.kind, session_id) {
            if let Err(e) = persistence.record_turn(session_id, &turn).await {
                self.storage_warning("Could not save the answer", &e);
            }
        }
        SendOutcome::Completed(turn)
    }

    /// Starts over with an empty transcript and no session. Saved sessions are kept.
    pub fn clear_chat(&self) {
        let mut inner = self.lock();
        inner.generation += 1;
        inner.state = EngineState::Idle;
        self.transcript.send_replace(Vec::new());
        if let SessionKind::Authenticated { persistence, .. } = &self.kind {
            persistence.reset();
        }
        log::info!("Chat cleared (generation {})", inner.generation);
    }

    fn persistence(&self) -> Result<&SessionPersistence, ChatError> {
        match &self.kind {
            SessionKind::Authenticated { persistence, .. } => Ok(persistence),
            SessionKind::Guest(_) => Err(ChatError::Persistence(anyhow::anyhow!(
                "Guest conversations are not saved"
            ))),
        }
    }

    pub async fn list_recent_sessions(&self, limit: i64) -> Result<Vec<ChatSession>, ChatError> {
        Ok(self.persistence()?.list_recent(limit).await?)
    }

    /// Replaces the transcript with a saved session; new turns append to it.
    pub async fn resume_session(&self, session_id: Uuid) -> Result<ChatSession, ChatError> {
        let persistence = self.persistence()?;
        if self.is_busy() {
            return Err(ChatError::Busy);
        }

        let (session, turns) = match persistence.resume(session_id).await {
            Ok(loaded) => loaded,
            Err(e) => {
                log::error!("Failed to load session {}: {:#}", session_id, e);
                self.notify(NoticeLevel::Error, "Could not load this conversation.");
                return Err(ChatError::Persistence(e));
            }
        };

        let mut inner = self.lock();
        inner.generation += 1;
        inner.state = EngineState::Idle;
        self.transcript.send_replace(turns);
        log::info!("Resumed session {}", session.id);
        Ok(session)
    }

    /// Deletes a saved session; clears the view first if it is the open one.
    pub async fn delete_session(&self, session_id: Uuid) -> Result<(), ChatError> {
        let persistence = self.persistence()?;
        if self.session_id() == Some(session_id) {
            self.clear_chat();
        }
        if let Err(e) = persistence.delete_session(session_id).await {
            log::error!("Failed to delete session {}: {:#}", session_id, e);
            self.notify(NoticeLevel::Error, "Could not delete this conversation.");
            return Err(ChatError::Persistence(e));
        }
        self.notify(NoticeLevel::Info, "Conversation deleted.");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FileAttachment, LinkAttachment};

    #[test]
    fn plain_text_is_sent_unchanged() {
        assert_eq!(compose_prompt("What is a prime?", None), "What is a prime?");
    }

    #[test]
    fn attachments_become_a_preamble() {
        let attachments = Attachments {
            files: vec![FileAttachment {
                name: "lab.pdf".to_string(),
                url: "https://files.example/lab.pdf".to_string(),
                mime_type: "application/pdf".to_string(),
            }],
            links: vec![LinkAttachment {
                title: "Wiki".to_string(),
                url: "https://wiki.example/cells".to_string(),
            }],
        };
        let prompt = compose_prompt("Summarize this", Some(&attachments));
        assert!(prompt.starts_with("[Attached materials]\n"));
        assert!(prompt.contains("- File \"lab.pdf\" (application/pdf): https://files.example/lab.pdf"));
        assert!(prompt.contains("- Link \"Wiki\": https://wiki.example/cells"));
        assert!(prompt.ends_with("\n\nSummarize this"));
    }

    #[test]
    fn attachments_without_text_get_default_instruction() {
        let attachments = Attachments {
            files: vec![],
            links: vec![LinkAttachment {
                title: "Article".to_string(),
                url: "https://news.example/a".to_string(),
            }],
        };
        let prompt = compose_prompt("", Some(&attachments));
        assert!(prompt.ends_with(ATTACHMENT_ONLY_PROMPT));
    }

    #[test]
    fn busy_states() {
        assert!(EngineState::Sending.is_busy());
        assert!(EngineState::Streaming.is_busy());
        assert!(!EngineState::Idle.is_busy());
        assert!(!EngineState::Failed.is_busy());
    }
}
