use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// Who authored a turn. `System` only ever appears in outgoing requests.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            other => Err(anyhow!("Unknown message role: {}", other)),
        }
    }
}

// Represents a single turn in a conversation
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ConversationTurn {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub role: Role,
    pub content: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

/// The persona the model takes on for a conversation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChatMode {
    Teacher,
    #[default]
    Mentor,
    Interviewer,
    Examiner,
}

impl ChatMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatMode::Teacher => "teacher",
            ChatMode::Mentor => "mentor",
            ChatMode::Interviewer => "interviewer",
            ChatMode::Examiner => "examiner",
        }
    }
}

impl FromStr for ChatMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "teacher" => Ok(ChatMode::Teacher),
            "mentor" => Ok(ChatMode::Mentor),
            "interviewer" => Ok(ChatMode::Interviewer),
            "examiner" => Ok(ChatMode::Examiner),
            other => Err(anyhow!("Unknown chat mode: {}", other)),
        }
    }
}

impl fmt::Display for ChatMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Metadata for a persisted conversation (signed-in users only)
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ChatSession {
    pub id: Uuid,
    pub user_id: Uuid,
    pub mode: ChatMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Soft usage limit for visitors who are not signed in.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GuestQuotaState {
    pub message_count: u32,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Student,
    Teacher,
    Admin,
    Founder,
}

impl UserRole {
    /// Admins and founders bypass every feature switch.
    pub fn is_privileged(&self) -> bool {
        matches!(self, UserRole::Admin | UserRole::Founder)
    }
}

impl FromStr for UserRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "student" => Ok(UserRole::Student),
            "teacher" => Ok(UserRole::Teacher),
            "admin" => Ok(UserRole::Admin),
            "founder" => Ok(UserRole::Founder),
            other => Err(anyhow!("Unknown user role: {}", other)),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CurrentUser {
    pub id: Uuid,
    pub role: UserRole,
    // Bearer token for the model proxy; never serialized back out
    #[serde(skip_serializing, default)]
    pub access_token: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FileAttachment {
    pub name: String,
    pub url: String,
    #[serde(rename = "type")]
    pub mime_type: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct LinkAttachment {
    pub title: String,
    pub url: String,
}

// Already-uploaded files and external links attached to a user turn
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Attachments {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileAttachment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<LinkAttachment>,
}

impl Attachments {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.links.is_empty()
    }
}

/// Per-conversation parameters sent with every request.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ChatContext {
    pub mode: ChatMode,
    pub level: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}
