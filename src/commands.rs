// Terminal front end: parses input lines into commands and drives one chat view.

use crate::engine::{ChatEngine, Notice, NoticeLevel, SendOutcome};
use crate::error::ChatError;
use crate::identity::IdentityProvider;
use crate::models::{Attachments, ChatMode, ConversationTurn, CurrentUser, FileAttachment, LinkAttachment, Role, UserRole};
use crate::state::AppState;
use std::collections::HashSet;
use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

const RECENT_SESSIONS: i64 = 20;

const HELP: &str = "\
Commands:
  /new                   start a new conversation
  /sessions              list your saved conversations
  /open <id>             resume a saved conversation
  /delete <id>           delete a saved conversation
  /mode <mode>           teacher | mentor | interviewer | examiner
  /attach <path>         upload a file and attach it to the next message
  /link <url> [title]    attach a link to the next message
  /quota                 show remaining guest messages
  /login <role> [token]  sign in as student | teacher | admin | founder
  /logout                sign out
  /settings              show AI feature switches
  /set <key> <on|off>    change a feature switch (admins only)
  /quit                  exit
Anything else is sent as a message.";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Send(String),
    New,
    Sessions,
    Open(Uuid),
    Delete(Uuid),
    Mode(ChatMode),
    Attach(PathBuf),
    Link(LinkAttachment),
    Quota,
    Login(UserRole, Option<String>),
    Logout,
    Settings,
    Set(String, bool),
    Help,
    Quit,
}

fn parse_id(arg: Option<&str>) -> Result<Uuid, String> {
    let raw = arg.ok_or_else(|| "Missing session ID".to_string())?;
    Uuid::parse_str(raw).map_err(|_| format!("Invalid session ID format: {}", raw))
}

impl FromStr for Command {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        if !line.starts_with('/') {
            return Ok(Command::Send(line.to_string()));
        }

        let mut parts = line.split_whitespace();
        let name = parts.next().unwrap_or_default();
        let command = match name {
            "/new" => Command::New,
            "/sessions" => Command::Sessions,
            "/open" => Command::Open(parse_id(parts.next())?),
            "/delete" => Command::Delete(parse_id(parts.next())?),
            "/mode" => {
                let raw = parts.next().ok_or("Missing mode")?;
                Command::Mode(ChatMode::from_str(raw).map_err(|e| e.to_string())?)
            }
            "/attach" => {
                // Paths may contain spaces
                let path = line[name.len()..].trim();
                if path.is_empty() {
                    return Err("Missing file path".to_string());
                }
                Command::Attach(PathBuf::from(path))
            }
            "/link" => {
                let url = parts.next().ok_or("Missing link URL")?;
                let title = parts.collect::<Vec<_>>().join(" ");
                Command::Link(LinkAttachment {
                    title: if title.is_empty() { url.to_string() } else { title },
                    url: url.to_string(),
                })
            }
            "/quota" => Command::Quota,
            "/login" => {
                let raw = parts.next().ok_or("Missing role")?;
                let role = UserRole::from_str(raw).map_err(|e| e.to_string())?;
                Command::Login(role, parts.next().map(str::to_string))
            }
            "/logout" => Command::Logout,
            "/settings" => Command::Settings,
            "/set" => {
                let key = parts.next().ok_or("Missing setting name")?;
                let value = match parts.next() {
                    Some("on") | Some("true") => true,
                    Some("off") | Some("false") => false,
                    _ => return Err("Expected 'on' or 'off'".to_string()),
                };
                Command::Set(key.to_string(), value)
            }
            "/help" => Command::Help,
            "/quit" | "/exit" => Command::Quit,
            other => return Err(format!("Unknown command: {}", other)),
        };
        Ok(command)
    }
}

fn print_transcript(turns: &[ConversationTurn]) {
    for turn in turns {
        let who = match turn.role {
            Role::User => "you",
            Role::Assistant => "ai",
            Role::System => "system",
        };
        println!("[{}] {}", who, turn.content);
    }
}

pub struct ChatShell {
    state: AppState,
    engine: ChatEngine,
    notices: broadcast::Receiver<Notice>,
    auth: watch::Receiver<Option<CurrentUser>>,
    mode: ChatMode,
    pending: Attachments,
}

impl ChatShell {
    pub fn new(state: AppState) -> Self {
        let mode = state.config.default_mode;
        let engine = state.open_chat(mode);
        let notices = engine.notices();
        let auth = state.identity.on_auth_change();
        Self {
            state,
            engine,
            notices,
            auth,
            mode,
            pending: Attachments::default(),
        }
    }

    // A new identity or mode means a brand-new chat view
    fn reopen(&mut self) {
        self.engine.clear_chat();
        self.engine = self.state.open_chat(self.mode);
        self.notices = self.engine.notices();
    }

    // Signing in or out anywhere replaces the open view
    fn follow_identity(&mut self) {
        if self.auth.has_changed().unwrap_or(false) {
            let _ = self.auth.borrow_and_update();
            self.reopen();
        }
    }

    pub fn engine(&self) -> &ChatEngine {
        &self.engine
    }

    pub fn pending_attachments(&self) -> &Attachments {
        &self.pending
    }

    fn drain_notices(&mut self) {
        while let Ok(notice) = self.notices.try_recv() {
            let tag = match notice.level {
                NoticeLevel::Info => "info",
                NoticeLevel::Warning => "warning",
                NoticeLevel::Error => "error",
            };
            println!("({}) {}", tag, notice.message);
        }
    }

    pub async fn run_stdin(mut self) -> anyhow::Result<()> {
        println!("tutorchat ready. Type /help for commands.");
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            match Command::from_str(&line) {
                Ok(Command::Quit) => break,
                Ok(command) => {
                    if let Err(e) = self.execute(command).await {
                        println!("(error) {}", e);
                    }
                }
                Err(e) => println!("(error) {}", e),
            }
            self.drain_notices();
        }
        Ok(())
    }

    pub async fn execute(&mut self, command: Command) -> Result<(), String> {
        let result = self.dispatch(command).await;
        self.follow_identity();
        result
    }

    async fn dispatch(&mut self, command: Command) -> Result<(), String> {
        match command {
            Command::Send(text) => self.send(&text).await,
            Command::New => {
                self.engine.clear_chat();
                println!("Started a new conversation.");
                Ok(())
            }
            Command::Sessions => {
                let sessions = self
                    .engine
                    .list_recent_sessions(RECENT_SESSIONS)
                    .await
                    .map_err(|e| e.to_string())?;
                if sessions.is_empty() {
                    println!("No saved conversations.");
                }
                for session in sessions {
                    println!(
                        "{}  {:<11} {}  {}",
                        session.id,
                        session.mode.as_str(),
                        session.updated_at.format("%Y-%m-%d %H:%M"),
                        session.title.as_deref().unwrap_or("New Chat")
                    );
                }
                Ok(())
            }
            Command::Open(id) => {
                let session = self.engine.resume_session(id).await.map_err(|e| e.to_string())?;
                println!("== {} ==", session.title.as_deref().unwrap_or("New Chat"));
                print_transcript(&self.engine.transcript());
                Ok(())
            }
            Command::Delete(id) => self.engine.delete_session(id).await.map_err(|e| e.to_string()),
            Command::Mode(mode) => {
                self.mode = mode;
                self.reopen();
                println!("Mode set to {}.", mode);
                Ok(())
            }
            Command::Attach(path) => {
                let uploaded = self
                    .state
                    .blob_store
                    .upload(&path)
                    .await
                    .map_err(|e| format!("Failed to upload file: {:#}", e))?;
                println!("Attached {} ({}, {} bytes).", uploaded.name, uploaded.mime_type, uploaded.size);
                self.pending.files.push(FileAttachment::from(uploaded));
                Ok(())
            }
            Command::Link(link) => {
                println!("Attached link {}.", link.title);
                self.pending.links.push(link);
                Ok(())
            }
            Command::Quota => {
                match self.engine.remaining_guest_messages() {
                    Some(remaining) => println!("{} guest messages left.", remaining),
                    None => println!("Signed-in users have no guest limit."),
                }
                Ok(())
            }
            Command::Login(role, token) => {
                self.state.identity.sign_in(role, token);
                println!("Signed in as {:?}.", role);
                Ok(())
            }
            Command::Logout => {
                self.state.identity.sign_out();
                println!("Signed out. You are chatting as a guest.");
                Ok(())
            }
            Command::Settings => {
                let snapshot = self.state.settings.snapshot();
                let rendered = serde_json::to_string_pretty(&snapshot).map_err(|e| e.to_string())?;
                println!("{}", rendered);
                Ok(())
            }
            Command::Set(key, value) => {
                let caller = self.state.current_user();
                let mut patch = serde_json::Map::new();
                patch.insert(key, serde_json::Value::Bool(value));
                let patch = serde_json::Value::Object(patch);
                self.state
                    .settings
                    .update_as(caller.as_ref(), &patch, self.state.storage.as_ref())
                    .await
                    .map_err(|e| format!("Failed to update settings: {:#}", e))?;
                println!("Settings updated.");
                Ok(())
            }
            Command::Help => {
                println!("{}", HELP);
                Ok(())
            }
            Command::Quit => Ok(()),
        }
    }

    // Sends one message and prints the reply as it streams in.
    async fn send(&mut self, text: &str) -> Result<(), String> {
        let attachments = std::mem::take(&mut self.pending);
        let attachments = (!attachments.is_empty()).then_some(attachments);

        let known: HashSet<Uuid> = self.engine.transcript().iter().map(|t| t.id).collect();
        let mut updates = self.engine.subscribe();
        let mut printed = 0usize;

        let engine = self.engine.clone();
        let send = engine.send_message(text, attachments);
        tokio::pin!(send);

        let result = loop {
            tokio::select! {
                result = &mut send => break result,
                changed = updates.changed() => {
                    if changed.is_err() {
                        break (&mut send).await;
                    }
                    let reply = updates
                        .borrow_and_update()
                        .iter()
                        .rev()
                        .find(|t| t.role == Role::Assistant && !known.contains(&t.id))
                        .map(|t| t.content.clone());
                    if let Some(content) = reply {
                        print_new_text(&content, &mut printed);
                    }
                }
            }
        };

        match result {
            Ok(SendOutcome::Completed(turn)) => {
                print_new_text(&turn.content, &mut printed);
                println!();
                Ok(())
            }
            Ok(SendOutcome::EmptyResponse) | Ok(SendOutcome::Discarded) => Ok(()),
            Err(e @ (ChatError::EmptyMessage | ChatError::Busy)) => Err(e.user_message()),
            // Everything else already raised a notice
            Err(_) => {
                if printed > 0 {
                    println!();
                }
                Ok(())
            }
        }
    }
}

fn print_new_text(content: &str, printed: &mut usize) {
    if content.len() > *printed {
        print!("{}", &content[*printed..]);
        let _ = std::io::stdout().flush();
        *printed = content.len();
    }
}
