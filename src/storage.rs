use crate::models::{ChatMode, ChatSession, ConversationTurn, Role};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

// Schema, applied statement by statement on every start
const MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS chat_sessions (
        id TEXT PRIMARY KEY NOT NULL,
        user_id TEXT NOT NULL,
        mode TEXT NOT NULL,
        subject TEXT,
        title TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_chat_sessions_user ON chat_sessions(user_id, updated_at)",
    // No ON DELETE CASCADE: messages are removed explicitly before their session
    "CREATE TABLE IF NOT EXISTS chat_messages (
        id TEXT PRIMARY KEY NOT NULL,
        session_id TEXT NOT NULL REFERENCES chat_sessions(id),
        role TEXT NOT NULL,
        content TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_chat_messages_session ON chat_messages(session_id, created_at)",
    "CREATE TABLE IF NOT EXISTS settings (
        key TEXT PRIMARY KEY NOT NULL,
        value TEXT NOT NULL
    )",
];

/// Row-level CRUD over sessions, messages and settings.
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn create_session(
        &self,
        user_id: Uuid,
        mode: ChatMode,
        subject: Option<&str>,
    ) -> anyhow::Result<ChatSession>;

    async fn get_session(&self, session_id: Uuid) -> anyhow::Result<Option<ChatSession>>;

    /// Most recently active first.
    async fn list_sessions(&self, user_id: Uuid, limit: i64) -> anyhow::Result<Vec<ChatSession>>;

    /// Appends a message and bumps the session's `updated_at`.
    async fn save_message(&self, session_id: Uuid, turn: &ConversationTurn) -> anyhow::Result<()>;

    /// Returns `false` when the session already had a title.
    async fn set_title_if_unset(&self, session_id: Uuid, title: &str) -> anyhow::Result<bool>;

    /// In creation order.
    async fn get_session_messages(&self, session_id: Uuid) -> anyhow::Result<Vec<ConversationTurn>>;

    async fn delete_session(&self, session_id: Uuid) -> anyhow::Result<()>;

    async fn count_messages(&self, session_id: Uuid) -> anyhow::Result<i64>;

    async fn get_setting(&self, key: &str) -> anyhow::Result<Option<String>>;

    async fn put_setting(&self, key: &str, value: &str) -> anyhow::Result<()>;
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    user_id: String,
    mode: String,
    subject: Option<String>,
    title: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<SessionRow> for ChatSession {
    type Error = anyhow::Error;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        Ok(ChatSession {
            id: Uuid::parse_str(&row.id).context("Failed to parse session ID")?,
            user_id: Uuid::parse_str(&row.user_id).context("Failed to parse session owner ID")?,
            mode: ChatMode::from_str(&row.mode)?,
            subject: row.subject,
            title: row.title,
            created_at: from_millis(row.created_at).context("Invalid created_at timestamp")?,
            updated_at: from_millis(row.updated_at).context("Invalid updated_at timestamp")?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: String,
    role: String,
    content: String,
    created_at: i64,
}

impl TryFrom<MessageRow> for ConversationTurn {
    type Error = anyhow::Error;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        Ok(ConversationTurn {
            id: Uuid::parse_str(&row.id).context("Failed to parse message ID")?,
            role: Role::from_str(&row.role)?,
            content: row.content,
            created_at: from_millis(row.created_at).context("Invalid message timestamp")?,
        })
    }
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
}

#[derive(Debug, Clone)]
pub struct StorageManager {
    pool: SqlitePool,
}

impl StorageManager {
    /// Connects to (creating if needed) the database at `database_url` and runs migrations.
    pub async fn connect(database_url: &str) -> Result<Self, anyhow::Error> {
        log::info!("Connecting to database: {}", database_url);
        let options = SqliteConnectOptions::from_str(database_url)
            .context("Invalid database URL")?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// A private database living as long as this manager. Used for guests-only runs and tests.
    pub async fn in_memory() -> Result<Self, anyhow::Error> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .context("Invalid in-memory database URL")?
            .foreign_keys(true);

        // Every connection to :memory: is a separate database, so pin exactly one
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect_with(options)
            .await
            .context("Failed to open in-memory SQLite database")?;

        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    async fn run_migrations(pool: &SqlitePool) -> Result<(), anyhow::Error> {
        log::info!("Running database migrations...");
        for statement in MIGRATIONS {
            sqlx::query(*statement)
                .execute(pool)
                .await
                .context("Failed to run database migrations")?;
        }
        log::info!("Database migrations completed.");
        Ok(())
    }
}

#[async_trait]
impl ChatStore for StorageManager {
    async fn create_session(
        &self,
        user_id: Uuid,
        mode: ChatMode,
        subject: Option<&str>,
    ) -> anyhow::Result<ChatSession> {
        let now = Utc::now();
        let session = ChatSession {
            id: Uuid::new_v4(),
            user_id,
            mode,
            subject: subject.map(str::to_string),
            title: None,
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            r#"
            INSERT INTO chat_sessions (id, user_id, mode, subject, title, created_at, updated_at)
            VALUES (?, ?, ?, ?, NULL, ?, ?)
            "#,
        )
        .bind(session.id.to_string())
        .bind(user_id.to_string())
        .bind(mode.as_str())
        .bind(session.subject.as_deref())
        .bind(now.timestamp_millis())
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await
        .context("Failed to insert new chat session into database")?;

        log::info!("Created chat session {} ({}) for user {}", session.id, mode, user_id);
        Ok(session)
    }

    async fn get_session(&self, session_id: Uuid) -> anyhow::Result<Option<ChatSession>> {
        log::debug!("Fetching chat session {}", session_id);
        let row = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT id, user_id, mode, subject, title, created_at, updated_at
            FROM chat_sessions
            WHERE id = ?
            "#,
        )
        .bind(session_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch chat session from database")?;

        row.map(ChatSession::try_from).transpose()
    }

    async fn list_sessions(&self, user_id: Uuid, limit: i64) -> anyhow::Result<Vec<ChatSession>> {
        let rows = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT id, user_id, mode, subject, title, created_at, updated_at
            FROM chat_sessions
            WHERE user_id = ?
            ORDER BY updated_at DESC, rowid DESC
            LIMIT ?
            "#,
        )
        .bind(user_id.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch chat sessions from database")?;

        let sessions = rows
            .into_iter()
            .map(ChatSession::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        log::info!("Fetched {} chat sessions for user {}", sessions.len(), user_id);
        Ok(sessions)
    }

    async fn save_message(&self, session_id: Uuid, turn: &ConversationTurn) -> anyhow::Result<()> {
        log::debug!("Saving {} message {} to session {}", turn.role.as_str(), turn.id, session_id);
        let session_id_text = session_id.to_string();

        sqlx::query(
            r#"
            INSERT INTO chat_messages (id, session_id, role, content, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(turn.id.to_string())
        .bind(&session_id_text)
        .bind(turn.role.as_str())
        .bind(&turn.content)
        .bind(turn.created_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .context("Failed to insert message into database")?;

        sqlx::query("UPDATE chat_sessions SET updated_at = ? WHERE id = ?")
            .bind(Utc::now().timestamp_millis())
            .bind(&session_id_text)
            .execute(&self.pool)
            .await
            .context("Failed to update chat session updated_at timestamp")?;

        Ok(())
    }

    async fn set_title_if_unset(&self, session_id: Uuid, title: &str) -> anyhow::Result<bool> {
        let result = sqlx::query("UPDATE chat_sessions SET title = ? WHERE id = ? AND title IS NULL")
            .bind(title)
            .bind(session_id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to update chat session title")?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_session_messages(&self, session_id: Uuid) -> anyhow::Result<Vec<ConversationTurn>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT id, role, content, created_at
            FROM chat_messages
            WHERE session_id = ?
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .bind(session_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch messages from database")?;

        let turns = rows
            .into_iter()
            .map(ConversationTurn::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        log::info!("Fetched {} messages for session {}", turns.len(), session_id);
        Ok(turns)
    }

    async fn delete_session(&self, session_id: Uuid) -> anyhow::Result<()> {
        let session_id_text = session_id.to_string();
        log::warn!("Deleting chat session {}", session_id_text);

        let mut tx = self.pool.begin().await.context("Failed to start delete transaction")?;

        // Children first; the foreign key rejects the reverse order
        let messages = sqlx::query("DELETE FROM chat_messages WHERE session_id = ?")
            .bind(&session_id_text)
            .execute(&mut *tx)
            .await
            .context("Failed to delete chat session messages")?;

        let sessions = sqlx::query("DELETE FROM chat_sessions WHERE id = ?")
            .bind(&session_id_text)
            .execute(&mut *tx)
            .await
            .context("Failed to delete chat session")?;

        tx.commit().await.context("Failed to commit chat session delete")?;

        if sessions.rows_affected() == 0 {
            log::warn!("Attempted to delete non-existent chat session: {}", session_id);
        }
        log::info!(
            "Deleted chat session {} and {} messages",
            session_id,
            messages.rows_affected()
        );
        Ok(())
    }

    async fn count_messages(&self, session_id: Uuid) -> anyhow::Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chat_messages WHERE session_id = ?")
            .bind(session_id.to_string())
            .fetch_one(&self.pool)
            .await
            .context("Failed to count messages")?;
        Ok(count)
    }

    async fn get_setting(&self, key: &str) -> anyhow::Result<Option<String>> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to read setting")?;
        Ok(value)
    }

    async fn put_setting(&self, key: &str, value: &str) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO settings (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .context("Failed to save setting")?;
        Ok(())
    }
}
