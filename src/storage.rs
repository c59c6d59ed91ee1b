use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
use sqlx::{Pool, Row, Sqlite};

use crate::chat::message::Message;
use crate::settings::ModelSettings;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRecord {
    pub id: String,
    pub owner: String,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub settings: ModelSettings,
}

#[async_trait]
pub trait ChatRepository: Send + Sync {
    /// Returns the chat, creating it for `owner` if it does not exist yet.
    async fn ensure_chat(&self, id: &str, owner: &str) -> anyhow::Result<ChatRecord>;
    async fn list_chats(&self, owner: &str) -> anyhow::Result<Vec<ChatRecord>>;
    async fn update_settings(&self, id: &str, settings: &ModelSettings) -> anyhow::Result<()>;
    async fn get_settings(&self, id: &str) -> anyhow::Result<ModelSettings>;
    /// Finalized messages only. Re-appending the same id is a no-op.
    async fn append_message(&self, id: &str, msg: &Message) -> anyhow::Result<()>;
    async fn list_messages(&self, id: &str) -> anyhow::Result<Vec<Message>>;
}

#[derive(Clone)]
pub struct SqliteChatRepository {
    pool: Pool<Sqlite>,
}

impl SqliteChatRepository {
    pub async fn initialize(database_url: Option<String>) -> anyhow::Result<Self> {
        let url = match database_url {
            Some(u) => u,
            None => resolve_default_db_url()?,
        };
        let options = url
            .parse::<SqliteConnectOptions>()?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);
        let pool = Pool::<Sqlite>::connect_with(options).await?;
        sqlx::query("PRAGMA busy_timeout = 5000;").execute(&pool).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        tracing::info!(%url, "chat database ready");
        Ok(Self { pool })
    }

    #[cfg(test)]
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

fn resolve_default_db_url() -> anyhow::Result<String> {
    let base = std::env::var("XDG_DATA_HOME")
        .ok()
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
            PathBuf::from(home).join(".local").join("share")
        });
    let dir = base.join("medassist");
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("medassist.db");
    Ok(format!("sqlite://{}", path.to_string_lossy()))
}

fn parse_time(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn chat_from_row(r: &sqlx::sqlite::SqliteRow) -> anyhow::Result<ChatRecord> {
    let settings_json: String = r.get("settings_json");
    let created_at: String = r.get("created_at");
    Ok(ChatRecord {
        id: r.get("id"),
        owner: r.get("owner"),
        title: r.try_get("title").ok().flatten(),
        created_at: parse_time(&created_at),
        settings: serde_json::from_str(&settings_json)?,
    })
}

#[async_trait]
impl ChatRepository for SqliteChatRepository {
    async fn ensure_chat(&self, id: &str, owner: &str) -> anyhow::Result<ChatRecord> {
        let settings_json = serde_json::to_string(&ModelSettings::default())?;
        sqlx::query(
            "INSERT OR IGNORE INTO chats (id, owner, title, created_at, settings_json) \
             VALUES (?1, ?2, NULL, ?3, ?4)",
        )
        .bind(id)
        .bind(owner)
        .bind(Utc::now().to_rfc3339())
        .bind(settings_json)
        .execute(&self.pool)
        .await?;
        let row = sqlx::query(
            "SELECT id, owner, title, created_at, settings_json FROM chats WHERE id = ?1",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        chat_from_row(&row)
    }

    async fn list_chats(&self, owner: &str) -> anyhow::Result<Vec<ChatRecord>> {
        let rows = sqlx::query(
            "SELECT id, owner, title, created_at, settings_json FROM chats \
             WHERE owner = ?1 ORDER BY created_at DESC",
        )
        .bind(owner)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(chat_from_row).collect()
    }

    async fn update_settings(&self, id: &str, settings: &ModelSettings) -> anyhow::Result<()> {
        let settings_json = serde_json::to_string(settings)?;
        let res = sqlx::query("UPDATE chats SET settings_json = ?1 WHERE id = ?2")
            .bind(settings_json)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if res.rows_affected() == 0 {
            anyhow::bail!("chat {} not found", id);
        }
        Ok(())
    }

    async fn get_settings(&self, id: &str) -> anyhow::Result<ModelSettings> {
        let row = sqlx::query("SELECT settings_json FROM chats WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            anyhow::bail!("chat {} not found", id);
        };
        let json: String = row.get("settings_json");
        Ok(serde_json::from_str(&json)?)
    }

    async fn append_message(&self, id: &str, msg: &Message) -> anyhow::Result<()> {
        let message_json = serde_json::to_string(msg)?;
        sqlx::query(
            "INSERT OR IGNORE INTO messages (id, chat_id, seq, role, created_at, message_json) \
             VALUES (?1, ?2, (SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE chat_id = ?2), \
             ?3, ?4, ?5)",
        )
        .bind(&msg.id)
        .bind(id)
        .bind(msg.role.as_str())
        .bind(msg.created_at.to_rfc3339())
        .bind(message_json)
        .execute(&self.pool)
        .await?;
        if msg.role == crate::chat::message::Role::User {
            let title: String = msg.text().chars().take(80).collect();
            sqlx::query("UPDATE chats SET title = ?1 WHERE id = ?2 AND title IS NULL")
                .bind(title)
                .bind(id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    async fn list_messages(&self, id: &str) -> anyhow::Result<Vec<Message>> {
        let rows =
            sqlx::query("SELECT message_json FROM messages WHERE chat_id = ?1 ORDER BY seq ASC")
                .bind(id)
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter()
            .map(|r| -> anyhow::Result<Message> {
                let json: String = r.get("message_json");
                Ok(serde_json::from_str(&json)?)
            })
            .collect()
    }
}
