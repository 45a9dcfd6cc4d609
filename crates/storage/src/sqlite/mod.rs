use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

use snafu::{OptionExt, ResultExt};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};

use super::error::{
    CreateSqliteDirectorySnafu, DecodeMessageSnafu, EncodeMessageSnafu, InvariantViolationSnafu,
    SqliteConnectOptionsSnafu, SqliteConnectSnafu, SqliteMigrateSnafu, SqliteQuerySnafu,
    StorageError, StorageResult,
};
use super::ids::{MessageId, SessionId};
use super::types::{AttachmentRecord, MessageRecord, MessageRole, SessionSummary, StoredContent};
use super::{BoxFuture, SessionStore};

pub const IN_MEMORY_LOCATION: &str = ":memory:";

#[derive(Debug, Clone)]
pub struct SqliteSessionStore {
    pool: SqlitePool,
    database_url: String,
}

impl SqliteSessionStore {
    /// Opens (creating if needed) the database at `database_location` and applies migrations.
    ///
    /// Accepts a filesystem path, a `sqlite:` URL, or `:memory:`.
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let in_memory = is_in_memory(database_location);
        let database_url = normalize_database_url(database_location);
        let mut connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_millis(5_000));
        if !in_memory {
            connect_options = connect_options.journal_mode(SqliteJournalMode::Wal);
        }

        // A single long-lived connection: writes are serialized and an in-memory
        // database survives for the lifetime of the pool.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        tracing::debug!(database_url = %database_url, "opened sqlite session store");
        Ok(Self { pool, database_url })
    }

    pub async fn open_in_memory() -> StorageResult<Self> {
        Self::open(IN_MEMORY_LOCATION).await
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn load_transcript(&self, session_id: SessionId) -> StorageResult<Vec<MessageRecord>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            "SELECT id, role, content, attachments FROM messages WHERE session_id = ? ORDER BY seq ASC",
        )
        .bind(session_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "transcript-get-query",
        })?;

        rows.into_iter().map(message_row_to_record).collect()
    }

    async fn replace_transcript(
        &self,
        session_id: SessionId,
        messages: Vec<MessageRecord>,
    ) -> StorageResult<()> {
        // Encode up front so a bad payload never leaves a half-written transaction.
        let encoded = messages
            .iter()
            .map(encode_message)
            .collect::<StorageResult<Vec<_>>>()?;

        let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
            stage: "transcript-put-begin",
        })?;
        let now = unix_timestamp_millis();

        sqlx::query(
            "INSERT INTO sessions (id, created_at, updated_at) VALUES (?, ?, ?) ON CONFLICT(id) DO UPDATE SET updated_at = excluded.updated_at",
        )
        .bind(session_id.to_string())
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .context(SqliteQuerySnafu {
            stage: "transcript-put-upsert-session",
        })?;

        sqlx::query("DELETE FROM messages WHERE session_id = ?")
            .bind(session_id.to_string())
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "transcript-put-clear",
            })?;

        for (seq, message) in encoded.into_iter().enumerate() {
            sqlx::query(
                "INSERT INTO messages (session_id, seq, id, role, content, attachments) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(session_id.to_string())
            .bind(usize_to_i64(seq, "transcript-put-seq")?)
            .bind(message.id)
            .bind(message.role)
            .bind(message.content)
            .bind(message.attachments)
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "transcript-put-insert-message",
            })?;
        }

        tx.commit().await.context(SqliteQuerySnafu {
            stage: "transcript-put-commit",
        })?;

        Ok(())
    }
}

impl SessionStore for SqliteSessionStore {
    fn get<'a>(&'a self, session_id: SessionId) -> BoxFuture<'a, StorageResult<Vec<MessageRecord>>> {
        Box::pin(self.load_transcript(session_id))
    }

    fn put<'a>(
        &'a self,
        session_id: SessionId,
        messages: Vec<MessageRecord>,
    ) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(self.replace_transcript(session_id, messages))
    }

    fn list_sessions<'a>(&'a self) -> BoxFuture<'a, StorageResult<Vec<SessionSummary>>> {
        Box::pin(async move {
            let rows = sqlx::query_as::<_, SessionSummaryRow>(
                "SELECT s.id AS id, s.updated_at AS updated_at, COUNT(m.seq) AS message_count FROM sessions s LEFT JOIN messages m ON m.session_id = s.id GROUP BY s.id ORDER BY s.updated_at DESC, s.id DESC",
            )
            .fetch_all(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "session-list-query",
            })?;

            rows.into_iter().map(session_summary_row_to_record).collect()
        })
    }

    fn delete_session<'a>(&'a self, session_id: SessionId) -> BoxFuture<'a, StorageResult<bool>> {
        Box::pin(async move {
            let result = sqlx::query("DELETE FROM sessions WHERE id = ?")
                .bind(session_id.to_string())
                .execute(&self.pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "session-delete-apply",
                })?;

            Ok(result.rows_affected() > 0)
        })
    }
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: String,
    role: String,
    content: String,
    attachments: String,
}

#[derive(Debug, FromRow)]
struct SessionSummaryRow {
    id: String,
    updated_at: i64,
    message_count: i64,
}

struct EncodedMessage {
    id: String,
    role: &'static str,
    content: String,
    attachments: String,
}

fn encode_message(message: &MessageRecord) -> StorageResult<EncodedMessage> {
    Ok(EncodedMessage {
        id: message.id.to_string(),
        role: message.role.as_str(),
        content: serde_json::to_string(&message.content).context(EncodeMessageSnafu {
            stage: "encode-message-content",
            field: "content",
        })?,
        attachments: serde_json::to_string(&message.attachments).context(EncodeMessageSnafu {
            stage: "encode-message-attachments",
            field: "attachments",
        })?,
    })
}

fn message_row_to_record(row: MessageRow) -> StorageResult<MessageRecord> {
    let role = MessageRole::parse(&row.role).context(InvariantViolationSnafu {
        stage: "message-row-role",
        details: format!("unknown message role '{}'", row.role),
    })?;
    let content = serde_json::from_str::<StoredContent>(&row.content).context(DecodeMessageSnafu {
        stage: "message-row-content",
        field: "content",
    })?;
    let attachments = serde_json::from_str::<Vec<AttachmentRecord>>(&row.attachments).context(
        DecodeMessageSnafu {
            stage: "message-row-attachments",
            field: "attachments",
        },
    )?;

    Ok(MessageRecord {
        id: MessageId::parse(&row.id)?,
        role,
        content,
        attachments,
    })
}

fn session_summary_row_to_record(row: SessionSummaryRow) -> StorageResult<SessionSummary> {
    Ok(SessionSummary {
        id: SessionId::parse(&row.id)?,
        message_count: i64_to_u64(row.message_count, "session-summary-count")?,
        updated_at_unix_seconds: i64_to_u64(row.updated_at, "session-summary-updated-at")? / 1_000,
    })
}

fn unix_timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0_i64, |duration| duration.as_millis() as i64)
}

fn i64_to_u64(value: i64, stage: &'static str) -> StorageResult<u64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("negative sqlite integer '{value}' cannot map to u64"),
        })
}

fn usize_to_i64(value: usize, stage: &'static str) -> StorageResult<i64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("usize '{value}' cannot map to sqlite i64"),
        })
}

fn is_in_memory(database_location: &str) -> bool {
    database_location == IN_MEMORY_LOCATION || database_location.contains(":memory:")
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || is_in_memory(database_location) {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == IN_MEMORY_LOCATION {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}
