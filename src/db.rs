use crate::constants::DB_PRAGMAS;
use crate::store::{ConversationPatch, ConversationStore, FileStore, NewFile};
use crate::types::*;
use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use std::path::Path;

pub type DbPool = SqlitePool;

pub async fn init_db<P: AsRef<Path>>(path: P) -> Result<DbPool> {
    let path_str = match path.as_ref().to_str() {
        Some(s) => s,
        None => {
            return Err(ChatError::internal(
                "Invalid database path: Path contains non-UTF8 characters",
            )
            .into())
        }
    };
    let url = format!("sqlite:{}?mode=rwc", path_str);

    let pool = match SqlitePool::connect(&url).await {
        Ok(p) => p,
        Err(e) => return Err(ChatError::Database(e).into()),
    };

    configure_db(&pool).await?;

    if let Err(e) = sqlx::migrate!("./migrations").run(&pool).await {
        return Err(ChatError::internal(format!("Migration failed: {}", e)).into());
    }

    verify_schema_version(&pool).await;

    if let Err(e) = sweep_pending_turns(&pool).await {
        tracing::warn!("Pending turn sweep failed: {}", e);
    }

    Ok(pool)
}

/// Deletes incomplete messages left behind by streams that never settled (a
/// crash mid-stream, or a failed cleanup). No stream survives a restart, so
/// every such row at startup is stale.
pub async fn sweep_pending_turns(pool: &DbPool) -> std::result::Result<u64, sqlx::Error> {
    let swept = sqlx::query("DELETE FROM messages WHERE is_complete = 0")
        .execute(pool)
        .await?;
    if swept.rows_affected() > 0 {
        tracing::info!(
            "Swept {} incomplete messages from interrupted streams",
            swept.rows_affected()
        );
    }
    Ok(swept.rows_affected())
}

async fn configure_db(pool: &DbPool) -> Result<()> {
    for pragma in DB_PRAGMAS {
        if let Err(e) = sqlx::query(pragma).execute(pool).await {
            return Err(ChatError::Database(e).into());
        }
    }
    Ok(())
}

async fn verify_schema_version(pool: &DbPool) {
    let version_row: std::result::Result<(String,), sqlx::Error> =
        sqlx::query_as("SELECT value FROM schema_metadata WHERE key = 'schema_version'")
            .fetch_one(pool)
            .await;

    match version_row {
        Ok((version,)) => {
            tracing::info!("Database initialized. Schema version: {}", version);
        }
        Err(e) => {
            tracing::warn!("Could not verify schema version: {}", e);
        }
    }
}

fn to_db_size(size: u64) -> Result<i64> {
    match i64::try_from(size) {
        Ok(s) => Ok(s),
        Err(_) => Err(ChatError::Validation(format!("File size {} is out of range", size)).into()),
    }
}

fn conversation_from_row(row: &SqliteRow) -> Result<Conversation> {
    Ok(Conversation {
        id: ConversationId(row.try_get("id")?),
        owner: UserId(row.try_get("owner")?),
        created_at: row.try_get("created_at")?,
        latest_message_text: row.try_get("latest_message_text")?,
        latest_message_time: row.try_get("latest_message_time")?,
    })
}

fn message_from_row(row: &SqliteRow) -> Result<Message> {
    let role_str: String = row.try_get("role")?;
    let role = match Role::parse(&role_str) {
        Some(r) => r,
        None => {
            return Err(ChatError::Persistence(format!(
                "Stored message has unknown role '{}'",
                role_str
            ))
            .into())
        }
    };
    let attachments_json: String = row.try_get("attachments_json")?;
    let attachments: Vec<AttachmentRef> = serde_json::from_str(&attachments_json)?;
    let is_complete: Option<i64> = row.try_get("is_complete")?;

    Ok(Message {
        id: MessageId(row.try_get("id")?),
        conversation_id: ConversationId(row.try_get("conversation_id")?),
        owner: UserId(row.try_get("owner")?),
        role,
        content: row.try_get("content")?,
        created_at: row.try_get("created_at")?,
        is_complete: is_complete.map(|v| v != 0),
        attachments,
    })
}

fn file_from_row(row: &SqliteRow) -> Result<FileRecord> {
    let file_size: i64 = row.try_get("file_size")?;
    let is_processed: i64 = row.try_get("is_processed")?;
    Ok(FileRecord {
        id: FileId(row.try_get("id")?),
        owner: UserId(row.try_get("owner")?),
        file_name: row.try_get("file_name")?,
        file_type: row.try_get("file_type")?,
        file_size: file_size.max(0) as u64,
        storage_id: row.try_get("storage_id")?,
        uploaded_at: row.try_get("uploaded_at")?,
        is_processed: is_processed != 0,
        extracted_text: row.try_get("extracted_text")?,
    })
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl ConversationStore for SqliteStore {
    async fn create_conversation(&self, owner: &UserId) -> Result<Conversation> {
        let conversation = Conversation {
            id: ConversationId::new(),
            owner: owner.clone(),
            created_at: now_ms(),
            latest_message_text: None,
            latest_message_time: None,
        };
        sqlx::query("INSERT INTO conversations (id, owner, created_at) VALUES (?, ?, ?)")
            .bind(conversation.id.as_str())
            .bind(conversation.owner.as_str())
            .bind(conversation.created_at)
            .execute(&self.pool)
            .await?;
        Ok(conversation)
    }

    async fn get_conversation(&self, id: &ConversationId) -> Result<Option<Conversation>> {
        let row = sqlx::query("SELECT * FROM conversations WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(r) => Ok(Some(conversation_from_row(&r)?)),
            None => Ok(None),
        }
    }

    async fn list_conversations(&self, owner: &UserId) -> Result<Vec<Conversation>> {
        let rows = sqlx::query(
            "SELECT * FROM conversations WHERE owner = ? \
             ORDER BY COALESCE(latest_message_time, created_at) DESC, created_at DESC",
        )
        .bind(owner.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(conversation_from_row).collect()
    }

    async fn patch_conversation(
        &self,
        id: &ConversationId,
        patch: ConversationPatch,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE conversations SET \
             latest_message_text = COALESCE(?, latest_message_text), \
             latest_message_time = COALESCE(?, latest_message_time) \
             WHERE id = ?",
        )
        .bind(patch.latest_message_text)
        .bind(patch.latest_message_time)
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_conversation(&self, id: &ConversationId) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query("DELETE FROM messages WHERE conversation_id = ?")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM conversations WHERE id = ?")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(deleted.rows_affected())
    }

    async fn append_message(&self, message: NewMessage) -> Result<Message> {
        let stored = Message {
            id: MessageId::new(),
            conversation_id: message.conversation_id,
            owner: message.owner,
            role: message.role,
            content: message.content,
            created_at: now_ms(),
            is_complete: message.is_complete,
            attachments: message.attachments,
        };
        let attachments_json = serde_json::to_string(&stored.attachments)?;
        sqlx::query(
            "INSERT INTO messages \
             (id, conversation_id, owner, role, content, created_at, is_complete, attachments_json) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(stored.id.as_str())
        .bind(stored.conversation_id.as_str())
        .bind(stored.owner.as_str())
        .bind(stored.role.as_str())
        .bind(&stored.content)
        .bind(stored.created_at)
        .bind(stored.is_complete.map(i64::from))
        .bind(attachments_json)
        .execute(&self.pool)
        .await?;
        Ok(stored)
    }

    async fn list_messages(&self, conversation_id: &ConversationId) -> Result<Vec<Message>> {
        let rows = sqlx::query("SELECT * FROM messages WHERE conversation_id = ? ORDER BY seq ASC")
            .bind(conversation_id.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn finalize_message(&self, id: &MessageId, content: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE messages SET content = ?, is_complete = 1 WHERE id = ? AND is_complete = 0",
        )
        .bind(content)
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_message(&self, id: &MessageId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM messages WHERE id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_messages(&self, conversation_id: &ConversationId) -> Result<u64> {
        let result = sqlx::query("DELETE FROM messages WHERE conversation_id = ?")
            .bind(conversation_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl FileStore for SqliteStore {
    async fn create_file(&self, file: NewFile) -> Result<FileRecord> {
        let record = FileRecord {
            id: FileId::new(),
            owner: file.owner,
            file_name: file.file_name,
            file_type: file.file_type,
            file_size: file.file_size,
            storage_id: file.storage_id,
            uploaded_at: now_ms(),
            is_processed: false,
            extracted_text: None,
        };
        sqlx::query(
            "INSERT INTO files \
             (id, owner, file_name, file_type, file_size, storage_id, uploaded_at, is_processed) \
             VALUES (?, ?, ?, ?, ?, ?, ?, 0)",
        )
        .bind(record.id.as_str())
        .bind(record.owner.as_str())
        .bind(&record.file_name)
        .bind(&record.file_type)
        .bind(to_db_size(record.file_size)?)
        .bind(&record.storage_id)
        .bind(record.uploaded_at)
        .execute(&self.pool)
        .await?;
        Ok(record)
    }

    async fn get_file(&self, id: &FileId) -> Result<Option<FileRecord>> {
        let row = sqlx::query("SELECT * FROM files WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(r) => Ok(Some(file_from_row(&r)?)),
            None => Ok(None),
        }
    }

    async fn update_processing_status(
        &self,
        id: &FileId,
        is_processed: bool,
        extracted_text: Option<String>,
    ) -> Result<()> {
        sqlx::query("UPDATE files SET is_processed = ?, extracted_text = ? WHERE id = ?")
            .bind(i64::from(is_processed))
            .bind(extracted_text)
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
