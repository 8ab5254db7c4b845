//! The message store: conversations, messages, settings.
//!
//! Every write runs inside a single transaction on the pool's writer;
//! reads use pooled reader connections. Sequence IDs are assigned here,
//! inside the same transaction as the message insert, so they are strictly
//! increasing per conversation under the single-writer discipline.

use std::sync::Arc;

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use tracing::{debug, instrument};

use quill_core::{ConversationId, MessageId};

use crate::errors::{Result, StoreError};
use crate::migrations;
use crate::pool::{Pool, PoolConfig};
use crate::rows::{ConversationRow, MessageRow, MessageType};

/// Attempts before giving up on a unique sub-agent slug.
const SLUG_RETRY_LIMIT: usize = 100;

/// Parameters for [`Store::create_message`]. The four data payloads are
/// pre-serialized JSON, opaque to the store.
#[derive(Clone, Debug, Default)]
pub struct CreateMessageParams {
    /// Owning conversation.
    pub conversation_id: String,
    /// Type tag.
    pub message_type: MessageType,
    /// LLM content payload.
    pub llm_data: Option<String>,
    /// User-visible payload.
    pub user_data: Option<String>,
    /// Token-usage payload.
    pub usage_data: Option<String>,
    /// Tool-specific display payload.
    pub display_data: Option<String>,
}

/// High-level store over the reader/writer pool.
pub struct Store {
    pool: Arc<Pool>,
}

impl Store {
    /// Wrap an existing pool.
    #[must_use]
    pub fn new(pool: Pool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Open the database file and wrap it. Does not migrate.
    pub fn open(config: &PoolConfig) -> Result<Self> {
        Ok(Self::new(Pool::open(config)?))
    }

    /// Apply pending schema migrations. Idempotent.
    pub fn migrate(&self) -> Result<usize> {
        migrations::migrate(&self.pool)
    }

    /// The underlying pool, for collaborators with bespoke queries.
    #[must_use]
    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    // ─────────────────────────────────────────────────────────────────────
    // Conversations
    // ─────────────────────────────────────────────────────────────────────

    /// Create a conversation with a fresh ID.
    #[instrument(skip(self))]
    pub fn create_conversation(
        &self,
        slug: Option<&str>,
        user_initiated: bool,
        cwd: Option<&str>,
    ) -> Result<ConversationRow> {
        let id = ConversationId::generate();
        self.insert_conversation(&id, slug, user_initiated, cwd, None)
    }

    /// Create a sub-agent conversation linked to `parent_id`.
    #[instrument(skip(self))]
    pub fn create_subagent_conversation(
        &self,
        slug: &str,
        parent_id: &str,
        cwd: Option<&str>,
    ) -> Result<ConversationRow> {
        let id = ConversationId::generate();
        self.insert_conversation(&id, Some(slug), false, cwd, Some(parent_id))
    }

    fn insert_conversation(
        &self,
        id: &ConversationId,
        slug: Option<&str>,
        user_initiated: bool,
        cwd: Option<&str>,
        parent_id: Option<&str>,
    ) -> Result<ConversationRow> {
        let created_at = Utc::now().to_rfc3339();
        self.pool.write(|tx| {
            tx.execute(
                "INSERT INTO conversations
                   (conversation_id, slug, user_initiated, cwd, parent_conversation_id, archived, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
                params![id.as_str(), slug, user_initiated, cwd, parent_id, created_at],
            )?;
            Ok(ConversationRow {
                conversation_id: id.as_str().to_owned(),
                slug: slug.map(str::to_owned),
                user_initiated,
                cwd: cwd.map(str::to_owned),
                parent_conversation_id: parent_id.map(str::to_owned),
                archived: false,
                created_at,
            })
        })
    }

    /// Fetch a conversation by ID.
    ///
    /// # Errors
    ///
    /// [`StoreError::ConversationNotFound`] when absent.
    pub fn get_conversation(&self, conversation_id: &str) -> Result<ConversationRow> {
        self.pool
            .read(|conn| {
                Ok(conn
                    .query_row(
                        &format!(
                            "SELECT {} FROM conversations WHERE conversation_id = ?1",
                            ConversationRow::COLUMNS
                        ),
                        [conversation_id],
                        ConversationRow::from_row,
                    )
                    .optional()?)
            })?
            .ok_or_else(|| StoreError::ConversationNotFound(conversation_id.to_owned()))
    }

    /// Fetch a conversation by slug.
    pub fn get_conversation_by_slug(&self, slug: &str) -> Result<ConversationRow> {
        self.pool
            .read(|conn| {
                Ok(conn
                    .query_row(
                        &format!(
                            "SELECT {} FROM conversations WHERE slug = ?1",
                            ConversationRow::COLUMNS
                        ),
                        [slug],
                        ConversationRow::from_row,
                    )
                    .optional()?)
            })?
            .ok_or_else(|| StoreError::ConversationNotFound(slug.to_owned()))
    }

    /// Look up a sub-agent conversation by slug and parent. Absent is not
    /// an error.
    pub fn get_conversation_by_slug_and_parent(
        &self,
        slug: &str,
        parent_id: &str,
    ) -> Result<Option<ConversationRow>> {
        self.pool.read(|conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {} FROM conversations
                         WHERE slug = ?1 AND parent_conversation_id = ?2",
                        ConversationRow::COLUMNS
                    ),
                    params![slug, parent_id],
                    ConversationRow::from_row,
                )
                .optional()?)
        })
    }

    /// List non-archived conversations, newest first.
    pub fn list_conversations(&self, limit: i64, offset: i64) -> Result<Vec<ConversationRow>> {
        self.list_where("archived = 0", &[], limit, offset)
    }

    /// List archived conversations, newest first.
    pub fn list_archived_conversations(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ConversationRow>> {
        self.list_where("archived = 1", &[], limit, offset)
    }

    /// Search non-archived conversations by slug substring.
    pub fn search_conversations(
        &self,
        query: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ConversationRow>> {
        let needle = format!("%{query}%");
        self.list_where(
            "archived = 0 AND slug LIKE ?1",
            &[&needle as &dyn rusqlite::ToSql],
            limit,
            offset,
        )
    }

    /// Search archived conversations by slug substring.
    pub fn search_archived_conversations(
        &self,
        query: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ConversationRow>> {
        let needle = format!("%{query}%");
        self.list_where(
            "archived = 1 AND slug LIKE ?1",
            &[&needle as &dyn rusqlite::ToSql],
            limit,
            offset,
        )
    }

    fn list_where(
        &self,
        predicate: &str,
        extra: &[&dyn rusqlite::ToSql],
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ConversationRow>> {
        self.pool.read(|conn| {
            let sql = format!(
                "SELECT {} FROM conversations WHERE {predicate}
                 ORDER BY created_at DESC, conversation_id DESC
                 LIMIT ?{limit_idx} OFFSET ?{offset_idx}",
                ConversationRow::COLUMNS,
                limit_idx = extra.len() + 1,
                offset_idx = extra.len() + 2,
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut all: Vec<&dyn rusqlite::ToSql> = extra.to_vec();
            all.push(&limit);
            all.push(&offset);
            let rows = stmt
                .query_map(all.as_slice(), ConversationRow::from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// List sub-agent conversations of a parent, oldest first.
    pub fn list_subagents(&self, parent_id: &str) -> Result<Vec<ConversationRow>> {
        self.pool.read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM conversations
                 WHERE parent_conversation_id = ?1
                 ORDER BY created_at ASC, conversation_id ASC",
                ConversationRow::COLUMNS
            ))?;
            let rows = stmt
                .query_map([parent_id], ConversationRow::from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Total number of conversations.
    pub fn count_conversations(&self) -> Result<i64> {
        self.pool.read(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM conversations", [], |r| r.get(0))?)
        })
    }

    /// Set the archived flag and return the updated row.
    pub fn archive_conversation(&self, conversation_id: &str) -> Result<ConversationRow> {
        self.set_archived(conversation_id, true)
    }

    /// Clear the archived flag and return the updated row.
    pub fn unarchive_conversation(&self, conversation_id: &str) -> Result<ConversationRow> {
        self.set_archived(conversation_id, false)
    }

    fn set_archived(&self, conversation_id: &str, archived: bool) -> Result<ConversationRow> {
        self.pool
            .write(|tx| {
                tx.execute(
                    "UPDATE conversations SET archived = ?1 WHERE conversation_id = ?2",
                    params![archived, conversation_id],
                )?;
                Ok(tx
                    .query_row(
                        &format!(
                            "SELECT {} FROM conversations WHERE conversation_id = ?1",
                            ConversationRow::COLUMNS
                        ),
                        [conversation_id],
                        ConversationRow::from_row,
                    )
                    .optional()?)
            })?
            .ok_or_else(|| StoreError::ConversationNotFound(conversation_id.to_owned()))
    }

    /// Update the working directory recorded on a conversation.
    pub fn update_conversation_cwd(&self, conversation_id: &str, cwd: &str) -> Result<()> {
        let changed = self.pool.exec(
            "UPDATE conversations SET cwd = ?1 WHERE conversation_id = ?2",
            params![cwd, conversation_id],
        )?;
        if changed == 0 {
            return Err(StoreError::ConversationNotFound(conversation_id.to_owned()));
        }
        Ok(())
    }

    /// Update the slug and return the updated row.
    pub fn update_conversation_slug(
        &self,
        conversation_id: &str,
        slug: &str,
    ) -> Result<ConversationRow> {
        self.pool.exec(
            "UPDATE conversations SET slug = ?1 WHERE conversation_id = ?2",
            params![slug, conversation_id],
        )?;
        self.get_conversation(conversation_id)
    }

    /// Delete a conversation and its messages in one transaction.
    #[instrument(skip(self))]
    pub fn delete_conversation(&self, conversation_id: &str) -> Result<()> {
        self.pool.write(|tx| {
            tx.execute(
                "DELETE FROM messages WHERE conversation_id = ?1",
                [conversation_id],
            )?;
            tx.execute(
                "DELETE FROM conversations WHERE conversation_id = ?1",
                [conversation_id],
            )?;
            Ok(())
        })
    }

    /// Get or create a sub-agent conversation by slug and parent, resolving
    /// slug collisions with `-1`, `-2`, … suffixes.
    ///
    /// Returns the conversation and the slug actually used. The collision is
    /// detected by substring match on the driver error because the store
    /// returns the underlying error verbatim.
    pub fn get_or_create_subagent_conversation(
        &self,
        slug: &str,
        parent_id: &str,
        cwd: Option<&str>,
    ) -> Result<(ConversationRow, String)> {
        if let Some(existing) = self.get_conversation_by_slug_and_parent(slug, parent_id)? {
            let actual = existing.slug.clone().unwrap_or_else(|| slug.to_owned());
            return Ok((existing, actual));
        }

        let mut actual = slug.to_owned();
        for attempt in 0..SLUG_RETRY_LIMIT {
            match self.create_subagent_conversation(&actual, parent_id, cwd) {
                Ok(conv) => return Ok((conv, actual)),
                Err(e) if e.is_unique_violation() => {
                    actual = format!("{slug}-{}", attempt + 1);
                }
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::Internal(format!(
            "failed to create unique subagent slug for {slug:?} after {SLUG_RETRY_LIMIT} attempts"
        )))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Messages
    // ─────────────────────────────────────────────────────────────────────

    /// Persist a message, assigning the conversation's next sequence ID
    /// inside the same write transaction as the insert.
    #[instrument(skip(self, params), fields(conversation_id = %params.conversation_id, message_type = %params.message_type))]
    pub fn create_message(&self, params: &CreateMessageParams) -> Result<MessageRow> {
        let message_id = MessageId::generate();
        let created_at = Utc::now().to_rfc3339();

        let row = self.pool.write(|tx| {
            let sequence_id: i64 = tx.query_row(
                "SELECT COALESCE(MAX(sequence_id), 0) + 1 FROM messages WHERE conversation_id = ?1",
                [params.conversation_id.as_str()],
                |r| r.get(0),
            )?;
            tx.execute(
                "INSERT INTO messages
                   (message_id, conversation_id, sequence_id, type,
                    llm_data, user_data, usage_data, display_data, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    message_id.as_str(),
                    params.conversation_id,
                    sequence_id,
                    params.message_type.as_str(),
                    params.llm_data,
                    params.user_data,
                    params.usage_data,
                    params.display_data,
                    created_at,
                ],
            )?;
            Ok(MessageRow {
                message_id: message_id.as_str().to_owned(),
                conversation_id: params.conversation_id.clone(),
                sequence_id,
                message_type: params.message_type.as_str().to_owned(),
                llm_data: params.llm_data.clone(),
                user_data: params.user_data.clone(),
                usage_data: params.usage_data.clone(),
                display_data: params.display_data.clone(),
                created_at,
            })
        })?;

        debug!(
            conversation_id = %row.conversation_id,
            sequence_id = row.sequence_id,
            "message persisted"
        );
        Ok(row)
    }

    /// Fetch a message by ID.
    pub fn get_message(&self, message_id: &str) -> Result<MessageRow> {
        self.pool
            .read(|conn| {
                Ok(conn
                    .query_row(
                        &format!(
                            "SELECT {} FROM messages WHERE message_id = ?1",
                            MessageRow::COLUMNS
                        ),
                        [message_id],
                        MessageRow::from_row,
                    )
                    .optional()?)
            })?
            .ok_or_else(|| StoreError::MessageNotFound(message_id.to_owned()))
    }

    /// All messages of a conversation in sequence order.
    pub fn list_messages(&self, conversation_id: &str) -> Result<Vec<MessageRow>> {
        self.list_messages_after(conversation_id, 0)
    }

    /// Messages with `sequence_id > after`, in sequence order. The replay
    /// query behind resumable streams.
    pub fn list_messages_after(
        &self,
        conversation_id: &str,
        after: i64,
    ) -> Result<Vec<MessageRow>> {
        self.pool.read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM messages
                 WHERE conversation_id = ?1 AND sequence_id > ?2
                 ORDER BY sequence_id ASC",
                MessageRow::COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![conversation_id, after], MessageRow::from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// A page of messages in sequence order.
    pub fn list_messages_paginated(
        &self,
        conversation_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<MessageRow>> {
        self.pool.read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM messages
                 WHERE conversation_id = ?1
                 ORDER BY sequence_id ASC
                 LIMIT ?2 OFFSET ?3",
                MessageRow::COLUMNS
            ))?;
            let rows = stmt
                .query_map(
                    params![conversation_id, limit, offset],
                    MessageRow::from_row,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Messages of one type, in sequence order.
    pub fn list_messages_by_type(
        &self,
        conversation_id: &str,
        message_type: MessageType,
    ) -> Result<Vec<MessageRow>> {
        self.pool.read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM messages
                 WHERE conversation_id = ?1 AND type = ?2
                 ORDER BY sequence_id ASC",
                MessageRow::COLUMNS
            ))?;
            let rows = stmt
                .query_map(
                    params![conversation_id, message_type.as_str()],
                    MessageRow::from_row,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Number of messages of one type.
    pub fn count_messages_by_type(
        &self,
        conversation_id: &str,
        message_type: MessageType,
    ) -> Result<i64> {
        self.pool.read(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1 AND type = ?2",
                params![conversation_id, message_type.as_str()],
                |r| r.get(0),
            )?)
        })
    }

    /// The highest-sequence message, if any.
    pub fn latest_message(&self, conversation_id: &str) -> Result<Option<MessageRow>> {
        self.pool.read(|conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {} FROM messages
                         WHERE conversation_id = ?1
                         ORDER BY sequence_id DESC LIMIT 1",
                        MessageRow::COLUMNS
                    ),
                    [conversation_id],
                    MessageRow::from_row,
                )
                .optional()?)
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Settings
    // ─────────────────────────────────────────────────────────────────────

    /// Read a setting.
    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        self.pool.read(|conn| {
            Ok(conn
                .query_row("SELECT value FROM settings WHERE key = ?1", [key], |r| {
                    r.get(0)
                })
                .optional()?)
        })
    }

    /// Upsert a setting; last write wins.
    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let updated_at = Utc::now().to_rfc3339();
        self.pool.exec(
            "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, updated_at],
        )?;
        Ok(())
    }
}
