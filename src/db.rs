//! Database module for Branchline
//!
//! Provides persistence for conversations and the message tree.

mod schema;

pub use schema::*;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),
    #[error("Message not found: {0}")]
    MessageNotFound(String),
    #[error("Message {message_id} cannot become the tip of conversation {conversation_id}")]
    TipRejected {
        conversation_id: String,
        message_id: String,
    },
    #[error("Sequence numbers exhausted in conversation {0}")]
    SequenceExhausted(String),
    #[error("Storage unavailable: {0}")]
    #[allow(dead_code)] // Raised by test doubles
    Unavailable(String),
}

pub type DbResult<T> = Result<T, DbError>;

/// Largest sequence number the store hands out or accepts from a client.
/// Kept within the integer range JSON clients represent exactly.
pub const MAX_SEQUENCE_NUMBER: i64 = (1 << 53) - 1;

/// Whether a client-proposed sequence number may be stored as is
pub fn acceptable_sequence(seq: i64) -> bool {
    (1..=MAX_SEQUENCE_NUMBER).contains(&seq)
}

const CONVERSATION_COLUMNS: &str =
    "id, owner_id, title, status, tip_message_id, created_at, updated_at";

const MESSAGE_COLUMNS: &str = "id, conversation_id, sequence_number, previous_id, role, contents, \
     local_id, server_id, sync_status, synced_at, created_at, updated_at";

/// Thread-safe database handle
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    #[allow(dead_code)] // Used in tests
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> DbResult<()> {
        let conn = self.conn();
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    /// A panicked writer leaves SQLite itself consistent, so a poisoned lock is still usable.
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ==================== Conversation Operations ====================

    /// Create a new, empty conversation
    pub fn create_conversation(&self, id: &str, owner_id: &str, title: &str) -> DbResult<Conversation> {
        let conn = self.conn();
        let now = Utc::now();

        conn.execute(
            "INSERT INTO conversations (id, owner_id, title, status, tip_message_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'active', NULL, ?4, ?4)",
            params![id, owner_id, title, now.to_rfc3339()],
        )?;

        Ok(Conversation {
            id: id.to_string(),
            owner_id: owner_id.to_string(),
            title: title.to_string(),
            status: ConversationStatus::Active,
            tip_message_id: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Get conversation by ID
    pub fn get_conversation(&self, id: &str) -> DbResult<Conversation> {
        let conn = self.conn();
        query_conversation(&conn, id)
    }

    /// Get a conversation only if it belongs to `owner_id`.
    ///
    /// A conversation owned by someone else is reported exactly like a missing one.
    pub fn get_conversation_for_owner(&self, id: &str, owner_id: &str) -> DbResult<Conversation> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1 AND owner_id = ?2"
        ))?;

        stmt.query_row(params![id, owner_id], parse_conversation_row)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => DbError::ConversationNotFound(id.to_string()),
                other => DbError::Sqlite(other),
            })
    }

    /// List an owner's conversations that are not deleted, most recent first
    pub fn list_conversations(&self, owner_id: &str) -> DbResult<Vec<Conversation>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations
             WHERE owner_id = ?1 AND status != 'deleted'
             ORDER BY updated_at DESC"
        ))?;

        let rows = stmt.query_map(params![owner_id], parse_conversation_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Update conversation lifecycle status
    pub fn update_conversation_status(&self, id: &str, status: ConversationStatus) -> DbResult<()> {
        let conn = self.conn();
        let now = Utc::now();

        let updated = conn.execute(
            "UPDATE conversations SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), now.to_rfc3339(), id],
        )?;

        if updated == 0 {
            return Err(DbError::ConversationNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Rename a conversation
    pub fn update_conversation_title(&self, id: &str, title: &str) -> DbResult<()> {
        let conn = self.conn();
        let now = Utc::now();

        let updated = conn.execute(
            "UPDATE conversations SET title = ?1, updated_at = ?2 WHERE id = ?3",
            params![title, now.to_rfc3339(), id],
        )?;

        if updated == 0 {
            return Err(DbError::ConversationNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Point the conversation's tip at `message_id`.
    ///
    /// The message must belong to the conversation; the check and the write
    /// are one statement so a concurrent writer cannot slip in between.
    pub fn update_tip(&self, conversation_id: &str, message_id: &str) -> DbResult<()> {
        let conn = self.conn();
        update_tip_with(&conn, conversation_id, message_id)
    }

    // ==================== Message Operations ====================

    /// Get a message by its id
    pub fn get_message(&self, message_id: &str) -> DbResult<Message> {
        let conn = self.conn();
        query_message(&conn, message_id)
    }

    /// Find a message by its client-generated id within a conversation
    pub fn get_message_by_local_id(
        &self,
        conversation_id: &str,
        local_id: &str,
    ) -> DbResult<Option<Message>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = ?1 AND local_id = ?2"
        ))?;

        stmt.query_row(params![conversation_id, local_id], parse_message_row)
            .optional()
            .map_err(DbError::from)
    }

    /// Get every message of a conversation in sequence order
    pub fn get_messages(&self, conversation_id: &str) -> DbResult<Vec<Message>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = ?1 ORDER BY sequence_number ASC"
        ))?;

        let rows = stmt.query_map(params![conversation_id], parse_message_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// The first `limit` messages of a conversation in sequence order
    pub fn get_messages_limited(&self, conversation_id: &str, limit: usize) -> DbResult<Vec<Message>> {
        let conn = self.conn();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = ?1
             ORDER BY sequence_number ASC LIMIT ?2"
        ))?;

        let rows = stmt.query_map(params![conversation_id, limit], parse_message_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Walk backwards from `tip_message_id` via `previous_id` and return the
    /// chain root first.
    ///
    /// The walk stays inside the tip's conversation and is bounded by the
    /// conversation's message count, so a corrupt cycle cannot loop forever.
    pub fn get_chain_from_tip(&self, tip_message_id: &str) -> DbResult<Vec<Message>> {
        let conn = self.conn();
        let tip = query_message(&conn, tip_message_id)?;

        let max_depth: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1",
            params![tip.conversation_id],
            |row| row.get(0),
        )?;

        let mut stmt = conn.prepare(&format!(
            "WITH RECURSIVE chain(id, previous_id, depth) AS (
                 SELECT id, previous_id, 1 FROM messages WHERE id = ?1
                 UNION ALL
                 SELECT m.id, m.previous_id, chain.depth + 1
                 FROM messages m
                 INNER JOIN chain ON m.id = chain.previous_id
                 WHERE m.conversation_id = ?2 AND chain.depth < ?3
             )
             SELECT {MESSAGE_COLUMNS} FROM messages
             INNER JOIN (SELECT id AS chain_id, depth FROM chain) ON messages.id = chain_id
             ORDER BY depth DESC"
        ))?;

        let rows = stmt.query_map(
            params![tip_message_id, tip.conversation_id, max_depth],
            parse_message_row,
        )?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// All messages sharing `message_id`'s parent, the message itself included.
    ///
    /// Roots are siblings of every other root in the same conversation.
    pub fn get_siblings(&self, message_id: &str) -> DbResult<Vec<Message>> {
        let conn = self.conn();
        let message = query_message(&conn, message_id)?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE conversation_id = ?1 AND previous_id IS ?2
             ORDER BY sequence_number ASC"
        ))?;

        let rows = stmt.query_map(
            params![message.conversation_id, message.previous_id],
            parse_message_row,
        )?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Next free sequence number for a conversation
    pub fn next_sequence_number(&self, conversation_id: &str) -> DbResult<i64> {
        let conn = self.conn();
        next_sequence_with(&conn, conversation_id)
    }

    /// Whether `sequence_number` is already used in the conversation
    pub fn sequence_taken(&self, conversation_id: &str, sequence_number: i64) -> DbResult<bool> {
        let conn = self.conn();
        sequence_taken_with(&conn, conversation_id, sequence_number)
    }

    /// Insert a message and move the conversation tip to it in one transaction
    pub fn create_message_and_advance(&self, new: &NewMessage) -> DbResult<Message> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let message = insert_message_with(&tx, new)?;
        update_tip_with(&tx, &new.conversation_id, &message.id)?;

        tx.commit()?;
        Ok(message)
    }

    /// Apply one reconciled sync batch atomically.
    ///
    /// Marks `conflicts` as conflicting, inserts `creates` in order, then
    /// moves the tip if requested. Any failure rolls back the whole batch.
    pub fn apply_sync_batch(
        &self,
        conversation_id: &str,
        creates: &[NewMessage],
        conflicts: &[String],
        tip: Option<&str>,
    ) -> DbResult<Vec<Message>> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();

        for message_id in conflicts {
            let updated = tx.execute(
                "UPDATE messages SET sync_status = 'conflict', updated_at = ?1
                 WHERE id = ?2 AND conversation_id = ?3",
                params![now, message_id, conversation_id],
            )?;
            if updated == 0 {
                return Err(DbError::MessageNotFound(message_id.clone()));
            }
        }

        let mut created = Vec::with_capacity(creates.len());
        for new in creates {
            created.push(insert_message_with(&tx, new)?);
        }

        if let Some(tip) = tip {
            update_tip_with(&tx, conversation_id, tip)?;
        }

        tx.commit()?;
        Ok(created)
    }

    /// Count messages by sync status
    pub fn sync_counts(&self, conversation_id: &str) -> DbResult<SyncCounts> {
        let conn = self.conn();
        let mut counts = SyncCounts::default();

        let mut stmt = conn.prepare(
            "SELECT sync_status, COUNT(*), MAX(synced_at) FROM messages
             WHERE conversation_id = ?1 GROUP BY sync_status",
        )?;
        let rows = stmt.query_map(params![conversation_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        })?;

        for row in rows {
            let (status, count, last_synced) = row?;
            let count = u64::try_from(count).unwrap_or(0);
            match SyncStatus::parse(&status) {
                SyncStatus::Pending => counts.pending += count,
                SyncStatus::Synced => {
                    counts.synced += count;
                    counts.last_synced_at = last_synced.as_deref().map(parse_datetime);
                }
                SyncStatus::Conflict => counts.conflict += count,
            }
        }

        Ok(counts)
    }
}

fn query_conversation(conn: &Connection, id: &str) -> DbResult<Conversation> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"
    ))?;

    stmt.query_row(params![id], parse_conversation_row)
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => DbError::ConversationNotFound(id.to_string()),
            other => DbError::Sqlite(other),
        })
}

fn query_message(conn: &Connection, message_id: &str) -> DbResult<Message> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"
    ))?;

    stmt.query_row(params![message_id], parse_message_row)
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => DbError::MessageNotFound(message_id.to_string()),
            other => DbError::Sqlite(other),
        })
}

fn next_sequence_with(conn: &Connection, conversation_id: &str) -> DbResult<i64> {
    let highest: Option<i64> = conn.query_row(
        "SELECT MAX(sequence_number) FROM messages WHERE conversation_id = ?1",
        params![conversation_id],
        |row| row.get(0),
    )?;

    highest
        .unwrap_or(0)
        .checked_add(1)
        .filter(|next| *next <= MAX_SEQUENCE_NUMBER)
        .ok_or_else(|| DbError::SequenceExhausted(conversation_id.to_string()))
}

fn sequence_taken_with(conn: &Connection, conversation_id: &str, sequence_number: i64) -> DbResult<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM messages WHERE conversation_id = ?1 AND sequence_number = ?2)",
        params![conversation_id, sequence_number],
        |row| row.get(0),
    )
    .map_err(DbError::from)
}

fn insert_message_with(conn: &Connection, new: &NewMessage) -> DbResult<Message> {
    let sequence_number = match new.sequence_number {
        Some(seq) if acceptable_sequence(seq) && !sequence_taken_with(conn, &new.conversation_id, seq)? => seq,
        _ => next_sequence_with(conn, &new.conversation_id)?,
    };

    conn.execute(
        "INSERT INTO messages (id, conversation_id, sequence_number, previous_id, role, contents,
                               local_id, server_id, sync_status, synced_at, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            new.id,
            new.conversation_id,
            sequence_number,
            new.previous_id,
            new.role.as_str(),
            new.contents,
            new.local_id,
            new.server_id,
            new.sync_status.as_str(),
            new.synced_at.map(|t| t.to_rfc3339()),
            new.created_at.to_rfc3339(),
            new.updated_at.to_rfc3339(),
        ],
    )?;

    conn.execute(
        "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
        params![Utc::now().to_rfc3339(), new.conversation_id],
    )?;

    Ok(new.clone().into_message(sequence_number))
}

fn update_tip_with(conn: &Connection, conversation_id: &str, message_id: &str) -> DbResult<()> {
    let updated = conn.execute(
        "UPDATE conversations SET tip_message_id = ?1, updated_at = ?3
         WHERE id = ?2
           AND EXISTS(SELECT 1 FROM messages WHERE id = ?1 AND conversation_id = ?2)",
        params![message_id, conversation_id, Utc::now().to_rfc3339()],
    )?;

    if updated == 0 {
        // Distinguish a missing conversation from a foreign or missing message
        query_conversation(conn, conversation_id)?;
        return Err(DbError::TipRejected {
            conversation_id: conversation_id.to_string(),
            message_id: message_id.to_string(),
        });
    }
    Ok(())
}

fn parse_conversation_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        title: row.get(2)?,
        status: ConversationStatus::parse(&row.get::<_, String>(3)?),
        tip_message_id: row.get(4)?,
        created_at: parse_datetime(&row.get::<_, String>(5)?),
        updated_at: parse_datetime(&row.get::<_, String>(6)?),
    })
}

/// Parse a message row from the database
fn parse_message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let role_str: String = row.get(4)?;
    let role = MessageRole::parse(&role_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            format!("unknown message role {role_str:?}").into(),
        )
    })?;

    Ok(Message {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sequence_number: row.get(2)?,
        previous_id: row.get(3)?,
        role,
        contents: row.get(5)?,
        local_id: row.get(6)?,
        server_id: row.get(7)?,
        sync_status: SyncStatus::parse(&row.get::<_, String>(8)?),
        synced_at: row.get::<_, Option<String>>(9)?.as_deref().map(parse_datetime),
        created_at: parse_datetime(&row.get::<_, String>(10)?),
        updated_at: parse_datetime(&row.get::<_, String>(11)?),
    })
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}
