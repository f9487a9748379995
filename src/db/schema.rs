//! Database schema and types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// SQL schema for initialization
pub const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    title TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL DEFAULT 'active',
    tip_message_id TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_conversations_owner ON conversations(owner_id, updated_at DESC);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL,
    sequence_number INTEGER NOT NULL,
    previous_id TEXT,
    role TEXT NOT NULL,
    contents TEXT NOT NULL,
    local_id TEXT,
    server_id TEXT,
    sync_status TEXT NOT NULL DEFAULT 'synced',
    synced_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,

    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE,
    UNIQUE (conversation_id, sequence_number),
    UNIQUE (conversation_id, local_id)
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, sequence_number);
CREATE INDEX IF NOT EXISTS idx_messages_previous ON messages(conversation_id, previous_id);
";

/// Conversation lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Active,
    Archived,
    Deleted,
}

impl ConversationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ConversationStatus::Active => "active",
            ConversationStatus::Archived => "archived",
            ConversationStatus::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "archived" => ConversationStatus::Archived,
            "deleted" => ConversationStatus::Deleted,
            _ => ConversationStatus::Active,
        }
    }

    /// Deleted is terminal; everything else may move between active and archived.
    pub fn can_transition_to(self, next: ConversationStatus) -> bool {
        match (self, next) {
            (ConversationStatus::Deleted, _) => false,
            (ConversationStatus::Active, ConversationStatus::Archived)
            | (ConversationStatus::Archived, ConversationStatus::Active)
            | (_, ConversationStatus::Deleted) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Conversation record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conversation {
    pub id: String,
    pub owner_id: String,
    pub title: String,
    pub status: ConversationStatus,
    /// Message currently considered the head of the visible transcript
    pub tip_message_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn is_active(&self) -> bool {
        self.status == ConversationStatus::Active
    }
}

/// Message author
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(MessageRole::User),
            "assistant" => Some(MessageRole::Assistant),
            "system" => Some(MessageRole::System),
            _ => None,
        }
    }
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Offline sync state of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    Synced,
    Conflict,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Synced => "synced",
            SyncStatus::Conflict => "conflict",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "pending" => SyncStatus::Pending,
            "conflict" => SyncStatus::Conflict,
            _ => SyncStatus::Synced,
        }
    }
}

/// Message record
///
/// `previous_id` is a key into the same conversation's messages, never an
/// owning reference; the tree is reconstructed by lookup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sequence_number: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_id: Option<String>,
    pub role: MessageRole,
    pub contents: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    pub sync_status: SyncStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    pub fn is_root(&self) -> bool {
        self.previous_id.is_none()
    }
}

/// Insert descriptor for a new message
///
/// A `sequence_number` of `None`, or one already used in the conversation,
/// is replaced by the next free number at insert time.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub id: String,
    pub conversation_id: String,
    pub sequence_number: Option<i64>,
    pub previous_id: Option<String>,
    pub role: MessageRole,
    pub contents: String,
    pub local_id: Option<String>,
    pub server_id: Option<String>,
    pub sync_status: SyncStatus,
    pub synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NewMessage {
    /// A server-authored message with a fresh id, stamped now
    pub fn new(
        conversation_id: &str,
        role: MessageRole,
        contents: impl Into<String>,
        previous_id: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            sequence_number: None,
            previous_id,
            role,
            contents: contents.into(),
            local_id: None,
            server_id: None,
            sync_status: SyncStatus::Synced,
            synced_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn with_local_id(mut self, local_id: Option<String>) -> Self {
        self.local_id = local_id;
        self
    }

    /// The record this descriptor becomes once stored under `sequence_number`
    pub fn into_message(self, sequence_number: i64) -> Message {
        Message {
            id: self.id,
            conversation_id: self.conversation_id,
            sequence_number,
            previous_id: self.previous_id,
            role: self.role,
            contents: self.contents,
            local_id: self.local_id,
            server_id: self.server_id,
            sync_status: self.sync_status,
            synced_at: self.synced_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Per-status message counts for a conversation
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct SyncCounts {
    pub pending: u64,
    pub synced: u64,
    pub conflict: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_synced_at: Option<DateTime<Utc>>,
}
