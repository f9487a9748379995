//! Repository contracts for the conversation core
//!
//! The service, navigator and tip controller only see these traits, so tests
//! can wrap the real database with fault injection.

use crate::db::{
    Conversation, ConversationStatus, Database, DbResult, Message, NewMessage, SyncCounts,
};
use async_trait::async_trait;
use std::sync::Arc;

/// Conversation records and their tip pointer
#[async_trait]
pub trait ConversationRepository: Send + Sync {
    async fn create_conversation(&self, id: &str, owner_id: &str, title: &str) -> DbResult<Conversation>;

    /// Unscoped lookup, for background work that already holds a validated id
    async fn get_conversation(&self, id: &str) -> DbResult<Conversation>;

    /// Lookup scoped to `owner_id`; foreign conversations read as missing
    async fn get_conversation_for_owner(&self, id: &str, owner_id: &str) -> DbResult<Conversation>;

    async fn list_conversations(&self, owner_id: &str) -> DbResult<Vec<Conversation>>;

    async fn update_conversation_status(&self, id: &str, status: ConversationStatus) -> DbResult<()>;

    async fn update_conversation_title(&self, id: &str, title: &str) -> DbResult<()>;

    /// Ownership-checked tip write
    async fn update_tip(&self, conversation_id: &str, message_id: &str) -> DbResult<()>;
}

/// The message tree
#[async_trait]
pub trait MessageRepository: Send + Sync {
    async fn get_message(&self, message_id: &str) -> DbResult<Message>;

    async fn get_message_by_local_id(&self, conversation_id: &str, local_id: &str) -> DbResult<Option<Message>>;

    async fn get_messages(&self, conversation_id: &str) -> DbResult<Vec<Message>>;

    /// The first `limit` messages in sequence order
    async fn get_messages_limited(&self, conversation_id: &str, limit: usize) -> DbResult<Vec<Message>>;

    /// Root-first chain ending at `tip_message_id`
    async fn get_chain_from_tip(&self, tip_message_id: &str) -> DbResult<Vec<Message>>;

    async fn get_siblings(&self, message_id: &str) -> DbResult<Vec<Message>>;

    async fn next_sequence_number(&self, conversation_id: &str) -> DbResult<i64>;

    async fn sequence_taken(&self, conversation_id: &str, sequence_number: i64) -> DbResult<bool>;

    /// Insert and move the tip in one transaction
    async fn create_message_and_advance(&self, new: &NewMessage) -> DbResult<Message>;

    /// Apply conflict marks, inserts and an optional tip move in one transaction
    async fn apply_sync_batch(
        &self,
        conversation_id: &str,
        creates: &[NewMessage],
        conflicts: &[String],
        tip: Option<&str>,
    ) -> DbResult<Vec<Message>>;

    async fn sync_counts(&self, conversation_id: &str) -> DbResult<SyncCounts>;
}

/// Combined repository trait for convenience
pub trait Repository: ConversationRepository + MessageRepository {}
impl<T: ConversationRepository + MessageRepository> Repository for T {}

// ============================================================================
// Arc implementations for trait objects
// ============================================================================

#[async_trait]
impl<T: ConversationRepository + ?Sized> ConversationRepository for Arc<T> {
    async fn create_conversation(&self, id: &str, owner_id: &str, title: &str) -> DbResult<Conversation> {
        (**self).create_conversation(id, owner_id, title).await
    }

    async fn get_conversation(&self, id: &str) -> DbResult<Conversation> {
        (**self).get_conversation(id).await
    }

    async fn get_conversation_for_owner(&self, id: &str, owner_id: &str) -> DbResult<Conversation> {
        (**self).get_conversation_for_owner(id, owner_id).await
    }

    async fn list_conversations(&self, owner_id: &str) -> DbResult<Vec<Conversation>> {
        (**self).list_conversations(owner_id).await
    }

    async fn update_conversation_status(&self, id: &str, status: ConversationStatus) -> DbResult<()> {
        (**self).update_conversation_status(id, status).await
    }

    async fn update_conversation_title(&self, id: &str, title: &str) -> DbResult<()> {
        (**self).update_conversation_title(id, title).await
    }

    async fn update_tip(&self, conversation_id: &str, message_id: &str) -> DbResult<()> {
        (**self).update_tip(conversation_id, message_id).await
    }
}

#[async_trait]
impl<T: MessageRepository + ?Sized> MessageRepository for Arc<T> {
    async fn get_message(&self, message_id: &str) -> DbResult<Message> {
        (**self).get_message(message_id).await
    }

    async fn get_message_by_local_id(&self, conversation_id: &str, local_id: &str) -> DbResult<Option<Message>> {
        (**self).get_message_by_local_id(conversation_id, local_id).await
    }

    async fn get_messages(&self, conversation_id: &str) -> DbResult<Vec<Message>> {
        (**self).get_messages(conversation_id).await
    }

    async fn get_messages_limited(&self, conversation_id: &str, limit: usize) -> DbResult<Vec<Message>> {
        (**self).get_messages_limited(conversation_id, limit).await
    }

    async fn get_chain_from_tip(&self, tip_message_id: &str) -> DbResult<Vec<Message>> {
        (**self).get_chain_from_tip(tip_message_id).await
    }

    async fn get_siblings(&self, message_id: &str) -> DbResult<Vec<Message>> {
        (**self).get_siblings(message_id).await
    }

    async fn next_sequence_number(&self, conversation_id: &str) -> DbResult<i64> {
        (**self).next_sequence_number(conversation_id).await
    }

    async fn sequence_taken(&self, conversation_id: &str, sequence_number: i64) -> DbResult<bool> {
        (**self).sequence_taken(conversation_id, sequence_number).await
    }

    async fn create_message_and_advance(&self, new: &NewMessage) -> DbResult<Message> {
        (**self).create_message_and_advance(new).await
    }

    async fn apply_sync_batch(
        &self,
        conversation_id: &str,
        creates: &[NewMessage],
        conflicts: &[String],
        tip: Option<&str>,
    ) -> DbResult<Vec<Message>> {
        (**self).apply_sync_batch(conversation_id, creates, conflicts, tip).await
    }

    async fn sync_counts(&self, conversation_id: &str) -> DbResult<SyncCounts> {
        (**self).sync_counts(conversation_id).await
    }
}

// ============================================================================
// Production Adapter
// ============================================================================

/// Adapter to use Database as a Repository
#[derive(Clone)]
pub struct DatabaseRepository {
    db: Database,
}

impl DatabaseRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[allow(dead_code)] // Useful for tests
    pub fn inner(&self) -> &Database {
        &self.db
    }
}

#[async_trait]
impl ConversationRepository for DatabaseRepository {
    async fn create_conversation(&self, id: &str, owner_id: &str, title: &str) -> DbResult<Conversation> {
        self.db.create_conversation(id, owner_id, title)
    }

    async fn get_conversation(&self, id: &str) -> DbResult<Conversation> {
        self.db.get_conversation(id)
    }

    async fn get_conversation_for_owner(&self, id: &str, owner_id: &str) -> DbResult<Conversation> {
        self.db.get_conversation_for_owner(id, owner_id)
    }

    async fn list_conversations(&self, owner_id: &str) -> DbResult<Vec<Conversation>> {
        self.db.list_conversations(owner_id)
    }

    async fn update_conversation_status(&self, id: &str, status: ConversationStatus) -> DbResult<()> {
        self.db.update_conversation_status(id, status)
    }

    async fn update_conversation_title(&self, id: &str, title: &str) -> DbResult<()> {
        self.db.update_conversation_title(id, title)
    }

    async fn update_tip(&self, conversation_id: &str, message_id: &str) -> DbResult<()> {
        self.db.update_tip(conversation_id, message_id)
    }
}

#[async_trait]
impl MessageRepository for DatabaseRepository {
    async fn get_message(&self, message_id: &str) -> DbResult<Message> {
        self.db.get_message(message_id)
    }

    async fn get_message_by_local_id(&self, conversation_id: &str, local_id: &str) -> DbResult<Option<Message>> {
        self.db.get_message_by_local_id(conversation_id, local_id)
    }

    async fn get_messages(&self, conversation_id: &str) -> DbResult<Vec<Message>> {
        self.db.get_messages(conversation_id)
    }

    async fn get_messages_limited(&self, conversation_id: &str, limit: usize) -> DbResult<Vec<Message>> {
        self.db.get_messages_limited(conversation_id, limit)
    }

    async fn get_chain_from_tip(&self, tip_message_id: &str) -> DbResult<Vec<Message>> {
        self.db.get_chain_from_tip(tip_message_id)
    }

    async fn get_siblings(&self, message_id: &str) -> DbResult<Vec<Message>> {
        self.db.get_siblings(message_id)
    }

    async fn next_sequence_number(&self, conversation_id: &str) -> DbResult<i64> {
        self.db.next_sequence_number(conversation_id)
    }

    async fn sequence_taken(&self, conversation_id: &str, sequence_number: i64) -> DbResult<bool> {
        self.db.sequence_taken(conversation_id, sequence_number)
    }

    async fn create_message_and_advance(&self, new: &NewMessage) -> DbResult<Message> {
        self.db.create_message_and_advance(new)
    }

    async fn apply_sync_batch(
        &self,
        conversation_id: &str,
        creates: &[NewMessage],
        conflicts: &[String],
        tip: Option<&str>,
    ) -> DbResult<Vec<Message>> {
        self.db.apply_sync_batch(conversation_id, creates, conflicts, tip)
    }

    async fn sync_counts(&self, conversation_id: &str) -> DbResult<SyncCounts> {
        self.db.sync_counts(conversation_id)
    }
}
