//! Mock implementations for testing
//!
//! A scripted response engine, a queue-backed endpoint that records what it
//! receives, and a repository wrapper that can fail writes on demand.

use crate::broadcast::{outbound_queue, Delivery, DeliveryStatus, Endpoint, OutboundQueue, QueueReceiver};
use crate::conversation::{ConversationRepository, DatabaseRepository, MessageRepository};
use crate::db::{Conversation, ConversationStatus, DbError, DbResult, Message, NewMessage, SyncCounts};
use crate::generation::{GenerationError, GenerationRequest, ResponseEngine};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

// ============================================================================
// Mock Response Engine
// ============================================================================

/// One scripted engine reaction
pub enum EngineScript {
    Reply(String),
    Empty,
    Fail(GenerationError),
    Panic,
    /// Never completes
    Hang,
}

/// Engine that plays back a script, one entry per call
pub struct MockEngine {
    script: Mutex<VecDeque<EngineScript>>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl MockEngine {
    pub fn new(script: Vec<EngineScript>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn recorded_requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResponseEngine for MockEngine {
    async fn generate(&self, request: &GenerationRequest) -> Result<Option<String>, GenerationError> {
        self.requests.lock().unwrap().push(request.clone());
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(EngineScript::Reply(text)) => Ok(Some(text)),
            Some(EngineScript::Empty) => Ok(None),
            Some(EngineScript::Fail(e)) => Err(e),
            Some(EngineScript::Panic) => panic!("scripted engine panic"),
            Some(EngineScript::Hang) => std::future::pending().await,
            None => Err(GenerationError::unknown("No mock response queued")),
        }
    }
}

// ============================================================================
// Recording Endpoint
// ============================================================================

/// Endpoint backed by an outbound queue; text-only endpoints ignore raw payloads
pub struct RecordingEndpoint {
    queue: OutboundQueue,
    binary: bool,
}

impl RecordingEndpoint {
    pub fn new(binary: bool, capacity: usize) -> (Arc<Self>, QueueReceiver) {
        let (queue, rx) = outbound_queue(capacity);
        (Arc::new(Self { queue, binary }), rx)
    }
}

impl Endpoint for RecordingEndpoint {
    fn deliver(&self, delivery: &Delivery) -> DeliveryStatus {
        if matches!(delivery, Delivery::Raw(_)) && !self.binary {
            return DeliveryStatus::Ignored;
        }
        self.queue.push(delivery.clone())
    }

    fn close(&self) {
        self.queue.close();
    }
}

// ============================================================================
// Failing Repository
// ============================================================================

/// Database repository whose writes can be made to fail
pub struct FailingRepository {
    inner: DatabaseRepository,
    fail_writes: AtomicBool,
}

impl FailingRepository {
    pub fn new(inner: DatabaseRepository) -> Self {
        Self {
            inner,
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_write(&self) -> DbResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(DbError::Unavailable("injected write failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ConversationRepository for FailingRepository {
    async fn create_conversation(&self, id: &str, owner_id: &str, title: &str) -> DbResult<Conversation> {
        self.check_write()?;
        self.inner.create_conversation(id, owner_id, title).await
    }

    async fn get_conversation(&self, id: &str) -> DbResult<Conversation> {
        self.inner.get_conversation(id).await
    }

    async fn get_conversation_for_owner(&self, id: &str, owner_id: &str) -> DbResult<Conversation> {
        self.inner.get_conversation_for_owner(id, owner_id).await
    }

    async fn list_conversations(&self, owner_id: &str) -> DbResult<Vec<Conversation>> {
        self.inner.list_conversations(owner_id).await
    }

    async fn update_conversation_status(&self, id: &str, status: ConversationStatus) -> DbResult<()> {
        self.check_write()?;
        self.inner.update_conversation_status(id, status).await
    }

    async fn update_conversation_title(&self, id: &str, title: &str) -> DbResult<()> {
        self.check_write()?;
        self.inner.update_conversation_title(id, title).await
    }

    async fn update_tip(&self, conversation_id: &str, message_id: &str) -> DbResult<()> {
        self.check_write()?;
        self.inner.update_tip(conversation_id, message_id).await
    }
}

#[async_trait]
impl MessageRepository for FailingRepository {
    async fn get_message(&self, message_id: &str) -> DbResult<Message> {
        self.inner.get_message(message_id).await
    }

    async fn get_message_by_local_id(&self, conversation_id: &str, local_id: &str) -> DbResult<Option<Message>> {
        self.inner.get_message_by_local_id(conversation_id, local_id).await
    }

    async fn get_messages(&self, conversation_id: &str) -> DbResult<Vec<Message>> {
        self.inner.get_messages(conversation_id).await
    }

    async fn get_messages_limited(&self, conversation_id: &str, limit: usize) -> DbResult<Vec<Message>> {
        self.inner.get_messages_limited(conversation_id, limit).await
    }

    async fn get_chain_from_tip(&self, tip_message_id: &str) -> DbResult<Vec<Message>> {
        self.inner.get_chain_from_tip(tip_message_id).await
    }

    async fn get_siblings(&self, message_id: &str) -> DbResult<Vec<Message>> {
        self.inner.get_siblings(message_id).await
    }

    async fn next_sequence_number(&self, conversation_id: &str) -> DbResult<i64> {
        self.inner.next_sequence_number(conversation_id).await
    }

    async fn sequence_taken(&self, conversation_id: &str, sequence_number: i64) -> DbResult<bool> {
        self.inner.sequence_taken(conversation_id, sequence_number).await
    }

    async fn create_message_and_advance(&self, new: &NewMessage) -> DbResult<Message> {
        self.check_write()?;
        self.inner.create_message_and_advance(new).await
    }

    async fn apply_sync_batch(
        &self,
        conversation_id: &str,
        creates: &[NewMessage],
        conflicts: &[String],
        tip: Option<&str>,
    ) -> DbResult<Vec<Message>> {
        self.check_write()?;
        self.inner
            .apply_sync_batch(conversation_id, creates, conflicts, tip)
            .await
    }

    async fn sync_counts(&self, conversation_id: &str) -> DbResult<SyncCounts> {
        self.inner.sync_counts(conversation_id).await
    }
}
