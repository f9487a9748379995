//! Conversation service
//!
//! Orchestrates the message graph for each client action (send, switch
//! branch, sync, list) and publishes the resulting events.

mod arena;
mod navigator;
mod sync;
mod tip;
mod traits;

pub use navigator::GraphNavigator;
pub use sync::{SyncItem, SyncOutcomeStatus, SyncReconciler, SyncReport, TipPolicy};
pub use tip::TipController;
pub use traits::{ConversationRepository, DatabaseRepository, MessageRepository, Repository};

use crate::broadcast::{Broadcaster, ErrorKind, Event};
use crate::db::{Conversation, ConversationStatus, Message, MessageRole, NewMessage, SyncCounts};
use crate::error::{CoreError, CoreResult};
use crate::generation::{GenerationHandle, GenerationJob};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;

/// A user message as submitted over HTTP
#[derive(Debug, Clone, Default)]
pub struct SendMessage {
    pub contents: String,
    /// Parent to branch from; the current tip when absent
    pub previous_id: Option<String>,
    /// Client dedup key
    pub local_id: Option<String>,
}

/// Hard cap on messages returned by one listing
pub const MAX_MESSAGE_LIMIT: usize = 1000;

/// How a message listing is scoped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageQuery {
    /// Every message instead of the tip's chain
    pub all: bool,
    /// Applies to full listings; chains are never cut
    pub limit: usize,
}

impl Default for MessageQuery {
    fn default() -> Self {
        Self {
            all: false,
            limit: MAX_MESSAGE_LIMIT,
        }
    }
}

/// Fields to change on a conversation; absent fields are kept
#[derive(Debug, Clone, Default)]
pub struct ConversationUpdate {
    pub title: Option<String>,
    pub status: Option<ConversationStatus>,
}

pub struct ConversationService<R> {
    repo: Arc<R>,
    navigator: GraphNavigator<R>,
    tips: Arc<TipController<R>>,
    reconciler: SyncReconciler<R>,
    broadcaster: Arc<Broadcaster>,
    generation: Option<GenerationHandle>,
}

impl<R: Repository + 'static> ConversationService<R> {
    pub fn new(repo: Arc<R>, broadcaster: Arc<Broadcaster>, tip_policy: TipPolicy) -> Self {
        Self {
            navigator: GraphNavigator::new(repo.clone()),
            tips: Arc::new(TipController::new(repo.clone())),
            reconciler: SyncReconciler::new(repo.clone(), tip_policy),
            repo,
            broadcaster,
            generation: None,
        }
    }

    /// Hand every sent message to the generation queue
    #[must_use]
    pub fn with_generation(mut self, handle: GenerationHandle) -> Self {
        self.generation = Some(handle);
        self
    }

    pub fn repo(&self) -> Arc<R> {
        self.repo.clone()
    }

    /// The tip controller; background writers must share it
    pub fn tips(&self) -> Arc<TipController<R>> {
        self.tips.clone()
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    // ==================== Lifecycle ====================

    pub async fn create_conversation(&self, owner_id: &str, title: &str) -> CoreResult<Conversation> {
        let id = uuid::Uuid::new_v4().to_string();
        let conversation = self.repo.create_conversation(&id, owner_id, title.trim()).await?;
        tracing::info!(conv_id = %conversation.id, owner = %owner_id, "Conversation created");
        Ok(conversation)
    }

    pub async fn list_conversations(&self, owner_id: &str) -> CoreResult<Vec<Conversation>> {
        Ok(self.repo.list_conversations(owner_id).await?)
    }

    /// Owner-scoped lookup; deleted conversations read as missing
    pub async fn get_conversation(&self, owner_id: &str, conversation_id: &str) -> CoreResult<Conversation> {
        let conversation = self
            .repo
            .get_conversation_for_owner(conversation_id, owner_id)
            .await?;
        if conversation.status == ConversationStatus::Deleted {
            return Err(CoreError::not_found(format!("conversation {conversation_id}")));
        }
        Ok(conversation)
    }

    pub async fn set_status(
        &self,
        owner_id: &str,
        conversation_id: &str,
        status: ConversationStatus,
    ) -> CoreResult<Conversation> {
        let mut conversation = self.get_conversation(owner_id, conversation_id).await?;
        if !conversation.status.can_transition_to(status) {
            return Err(CoreError::validation(format!(
                "cannot move conversation from {} to {status}",
                conversation.status
            )));
        }

        self.repo.update_conversation_status(conversation_id, status).await?;
        tracing::info!(conv_id = %conversation_id, from = %conversation.status, to = %status, "Conversation status changed");
        conversation.status = status;
        Ok(conversation)
    }

    /// Rename a conversation and/or move it between active and archived
    pub async fn update_conversation(
        &self,
        owner_id: &str,
        conversation_id: &str,
        update: ConversationUpdate,
    ) -> CoreResult<Conversation> {
        if update.status == Some(ConversationStatus::Deleted) {
            return Err(CoreError::validation("status must be active or archived"));
        }

        let current = self.get_conversation(owner_id, conversation_id).await?;
        if let Some(status) = update.status.filter(|s| *s != current.status) {
            self.set_status(owner_id, conversation_id, status).await?;
        }
        if let Some(title) = update.title {
            self.repo.update_conversation_title(conversation_id, title.trim()).await?;
            tracing::info!(conv_id = %conversation_id, "Conversation renamed");
        }

        Ok(self.repo.get_conversation(conversation_id).await?)
    }

    /// Owner-scoped lookup that also requires an active conversation
    pub async fn active_conversation(&self, owner_id: &str, conversation_id: &str) -> CoreResult<Conversation> {
        let conversation = self.get_conversation(owner_id, conversation_id).await?;
        if !conversation.is_active() {
            return Err(CoreError::validation(format!(
                "conversation {conversation_id} is {}",
                conversation.status
            )));
        }
        Ok(conversation)
    }

    // ==================== Messages ====================

    /// The visible transcript, or every message in sequence order when
    /// `query.all` is set or no tip exists yet
    pub async fn list_messages(
        &self,
        owner_id: &str,
        conversation_id: &str,
        query: MessageQuery,
    ) -> CoreResult<Vec<Message>> {
        if query.limit == 0 {
            return Err(CoreError::validation("limit must be positive"));
        }
        let conversation = self.get_conversation(owner_id, conversation_id).await?;
        if query.all || conversation.tip_message_id.is_none() {
            let limit = query.limit.min(MAX_MESSAGE_LIMIT);
            return Ok(self.repo.get_messages_limited(conversation_id, limit).await?);
        }
        self.navigator.chain_from_tip(&conversation).await
    }

    /// One message, if its conversation belongs to the caller
    pub async fn get_message(&self, owner_id: &str, message_id: &str) -> CoreResult<Message> {
        let message = self.repo.get_message(message_id).await?;
        // Hide messages of conversations the caller does not own
        self.get_conversation(owner_id, &message.conversation_id)
            .await
            .map_err(|_| CoreError::not_found(format!("message {message_id}")))?;
        Ok(message)
    }

    /// Store a user message, move the tip to it and queue a reply.
    ///
    /// Idempotent on `local_id`: resending identical contents returns the
    /// stored message without side effects.
    pub async fn send_message(&self, owner_id: &str, conversation_id: &str, send: SendMessage) -> CoreResult<Message> {
        if send.contents.trim().is_empty() {
            return Err(CoreError::validation("message contents are empty"));
        }
        self.active_conversation(owner_id, conversation_id).await?;

        let local_id = send.local_id.as_deref().map(str::trim).filter(|l| !l.is_empty());
        let explicit_parent = send.previous_id.as_deref().filter(|p| !p.is_empty());
        if let Some(parent) = explicit_parent {
            self.navigator.validate_branch_target(conversation_id, parent).await?;
        }

        let lock = self.tips.lock(conversation_id).await;

        if let Some(local_id) = local_id {
            if let Some(existing) = self.repo.get_message_by_local_id(conversation_id, local_id).await? {
                if existing.contents == send.contents {
                    tracing::debug!(conv_id = %conversation_id, local_id = %local_id, "Duplicate send ignored");
                    return Ok(existing);
                }
                return Err(CoreError::Conflict(format!(
                    "local id {local_id} already used with different contents"
                )));
            }
        }

        let previous_id = match explicit_parent {
            Some(parent) => Some(parent.to_string()),
            None => self.repo.get_conversation(conversation_id).await?.tip_message_id,
        };

        let new = NewMessage::new(conversation_id, MessageRole::User, send.contents, previous_id)
            .with_local_id(local_id.map(String::from));
        let message = self.tips.create_and_advance(&lock, &new).await?;

        self.publish_message_and_tip(&message);
        drop(lock);

        tracing::info!(conv_id = %conversation_id, message_id = %message.id, "User message stored");
        self.request_generation(&message);
        Ok(message)
    }

    /// Make `tip_message_id` the head of the visible transcript
    pub async fn switch_branch(
        &self,
        owner_id: &str,
        conversation_id: &str,
        tip_message_id: &str,
    ) -> CoreResult<Vec<Message>> {
        self.active_conversation(owner_id, conversation_id).await?;
        self.navigator
            .validate_branch_target(conversation_id, tip_message_id)
            .await?;

        let lock = self.tips.lock(conversation_id).await;
        self.tips.advance_locked(&lock, tip_message_id).await?;
        self.broadcaster.publish(
            conversation_id,
            Event::Tip {
                conversation_id: conversation_id.to_string(),
                tip_message_id: tip_message_id.to_string(),
            },
        );
        drop(lock);

        tracing::info!(conv_id = %conversation_id, tip = %tip_message_id, "Branch switched");
        self.navigator.chain_to(conversation_id, tip_message_id).await
    }

    /// Alternatives to `message_id` at the same point in the tree
    pub async fn siblings(&self, owner_id: &str, message_id: &str) -> CoreResult<Vec<Message>> {
        self.get_message(owner_id, message_id).await?;
        self.navigator.siblings(message_id).await
    }

    // ==================== Sync ====================

    /// Reconcile a batch of offline-authored messages
    pub async fn sync(&self, owner_id: &str, conversation_id: &str, items: &[SyncItem]) -> CoreResult<SyncReport> {
        self.active_conversation(owner_id, conversation_id).await?;

        let lock = self.tips.lock(conversation_id).await;
        let conversation = self.repo.get_conversation(conversation_id).await?;
        let synced_at = Utc::now();

        let (plan, mut outcomes) = self.reconciler.plan(&conversation, items, synced_at).await?;
        let created = self.tips.commit_sync(&lock, &plan).await?;

        // Report what was actually stored
        let stored: HashMap<&str, &Message> = created.iter().map(|m| (m.id.as_str(), m)).collect();
        for outcome in &mut outcomes {
            if let Some(message) = outcome.message.as_mut() {
                if let Some(saved) = stored.get(message.id.as_str()) {
                    *message = (*saved).clone();
                }
            }
        }

        if !created.is_empty() {
            self.broadcaster.publish(
                conversation_id,
                Event::Sync {
                    conversation_id: conversation_id.to_string(),
                    synced_at,
                    created: created.clone(),
                },
            );
        }
        if let Some(tip) = &plan.tip {
            self.broadcaster.publish(
                conversation_id,
                Event::Tip {
                    conversation_id: conversation_id.to_string(),
                    tip_message_id: tip.clone(),
                },
            );
        }
        drop(lock);

        tracing::info!(
            conv_id = %conversation_id,
            items = items.len(),
            created = created.len(),
            policy = ?self.reconciler.policy(),
            conflicts = outcomes.iter().filter(|o| o.status == SyncOutcomeStatus::Conflict).count(),
            "Sync batch reconciled"
        );

        Ok(SyncReport {
            conversation_id: conversation_id.to_string(),
            outcomes,
            synced_at,
            tip_message_id: plan.tip,
        })
    }

    pub async fn sync_status(&self, owner_id: &str, conversation_id: &str) -> CoreResult<SyncCounts> {
        self.get_conversation(owner_id, conversation_id).await?;
        Ok(self.repo.sync_counts(conversation_id).await?)
    }

    // ==================== Events ====================

    fn publish_message_and_tip(&self, message: &Message) {
        self.broadcaster.publish(
            &message.conversation_id,
            Event::Message {
                message: message.clone(),
            },
        );
        self.broadcaster.publish(
            &message.conversation_id,
            Event::Tip {
                conversation_id: message.conversation_id.clone(),
                tip_message_id: message.id.clone(),
            },
        );
    }

    fn request_generation(&self, message: &Message) {
        let Some(generation) = &self.generation else {
            return;
        };

        let job = GenerationJob {
            conversation_id: message.conversation_id.clone(),
            trigger_message_id: message.id.clone(),
        };
        if let Err(e) = generation.submit(job) {
            tracing::warn!(conv_id = %message.conversation_id, error = %e, "Generation not queued");
            self.broadcaster.publish(
                &message.conversation_id,
                Event::error(ErrorKind::GenerationFailed, e.to_string()),
            );
        }
    }
}
