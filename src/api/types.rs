//! API request and response types

use crate::conversation::SyncItem;
use crate::db::{Conversation, ConversationStatus, Message, SyncCounts};
use serde::{Deserialize, Serialize};

/// Request to create a new conversation
#[derive(Debug, Default, Deserialize)]
pub struct CreateConversationRequest {
    #[serde(default)]
    pub title: String,
}

/// Partial conversation update; absent fields are kept
#[derive(Debug, Default, Deserialize)]
pub struct UpdateConversationRequest {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub status: Option<ConversationStatus>,
}

/// Query string of the message listing
#[derive(Debug, Default, Deserialize)]
pub struct ListMessagesParams {
    /// Every message, side branches included, instead of the tip's chain
    #[serde(default)]
    pub all: bool,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Request to send a user message
#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub contents: String,
    #[serde(default)]
    pub previous_id: Option<String>,
    #[serde(default)]
    pub local_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SwitchBranchRequest {
    pub tip_message_id: String,
}

/// Batch of offline-authored messages
#[derive(Debug, Deserialize)]
pub struct SyncRequest {
    #[serde(default)]
    pub messages: Vec<SyncItem>,
}

#[derive(Debug, Serialize)]
pub struct ConversationListResponse {
    pub conversations: Vec<Conversation>,
}

#[derive(Debug, Serialize)]
pub struct ConversationResponse {
    pub conversation: Conversation,
}

/// The visible transcript of a conversation
#[derive(Debug, Serialize)]
pub struct MessagesResponse {
    pub conversation_id: String,
    pub tip_message_id: Option<String>,
    pub messages: Vec<Message>,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: Message,
}

#[derive(Debug, Serialize)]
pub struct SiblingsResponse {
    pub message_id: String,
    pub siblings: Vec<Message>,
}

#[derive(Debug, Serialize)]
pub struct SyncStatusResponse {
    pub conversation_id: String,
    #[serde(flatten)]
    pub counts: SyncCounts,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self { error: error.into() }
    }
}
