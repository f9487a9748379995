//! Offline sync reconciliation
//!
//! A batch of client-authored messages is turned into a [`SyncPlan`] (rows to
//! insert, rows to mark conflicting, the new tip) plus one outcome per item.
//! Planning only reads; the plan is applied in a single transaction by the
//! tip controller, so a failing write leaves nothing behind.

use super::arena::MessageArena;
use super::traits::Repository;
use crate::db::{
    acceptable_sequence, Conversation, DbError, Message, MessageRole, NewMessage, SyncStatus, MAX_SEQUENCE_NUMBER,
};
use crate::error::{CoreError, CoreResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Which created item becomes the tip after a batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TipPolicy {
    /// The last created item whose ancestry contains the running tip
    #[default]
    ExtendTip,
    /// The last created item, wherever it attaches
    LastAttached,
}

impl TipPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "extend_tip" => Some(TipPolicy::ExtendTip),
            "last_attached" => Some(TipPolicy::LastAttached),
            _ => None,
        }
    }
}

/// Client-authored message descriptor
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SyncItem {
    #[serde(default)]
    pub local_id: String,
    #[serde(default)]
    pub sequence_number: Option<i64>,
    /// Server id or local id of the parent
    #[serde(default)]
    pub previous_id: Option<String>,
    #[serde(default)]
    pub role: Option<MessageRole>,
    #[serde(default)]
    pub contents: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcomeStatus {
    Created,
    AlreadySynced,
    Conflict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictReason {
    /// Missing local id or role, or a parent that is not in this conversation
    InvalidItem,
    /// Same local id, different contents
    ContentMismatch,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncOutcome {
    pub local_id: String,
    pub status: SyncOutcomeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<ConflictReason>,
    /// The server's version of the message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
}

impl SyncOutcome {
    fn created(local_id: &str, message: Message) -> Self {
        Self {
            local_id: local_id.to_string(),
            status: SyncOutcomeStatus::Created,
            reason: None,
            message: Some(message),
        }
    }

    fn already_synced(local_id: &str, message: Message) -> Self {
        Self {
            local_id: local_id.to_string(),
            status: SyncOutcomeStatus::AlreadySynced,
            reason: None,
            message: Some(message),
        }
    }

    fn conflict(local_id: &str, reason: ConflictReason, message: Option<Message>) -> Self {
        Self {
            local_id: local_id.to_string(),
            status: SyncOutcomeStatus::Conflict,
            reason: Some(reason),
            message,
        }
    }
}

/// Result of one sync request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncReport {
    pub conversation_id: String,
    pub outcomes: Vec<SyncOutcome>,
    /// Batch completion timestamp, the client's next watermark
    pub synced_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tip_message_id: Option<String>,
}

/// Writes a batch needs, applied atomically
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncPlan {
    pub creates: Vec<NewMessage>,
    /// Stored message ids to mark as conflicting
    pub conflicts: Vec<String>,
    pub tip: Option<String>,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.conflicts.is_empty() && self.tip.is_none()
    }
}

pub struct SyncReconciler<R> {
    repo: Arc<R>,
    policy: TipPolicy,
}

impl<R: Repository> SyncReconciler<R> {
    pub fn new(repo: Arc<R>, policy: TipPolicy) -> Self {
        Self { repo, policy }
    }

    pub fn policy(&self) -> TipPolicy {
        self.policy
    }

    /// Decide every item of `items` against the current state of `conversation`.
    ///
    /// The caller must hold the conversation's tip lock and pass a
    /// conversation record read under it.
    pub async fn plan(
        &self,
        conversation: &Conversation,
        items: &[SyncItem],
        synced_at: DateTime<Utc>,
    ) -> CoreResult<(SyncPlan, Vec<SyncOutcome>)> {
        let conversation_id = conversation.id.as_str();
        let mut arena = MessageArena::from_messages(self.repo.get_messages(conversation_id).await?);

        // local id -> message id, stored and planned
        let mut by_local: HashMap<String, String> = arena
            .iter()
            .filter_map(|m| m.local_id.clone().map(|local| (local, m.id.clone())))
            .collect();

        let mut plan = SyncPlan::default();
        let mut planned: HashMap<String, usize> = HashMap::new();
        let mut conflicted: HashSet<String> = HashSet::new();
        let mut planned_seqs: HashSet<i64> = HashSet::new();
        // A full conversation can still answer items it already holds
        let mut next_seq = match self.repo.next_sequence_number(conversation_id).await {
            Err(DbError::SequenceExhausted(_)) => MAX_SEQUENCE_NUMBER.saturating_add(1),
            other => other?,
        };
        let mut running_tip = conversation.tip_message_id.clone();
        let mut outcomes = Vec::with_capacity(items.len());

        for item in items {
            let local_id = item.local_id.trim();

            let Some(role) = item.role.filter(|_| !local_id.is_empty()) else {
                tracing::debug!(conv_id = %conversation_id, local_id = %local_id, "Sync item missing local id or role");
                outcomes.push(SyncOutcome::conflict(local_id, ConflictReason::InvalidItem, None));
                continue;
            };

            // Already known: earlier in this batch, or stored
            // The earlier create in this batch wins and stays synced
            if let Some(&index) = planned.get(local_id) {
                let new = &plan.creates[index];
                let preview = new.clone().into_message(new.sequence_number.unwrap_or(0));
                if new.contents == item.contents {
                    outcomes.push(SyncOutcome::already_synced(local_id, preview));
                } else {
                    tracing::info!(conv_id = %conversation_id, local_id = %local_id, "Sync content mismatch within batch");
                    outcomes.push(SyncOutcome::conflict(local_id, ConflictReason::ContentMismatch, Some(preview)));
                }
                continue;
            }

            if let Some(existing) = by_local.get(local_id).and_then(|id| arena.get(id)).cloned() {
                if existing.contents == item.contents {
                    outcomes.push(SyncOutcome::already_synced(local_id, existing));
                } else {
                    tracing::info!(conv_id = %conversation_id, message_id = %existing.id, "Sync content mismatch");
                    if conflicted.insert(existing.id.clone()) {
                        plan.conflicts.push(existing.id.clone());
                    }
                    let mut current = existing;
                    current.sync_status = SyncStatus::Conflict;
                    current.updated_at = synced_at;
                    arena.insert(current.clone());
                    outcomes.push(SyncOutcome::conflict(local_id, ConflictReason::ContentMismatch, Some(current)));
                }
                continue;
            }

            // Resolve the parent by server id, then by local id
            let previous_id = match item.previous_id.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
                None => None,
                Some(p) if arena.contains(p) => Some(p.to_string()),
                Some(p) => match by_local.get(p) {
                    Some(id) => Some(id.clone()),
                    None => {
                        tracing::debug!(conv_id = %conversation_id, previous = %p, "Sync item parent not in conversation");
                        outcomes.push(SyncOutcome::conflict(local_id, ConflictReason::InvalidItem, None));
                        continue;
                    }
                },
            };

            let sequence_number = match item.sequence_number {
                Some(seq)
                    if acceptable_sequence(seq)
                        && !planned_seqs.contains(&seq)
                        && !self.repo.sequence_taken(conversation_id, seq).await? =>
                {
                    seq
                }
                _ if next_seq <= MAX_SEQUENCE_NUMBER => next_seq,
                _ => {
                    return Err(CoreError::Conflict(format!("conversation {conversation_id} is full")));
                }
            };
            planned_seqs.insert(sequence_number);
            next_seq = next_seq.max(sequence_number.saturating_add(1));

            let id = uuid::Uuid::new_v4().to_string();
            let created_at = item.created_at.unwrap_or(synced_at);
            let new = NewMessage {
                id: id.clone(),
                conversation_id: conversation_id.to_string(),
                sequence_number: Some(sequence_number),
                previous_id,
                role,
                contents: item.contents.clone(),
                local_id: Some(local_id.to_string()),
                server_id: Some(id.clone()),
                sync_status: SyncStatus::Synced,
                synced_at: Some(synced_at),
                created_at,
                updated_at: item.updated_at.unwrap_or(created_at),
            };

            let preview = new.clone().into_message(sequence_number);
            arena.insert(preview.clone());
            by_local.insert(local_id.to_string(), id.clone());
            planned.insert(local_id.to_string(), plan.creates.len());
            plan.creates.push(new);

            let moves_tip = match self.policy {
                TipPolicy::LastAttached => true,
                TipPolicy::ExtendTip => running_tip
                    .as_deref()
                    .map_or(true, |tip| arena.is_ancestor(tip, &id)),
            };
            if moves_tip {
                running_tip = Some(id.clone());
                plan.tip = Some(id);
            }

            outcomes.push(SyncOutcome::created(local_id, preview));
        }

        Ok((plan, outcomes))
    }
}
