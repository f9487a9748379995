//! Read-only navigation over the message tree

use super::traits::Repository;
use crate::db::{Conversation, Message};
use crate::error::{CoreError, CoreResult};
use std::sync::Arc;

pub struct GraphNavigator<R> {
    repo: Arc<R>,
}

impl<R: Repository> GraphNavigator<R> {
    pub fn new(repo: Arc<R>) -> Self {
        Self { repo }
    }

    /// The visible transcript: root first, tip last. Empty when no tip is set.
    pub async fn chain_from_tip(&self, conversation: &Conversation) -> CoreResult<Vec<Message>> {
        match conversation.tip_message_id.as_deref() {
            Some(tip) => self.chain_to(&conversation.id, tip).await,
            None => Ok(Vec::new()),
        }
    }

    /// Root-first chain ending at `message_id`
    pub async fn chain_to(&self, conversation_id: &str, message_id: &str) -> CoreResult<Vec<Message>> {
        let chain = self.repo.get_chain_from_tip(message_id).await?;

        let reaches_root = chain.first().is_some_and(Message::is_root);
        let ends_at_target = chain.last().is_some_and(|m| m.id == message_id);
        let same_conversation = chain.iter().all(|m| m.conversation_id == conversation_id);

        if !(reaches_root && ends_at_target && same_conversation) {
            return Err(CoreError::not_found(format!(
                "chain from {message_id} in conversation {conversation_id}"
            )));
        }
        Ok(chain)
    }

    /// Messages sharing `message_id`'s parent, itself included, by sequence number
    pub async fn siblings(&self, message_id: &str) -> CoreResult<Vec<Message>> {
        Ok(self.repo.get_siblings(message_id).await?)
    }

    /// Check that `candidate_id` may become the tip of `conversation_id`
    pub async fn validate_branch_target(&self, conversation_id: &str, candidate_id: &str) -> CoreResult<Message> {
        let candidate = self.repo.get_message(candidate_id).await?;
        if candidate.conversation_id != conversation_id {
            return Err(CoreError::validation(format!(
                "message {candidate_id} does not belong to conversation {conversation_id}"
            )));
        }
        Ok(candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::traits::{ConversationRepository, DatabaseRepository};
    use crate::db::{Database, MessageRole, NewMessage};

    async fn setup() -> (GraphNavigator<DatabaseRepository>, Arc<DatabaseRepository>) {
        let db = Database::open_in_memory().unwrap();
        db.create_conversation("c1", "alice", "").unwrap();
        db.create_conversation("c2", "alice", "").unwrap();
        for (conv, id, prev) in [
            ("c1", "a", None),
            ("c1", "b", Some("a")),
            ("c1", "c", Some("a")),
            ("c2", "x", None),
        ] {
            let mut new = NewMessage::new(conv, MessageRole::User, id, prev.map(String::from));
            new.id = id.to_string();
            db.create_message_and_advance(&new).unwrap();
        }
        let repo = Arc::new(DatabaseRepository::new(db));
        (GraphNavigator::new(repo.clone()), repo)
    }

    #[tokio::test]
    async fn chain_ends_at_tip() {
        let (nav, repo) = setup().await;
        let conv = repo.get_conversation("c1").await.unwrap();
        let chain = nav.chain_from_tip(&conv).await.unwrap();
        let ids: Vec<_> = chain.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn empty_without_tip_and_not_found_when_dangling() {
        let (nav, repo) = setup().await;
        let mut conv = repo.create_conversation("c3", "alice", "").await.unwrap();
        assert!(nav.chain_from_tip(&conv).await.unwrap().is_empty());

        conv.tip_message_id = Some("ghost".into());
        assert!(matches!(nav.chain_from_tip(&conv).await, Err(CoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn branch_target_checks() {
        let (nav, _repo) = setup().await;
        assert!(nav.validate_branch_target("c1", "b").await.is_ok());
        assert!(matches!(
            nav.validate_branch_target("c1", "x").await,
            Err(CoreError::Validation(_))
        ));
        assert!(matches!(
            nav.validate_branch_target("c1", "nope").await,
            Err(CoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn siblings_of_branch() {
        let (nav, _repo) = setup().await;
        let ids: Vec<_> = nav.siblings("b").await.unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert!(matches!(nav.siblings("nope").await, Err(CoreError::NotFound(_))));
    }
}
