//! Tip controller: the only writer of a conversation's tip pointer

use super::sync::SyncPlan;
use super::traits::Repository;
use crate::db::{DbError, Message, NewMessage};
use crate::error::{CoreError, CoreResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Held per-conversation tip lock
///
/// Callers that read and then write (message creation, sync) keep this
/// across both steps. Released on drop.
pub struct TipLock {
    conversation_id: String,
    _guard: OwnedMutexGuard<()>,
}

impl TipLock {
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }
}

pub struct TipController<R> {
    repo: Arc<R>,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl<R: Repository> TipController<R> {
    pub fn new(repo: Arc<R>) -> Self {
        Self {
            repo,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire the keyed lock for one conversation
    pub async fn lock(&self, conversation_id: &str) -> TipLock {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            // Entries nobody holds or waits on are dropped
            locks.retain(|id, m| id == conversation_id || Arc::strong_count(m) > 1);
            locks
                .entry(conversation_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };

        TipLock {
            conversation_id: conversation_id.to_string(),
            _guard: mutex.lock_owned().await,
        }
    }

    /// Take the lock and point the tip at `message_id`
    #[cfg(test)]
    pub async fn advance(&self, conversation_id: &str, message_id: &str) -> CoreResult<()> {
        let lock = self.lock(conversation_id).await;
        self.advance_locked(&lock, message_id).await
    }

    /// Point the tip at `message_id` under an already held lock
    pub async fn advance_locked(&self, lock: &TipLock, message_id: &str) -> CoreResult<()> {
        self.repo
            .update_tip(lock.conversation_id(), message_id)
            .await
            .map_err(|e| tip_failure(lock.conversation_id(), &e))?;

        tracing::debug!(conv_id = %lock.conversation_id(), tip = %message_id, "Tip advanced");
        Ok(())
    }

    /// Insert `new` and move the tip to it atomically
    pub async fn create_and_advance(&self, lock: &TipLock, new: &NewMessage) -> CoreResult<Message> {
        if new.conversation_id != lock.conversation_id() {
            return Err(CoreError::internal(format!(
                "tip lock for {} used to write into {}",
                lock.conversation_id(),
                new.conversation_id
            )));
        }

        let message = self
            .repo
            .create_message_and_advance(new)
            .await
            .map_err(|e| tip_failure(lock.conversation_id(), &e))?;

        tracing::debug!(conv_id = %lock.conversation_id(), tip = %message.id, "Message created at tip");
        Ok(message)
    }

    /// Apply a reconciled sync plan, tip move included, atomically
    pub async fn commit_sync(&self, lock: &TipLock, plan: &SyncPlan) -> CoreResult<Vec<Message>> {
        if plan.is_empty() {
            return Ok(Vec::new());
        }

        let created = self
            .repo
            .apply_sync_batch(
                lock.conversation_id(),
                &plan.creates,
                &plan.conflicts,
                plan.tip.as_deref(),
            )
            .await
            .map_err(|e| tip_failure(lock.conversation_id(), &e))?;

        tracing::debug!(
            conv_id = %lock.conversation_id(),
            created = created.len(),
            conflicts = plan.conflicts.len(),
            tip = ?plan.tip,
            "Sync batch committed"
        );
        Ok(created)
    }
}

fn tip_failure(conversation_id: &str, e: &DbError) -> CoreError {
    tracing::warn!(conv_id = %conversation_id, error = %e, "Tip write failed");
    CoreError::internal(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::traits::{ConversationRepository, DatabaseRepository};
    use crate::db::{Database, MessageRole};
    use std::time::Duration;

    fn controller() -> (TipController<DatabaseRepository>, Arc<DatabaseRepository>) {
        let db = Database::open_in_memory().unwrap();
        db.create_conversation("c1", "alice", "").unwrap();
        db.create_conversation("c2", "alice", "").unwrap();
        let repo = Arc::new(DatabaseRepository::new(db));
        (TipController::new(repo.clone()), repo)
    }

    #[tokio::test]
    async fn advance_rejects_foreign_message_as_internal() {
        let (tips, repo) = controller();
        let lock = tips.lock("c2").await;
        let foreign = tips
            .create_and_advance(&lock, &NewMessage::new("c2", MessageRole::User, "x", None))
            .await
            .unwrap();
        drop(lock);

        let err = tips.advance("c1", &foreign.id).await.unwrap_err();
        assert!(matches!(err, CoreError::Internal(_)));
        assert!(repo.get_conversation("c1").await.unwrap().tip_message_id.is_none());

        let err = tips.advance("c1", "missing").await.unwrap_err();
        assert!(matches!(err, CoreError::Internal(_)));
    }

    #[tokio::test]
    async fn lock_is_exclusive_per_conversation() {
        let (tips, _repo) = controller();
        let tips = Arc::new(tips);

        let held = tips.lock("c1").await;

        // A different conversation is not blocked
        tokio::time::timeout(Duration::from_millis(200), tips.lock("c2"))
            .await
            .expect("other conversation must not wait");

        let waiter = {
            let tips = tips.clone();
            tokio::spawn(async move {
                let _lock = tips.lock("c1").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(held);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter acquires after release")
            .unwrap();
    }

    #[tokio::test]
    async fn mismatched_lock_is_refused() {
        let (tips, _repo) = controller();
        let lock = tips.lock("c1").await;
        let err = tips
            .create_and_advance(&lock, &NewMessage::new("c2", MessageRole::User, "x", None))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Internal(_)));
    }
}
