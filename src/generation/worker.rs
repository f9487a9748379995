//! Generation job queue and worker pool

use super::{GenerationError, GenerationRequest, ResponseEngine};
use crate::broadcast::{Broadcaster, ErrorKind, Event};
use crate::conversation::{GraphNavigator, Repository, TipController};
use crate::db::{MessageRole, NewMessage};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Attempts per job for retryable engine errors
const MAX_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// Produce a reply to `trigger_message_id`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationJob {
    pub conversation_id: String,
    pub trigger_message_id: String,
}

/// Submission side of the job queue
#[derive(Clone)]
pub struct GenerationHandle {
    tx: mpsc::Sender<GenerationJob>,
}

impl GenerationHandle {
    /// Enqueue without waiting; a full queue is an error, not backpressure
    pub fn submit(&self, job: GenerationJob) -> Result<(), GenerationError> {
        self.tx.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => GenerationError::unavailable("generation queue is full"),
            mpsc::error::TrySendError::Closed(_) => GenerationError::unavailable("generation workers are shut down"),
        })
    }
}

pub struct GenerationWorker<R, E> {
    repo: Arc<R>,
    tips: Arc<TipController<R>>,
    navigator: GraphNavigator<R>,
    engine: Arc<E>,
    broadcaster: Arc<Broadcaster>,
    timeout: Duration,
}

impl<R, E> GenerationWorker<R, E>
where
    R: Repository + 'static,
    E: ResponseEngine + 'static,
{
    pub fn new(
        repo: Arc<R>,
        tips: Arc<TipController<R>>,
        engine: Arc<E>,
        broadcaster: Arc<Broadcaster>,
        timeout: Duration,
    ) -> Self {
        Self {
            navigator: GraphNavigator::new(repo.clone()),
            repo,
            tips,
            engine,
            broadcaster,
            timeout,
        }
    }

    /// Spawn `workers` tasks draining a queue of `capacity` jobs.
    ///
    /// Workers stop when `cancel` fires or every handle is dropped.
    pub fn start(
        self,
        workers: usize,
        capacity: usize,
        cancel: CancellationToken,
    ) -> (GenerationHandle, Vec<JoinHandle<()>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let worker = Arc::new(self);

        let handles = (0..workers.max(1))
            .map(|n| {
                let worker = worker.clone();
                let rx = rx.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    loop {
                        let job = {
                            let mut rx = rx.lock().await;
                            tokio::select! {
                                () = cancel.cancelled() => None,
                                job = rx.recv() => job,
                            }
                        };
                        let Some(job) = job else { break };
                        worker.process(&job, &cancel).await;
                    }
                    tracing::debug!(worker = n, "Generation worker stopped");
                })
            })
            .collect();

        (GenerationHandle { tx }, handles)
    }

    /// Run one job to completion and publish its outcome
    pub async fn process(&self, job: &GenerationJob, cancel: &CancellationToken) {
        tracing::info!(conv_id = %job.conversation_id, trigger = %job.trigger_message_id, "Generation started");

        let history = match self
            .navigator
            .chain_to(&job.conversation_id, &job.trigger_message_id)
            .await
        {
            Ok(history) => history,
            Err(e) => {
                self.fail(job, ErrorKind::GenerationFailed, format!("could not load history: {e}"));
                return;
            }
        };

        let request = GenerationRequest {
            conversation_id: job.conversation_id.clone(),
            trigger_message_id: job.trigger_message_id.clone(),
            history,
        };

        // Run the engine on its own task so a panic surfaces as a join error
        let engine = self.engine.clone();
        let task = tokio::spawn(async move { generate_with_retry(engine.as_ref(), &request).await });
        let abort = task.abort_handle();

        let outcome = tokio::select! {
            () = cancel.cancelled() => {
                abort.abort();
                tracing::info!(conv_id = %job.conversation_id, "Generation cancelled");
                return;
            }
            outcome = tokio::time::timeout(self.timeout, task) => outcome,
        };

        let contents = match outcome {
            Err(_) => {
                abort.abort();
                Err(format!("response engine timed out after {}s", self.timeout.as_secs()))
            }
            Ok(Err(join)) if join.is_panic() => Err("response engine panicked".to_string()),
            Ok(Err(join)) => Err(format!("response engine task failed: {join}")),
            Ok(Ok(Err(e))) => Err(e.to_string()),
            Ok(Ok(Ok(Some(text)))) if !text.trim().is_empty() => Ok(text),
            Ok(Ok(Ok(_))) => Err("response engine returned no output".to_string()),
        };

        match contents {
            Ok(text) => self.persist(job, text).await,
            Err(detail) => self.fail(job, ErrorKind::GenerationFailed, detail),
        }
    }

    async fn persist(&self, job: &GenerationJob, contents: String) {
        let lock = self.tips.lock(&job.conversation_id).await;

        match self.repo.get_conversation(&job.conversation_id).await {
            Ok(conversation) if conversation.is_active() => {}
            Ok(conversation) => {
                tracing::info!(
                    conv_id = %job.conversation_id,
                    status = %conversation.status,
                    "Conversation no longer active, dropping reply"
                );
                return;
            }
            Err(e) => {
                self.fail(job, ErrorKind::InternalError, format!("could not store reply: {e}"));
                return;
            }
        }

        let new = NewMessage::new(
            &job.conversation_id,
            MessageRole::Assistant,
            contents,
            Some(job.trigger_message_id.clone()),
        );

        match self.tips.create_and_advance(&lock, &new).await {
            Ok(message) => {
                tracing::info!(conv_id = %job.conversation_id, message_id = %message.id, "Generation stored");
                let tip_message_id = message.id.clone();
                self.broadcaster.publish(&job.conversation_id, Event::Message { message });
                self.broadcaster.publish(
                    &job.conversation_id,
                    Event::Tip {
                        conversation_id: job.conversation_id.clone(),
                        tip_message_id,
                    },
                );
            }
            Err(e) => self.fail(job, ErrorKind::InternalError, format!("could not store reply: {e}")),
        }
    }

    fn fail(&self, job: &GenerationJob, kind: ErrorKind, detail: String) {
        tracing::warn!(
            conv_id = %job.conversation_id,
            trigger = %job.trigger_message_id,
            error = %detail,
            "Generation failed"
        );
        self.broadcaster
            .publish(&job.conversation_id, Event::error(kind, detail));
    }
}

async fn generate_with_retry<E: ResponseEngine + ?Sized>(
    engine: &E,
    request: &GenerationRequest,
) -> Result<Option<String>, GenerationError> {
    let mut attempt = 1;
    loop {
        match engine.generate(request).await {
            Err(e) if e.kind.is_retryable() && attempt < MAX_ATTEMPTS => {
                tracing::debug!(attempt, error = %e, "Retrying response engine");
                tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}
