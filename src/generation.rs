//! Asynchronous response generation
//!
//! Sending a user message hands a job to a worker pool; the pool runs the
//! downstream engine with a timeout and publishes the outcome to live
//! viewers. The HTTP request that triggered it has already returned.

mod http;
mod worker;

pub use http::HttpResponseEngine;
pub use worker::{GenerationHandle, GenerationJob, GenerationWorker};

use crate::db::Message;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

/// Input handed to the engine
#[derive(Debug, Clone, Serialize)]
pub struct GenerationRequest {
    pub conversation_id: String,
    pub trigger_message_id: String,
    /// Root-first chain ending at the trigger message
    pub history: Vec<Message>,
}

/// Generation error with classification
#[derive(Debug, Error)]
#[error("{message}")]
pub struct GenerationError {
    pub kind: GenerationErrorKind,
    pub message: String,
}

impl GenerationError {
    pub fn new(kind: GenerationErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(GenerationErrorKind::Network, message)
    }

    pub fn server_error(message: impl Into<String>) -> Self {
        Self::new(GenerationErrorKind::ServerError, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(GenerationErrorKind::InvalidRequest, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(GenerationErrorKind::Unavailable, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(GenerationErrorKind::Unknown, message)
    }
}

/// Error classification for retry logic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationErrorKind {
    /// Connection problems and timeouts - retryable
    Network,
    /// Rate limited (429) - retryable
    RateLimit,
    /// Engine failure (5xx) - retryable
    ServerError,
    /// Rejected request (4xx) - not retryable
    InvalidRequest,
    /// Job queue full or shut down - not retryable
    Unavailable,
    Unknown,
}

impl GenerationErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Network | Self::RateLimit | Self::ServerError)
    }
}

/// Downstream response engine
#[async_trait]
pub trait ResponseEngine: Send + Sync {
    /// `Ok(None)` means the engine produced nothing
    async fn generate(&self, request: &GenerationRequest) -> Result<Option<String>, GenerationError>;
}

#[async_trait]
impl<T: ResponseEngine + ?Sized> ResponseEngine for Arc<T> {
    async fn generate(&self, request: &GenerationRequest) -> Result<Option<String>, GenerationError> {
        (**self).generate(request).await
    }
}
