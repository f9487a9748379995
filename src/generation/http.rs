//! HTTP response engine adapter

use super::{GenerationError, GenerationErrorKind, GenerationRequest, ResponseEngine};
use crate::db::MessageRole;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Posts the conversation history as JSON and reads back `{"contents": ...}`
pub struct HttpResponseEngine {
    client: Client,
    url: String,
}

#[derive(Debug, Serialize)]
struct EngineRequest<'a> {
    conversation_id: &'a str,
    trigger_message_id: &'a str,
    messages: Vec<EngineMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct EngineMessage<'a> {
    role: MessageRole,
    contents: &'a str,
}

#[derive(Debug, Deserialize)]
struct EngineResponse {
    #[serde(default)]
    contents: Option<String>,
}

impl HttpResponseEngine {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, GenerationError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GenerationError::unknown(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

fn translate_request(request: &GenerationRequest) -> EngineRequest<'_> {
    EngineRequest {
        conversation_id: &request.conversation_id,
        trigger_message_id: &request.trigger_message_id,
        messages: request
            .history
            .iter()
            .map(|m| EngineMessage {
                role: m.role,
                contents: &m.contents,
            })
            .collect(),
    }
}

fn classify_error(status: reqwest::StatusCode, body: &str) -> GenerationError {
    match status.as_u16() {
        429 => GenerationError::new(GenerationErrorKind::RateLimit, format!("Rate limited: {body}")),
        400..=499 => GenerationError::invalid_request(format!("HTTP {status}: {body}")),
        500..=599 => GenerationError::server_error(format!("Server error: {body}")),
        _ => GenerationError::unknown(format!("HTTP {status}: {body}")),
    }
}

/// Trimmed contents, or `None` when there is nothing to post
fn extract_contents(body: &str) -> Result<Option<String>, GenerationError> {
    let response: EngineResponse = serde_json::from_str(body)
        .map_err(|e| GenerationError::unknown(format!("Failed to parse response: {e}")))?;
    Ok(response
        .contents
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty()))
}

#[async_trait]
impl ResponseEngine for HttpResponseEngine {
    async fn generate(&self, request: &GenerationRequest) -> Result<Option<String>, GenerationError> {
        let response = self
            .client
            .post(&self.url)
            .json(&translate_request(request))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GenerationError::network(format!("Request timeout: {e}"))
                } else if e.is_connect() {
                    GenerationError::network(format!("Connection failed: {e}"))
                } else {
                    GenerationError::unknown(format!("Request failed: {e}"))
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| GenerationError::network(format!("Failed to read response: {e}")))?;

        if !status.is_success() {
            return Err(classify_error(status, &body));
        }

        extract_contents(&body)
    }
}
