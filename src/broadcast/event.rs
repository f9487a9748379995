//! Events pushed to live viewers of a conversation

use crate::db::Message;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// State change published on a conversation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// First frame of every transport connection
    Connected { conversation_id: String },
    Message { message: Message },
    Tip {
        conversation_id: String,
        tip_message_id: String,
    },
    Sync {
        conversation_id: String,
        synced_at: DateTime<Utc>,
        created: Vec<Message>,
    },
    Error { kind: ErrorKind, detail: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    GenerationFailed,
    InternalError,
    InvalidMessage,
}

impl Event {
    pub fn event_type(&self) -> &'static str {
        match self {
            Event::Connected { .. } => "connected",
            Event::Message { .. } => "message",
            Event::Tip { .. } => "tip",
            Event::Sync { .. } => "sync",
            Event::Error { .. } => "error",
        }
    }

    pub fn error(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Event::Error {
            kind,
            detail: detail.into(),
        }
    }
}

/// An event shared by every endpoint of one publish.
///
/// Each wire encoding is produced on first use and cached, so a publish to
/// many endpoints encodes at most once per encoding.
#[derive(Debug)]
pub struct PreparedEvent {
    event: Event,
    json: OnceLock<Option<String>>,
    msgpack: OnceLock<Option<Bytes>>,
}

impl PreparedEvent {
    pub fn new(event: Event) -> Self {
        Self {
            event,
            json: OnceLock::new(),
            msgpack: OnceLock::new(),
        }
    }

    pub fn event(&self) -> &Event {
        &self.event
    }

    /// JSON text for the SSE transport
    pub fn json(&self) -> Option<&str> {
        self.json
            .get_or_init(|| match serde_json::to_string(&self.event) {
                Ok(text) => Some(text),
                Err(e) => {
                    tracing::warn!(event = self.event.event_type(), error = %e, "JSON encoding failed");
                    None
                }
            })
            .as_deref()
    }

    /// MessagePack map for the WebSocket transport
    pub fn msgpack(&self) -> Option<&Bytes> {
        self.msgpack
            .get_or_init(|| match rmp_serde::to_vec_named(&self.event) {
                Ok(buf) => Some(Bytes::from(buf)),
                Err(e) => {
                    tracing::warn!(event = self.event.event_type(), error = %e, "MessagePack encoding failed");
                    None
                }
            })
            .as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_is_type_tagged() {
        let prepared = PreparedEvent::new(Event::error(ErrorKind::GenerationFailed, "engine timed out"));
        let value: serde_json::Value = serde_json::from_str(prepared.json().unwrap()).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["kind"], "generation_failed");
        assert_eq!(value["detail"], "engine timed out");
    }

    #[test]
    fn msgpack_decodes_back_and_is_cached() {
        let prepared = PreparedEvent::new(Event::Tip {
            conversation_id: "c1".into(),
            tip_message_id: "m1".into(),
        });
        let first = prepared.msgpack().unwrap().clone();
        let second = prepared.msgpack().unwrap();
        // Same cached buffer
        assert_eq!(first.as_ptr(), second.as_ptr());

        let decoded: Event = rmp_serde::from_slice(&first).unwrap();
        assert_eq!(&decoded, prepared.event());
    }
}
