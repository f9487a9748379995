//! WebSocket transport
//!
//! Binary MessagePack frames in both directions. A writer task drains the
//! connection's endpoint queue; the reader handles client frames and relays
//! anything it does not understand itself to the other binary subscribers.

use super::AppState;
use crate::broadcast::{
    outbound_queue, Delivery, DeliveryStatus, Endpoint, EndpointId, ErrorKind, Event, OutboundQueue, PreparedEvent,
    QueueReceiver, Received,
};
use crate::conversation::{SyncItem, SyncReport};
use crate::error::CoreError;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use bytes::Bytes;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

type SharedSink = Arc<Mutex<SplitSink<WebSocket, WsMessage>>>;

/// Binary endpoint; takes events and raw relays alike
struct SocketEndpoint {
    queue: OutboundQueue,
}

impl Endpoint for SocketEndpoint {
    fn deliver(&self, delivery: &Delivery) -> DeliveryStatus {
        self.queue.push(delivery.clone())
    }

    fn close(&self) {
        self.queue.close();
    }
}

#[derive(Debug, Deserialize)]
struct SyncFrame {
    #[serde(default)]
    messages: Vec<SyncItem>,
}

/// Frames answered to the sender only
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ReplyFrame {
    SyncResult(SyncReport),
    Pong,
    /// Deliveries dropped because the client fell behind
    Skipped { count: u64 },
}

/// What the reader makes of one binary frame
#[derive(Debug, PartialEq)]
enum Inbound {
    Sync(Vec<SyncItem>),
    Ping,
    Relay,
    Invalid(String),
}

/// Just the discriminator; everything else in a frame is left undecoded
#[derive(Debug, Deserialize)]
struct FrameHead {
    #[serde(rename = "type")]
    kind: Option<String>,
}

fn classify(frame: &[u8]) -> Inbound {
    let head: FrameHead = match rmp_serde::from_slice(frame) {
        Ok(head) => head,
        Err(e) => return Inbound::Invalid(format!("undecodable frame: {e}")),
    };

    match head.kind.as_deref() {
        Some("sync") => match rmp_serde::from_slice::<SyncFrame>(frame) {
            Ok(frame) => Inbound::Sync(frame.messages),
            Err(e) => Inbound::Invalid(format!("invalid sync frame: {e}")),
        },
        Some("ping") => Inbound::Ping,
        Some(_) => Inbound::Relay,
        None => Inbound::Invalid("frame has no type".to_string()),
    }
}

fn encode_reply(reply: &ReplyFrame) -> Option<Vec<u8>> {
    rmp_serde::to_vec_named(reply)
        .map_err(|e| tracing::error!(error = %e, "Failed to encode reply frame"))
        .ok()
}

fn encode_error(kind: ErrorKind, detail: impl Into<String>) -> Option<Vec<u8>> {
    PreparedEvent::new(Event::error(kind, detail))
        .msgpack()
        .map(|b| b.to_vec())
}

/// Write one frame under the connection's write lock
async fn send_frame(sink: &SharedSink, frame: Vec<u8>) -> bool {
    let mut sink = sink.lock().await;
    matches!(
        tokio::time::timeout(WRITE_TIMEOUT, sink.send(WsMessage::Binary(frame))).await,
        Ok(Ok(()))
    )
}

/// One live WebSocket client
struct Connection {
    state: AppState,
    owner_id: String,
    conversation_id: String,
    endpoint_id: EndpointId,
    sink: SharedSink,
}

/// Run an upgraded socket until either side goes away
pub async fn serve_socket(socket: WebSocket, state: AppState, owner_id: String, conversation_id: String) {
    let broadcaster = state.service.broadcaster().clone();
    let (queue, rx) = outbound_queue(broadcaster.queue_capacity());

    // Queued before registering so it precedes every published event
    queue.push(Delivery::Event(Arc::new(PreparedEvent::new(Event::Connected {
        conversation_id: conversation_id.clone(),
    }))));
    let subscription = broadcaster.subscribe(&conversation_id, Arc::new(SocketEndpoint { queue }));

    let (sink, mut stream) = socket.split();
    let sink: SharedSink = Arc::new(Mutex::new(sink));
    let mut writer = tokio::spawn(write_loop(sink.clone(), rx, state.keepalive));

    let connection = Connection {
        state,
        owner_id,
        conversation_id,
        endpoint_id: subscription.endpoint_id(),
        sink,
    };
    tracing::info!(conv_id = %connection.conversation_id, endpoint_id = connection.endpoint_id, "WebSocket connected");

    let reader = async {
        while let Some(Ok(message)) = stream.next().await {
            match message {
                WsMessage::Binary(frame) => {
                    if !connection.handle_frame(frame).await {
                        break;
                    }
                }
                WsMessage::Close(_) => break,
                // Text frames are not part of the protocol; pings are answered by axum
                WsMessage::Text(_) | WsMessage::Ping(_) | WsMessage::Pong(_) => {}
            }
        }
    };

    tokio::select! {
        () = reader => {}
        _ = &mut writer => {}
    }
    writer.abort();
    drop(subscription);
    tracing::info!(conv_id = %connection.conversation_id, endpoint_id = connection.endpoint_id, "WebSocket disconnected");
}

async fn write_loop(sink: SharedSink, mut rx: QueueReceiver, keepalive: Duration) {
    let mut ping = tokio::time::interval(keepalive);
    ping.tick().await;

    loop {
        let frame = tokio::select! {
            received = rx.recv() => match received {
                Some(Received::Delivery(Delivery::Event(prepared))) => prepared.msgpack().map(|b| b.to_vec()),
                Some(Received::Delivery(Delivery::Raw(bytes))) => Some(bytes.to_vec()),
                Some(Received::Skipped(count)) => encode_reply(&ReplyFrame::Skipped { count }),
                None => break,
            },
            _ = ping.tick() => {
                let mut sink = sink.lock().await;
                match tokio::time::timeout(WRITE_TIMEOUT, sink.send(WsMessage::Ping(Vec::new()))).await {
                    Ok(Ok(())) => continue,
                    _ => break,
                }
            }
        };

        if let Some(frame) = frame {
            if !send_frame(&sink, frame).await {
                tracing::debug!("WebSocket write failed");
                break;
            }
        }
    }
}

impl Connection {
    /// Returns `false` once the socket can no longer be written
    async fn handle_frame(&self, frame: Vec<u8>) -> bool {
        let reply = match classify(&frame) {
            Inbound::Sync(items) => self.sync(&items).await,
            Inbound::Ping => encode_reply(&ReplyFrame::Pong),
            Inbound::Relay => {
                let report = self.state.service.broadcaster().publish_raw(
                    &self.conversation_id,
                    Bytes::from(frame),
                    Some(self.endpoint_id),
                );
                tracing::debug!(conv_id = %self.conversation_id, delivered = report.delivered, "Frame relayed");
                None
            }
            Inbound::Invalid(reason) => {
                tracing::debug!(conv_id = %self.conversation_id, reason = %reason, "Rejected client frame");
                encode_error(ErrorKind::InvalidMessage, reason)
            }
        };

        match reply {
            Some(reply) => send_frame(&self.sink, reply).await,
            None => true,
        }
    }

    async fn sync(&self, items: &[SyncItem]) -> Option<Vec<u8>> {
        match self
            .state
            .service
            .sync(&self.owner_id, &self.conversation_id, items)
            .await
        {
            Ok(report) => encode_reply(&ReplyFrame::SyncResult(report)),
            Err(CoreError::Internal(detail)) => encode_error(ErrorKind::InternalError, detail),
            Err(e) => encode_error(ErrorKind::InvalidMessage, e.to_string()),
        }
    }
}
