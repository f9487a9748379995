//! Server-Sent Events transport
//!
//! Each stream registers a text endpoint with the broadcaster and forwards
//! events as named SSE events with JSON data.

use crate::broadcast::{
    outbound_queue, Broadcaster, Delivery, DeliveryStatus, Endpoint, Event, OutboundQueue, PreparedEvent,
    QueueReceiver, Received, Subscription,
};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use futures::stream::Stream;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::StreamExt;

/// Text endpoint; raw binary payloads are not for SSE clients
struct StreamEndpoint {
    queue: OutboundQueue,
}

impl Endpoint for StreamEndpoint {
    fn deliver(&self, delivery: &Delivery) -> DeliveryStatus {
        match delivery {
            Delivery::Raw(_) => DeliveryStatus::Ignored,
            Delivery::Event(_) => self.queue.push(delivery.clone()),
        }
    }

    fn close(&self) {
        self.queue.close();
    }
}

/// Subscribe to `conversation_id` and stream its events, `connected` first
pub fn sse_stream(
    broadcaster: &Arc<Broadcaster>,
    conversation_id: &str,
    keepalive: Duration,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    Sse::new(event_stream(broadcaster, conversation_id)).keep_alive(
        KeepAlive::new()
            .interval(keepalive)
            .text("keepalive"),
    )
}

fn event_stream(
    broadcaster: &Arc<Broadcaster>,
    conversation_id: &str,
) -> impl Stream<Item = Result<SseEvent, Infallible>> {
    let (queue, rx) = outbound_queue(broadcaster.queue_capacity());
    let subscription = broadcaster.subscribe(conversation_id, Arc::new(StreamEndpoint { queue }));

    let connected = PreparedEvent::new(Event::Connected {
        conversation_id: conversation_id.to_string(),
    });
    let init = futures::stream::iter(to_sse(&connected).map(Ok));

    // The subscription lives in the stream state; dropping the stream deregisters
    let updates = futures::stream::unfold((rx, subscription), next_update);

    init.chain(updates)
}

async fn next_update(
    (mut rx, subscription): (QueueReceiver, Subscription),
) -> Option<(Result<SseEvent, Infallible>, (QueueReceiver, Subscription))> {
    loop {
        let event = match rx.recv().await? {
            Received::Delivery(Delivery::Event(prepared)) => match to_sse(&prepared) {
                Some(event) => event,
                None => continue,
            },
            Received::Delivery(Delivery::Raw(_)) => continue,
            Received::Skipped(n) => {
                tracing::debug!(conv_id = %subscription.conversation_id(), skipped = n, "SSE client lagging");
                SseEvent::default().comment(format!("skipped {n}"))
            }
        };
        return Some((Ok(event), (rx, subscription)));
    }
}

fn to_sse(prepared: &PreparedEvent) -> Option<SseEvent> {
    prepared
        .json()
        .map(|json| SseEvent::default().event(prepared.event().event_type()).data(json))
}
