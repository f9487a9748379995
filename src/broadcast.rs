//! Per-conversation event fan-out
//!
//! One subscribe/unsubscribe/publish contract shared by the SSE and WebSocket
//! transports. Publishing never waits on a subscriber: every endpoint owns a
//! bounded queue and deliveries only enqueue.

mod endpoint;
mod event;

pub use endpoint::{outbound_queue, Delivery, DeliveryStatus, Endpoint, EndpointId, OutboundQueue, QueueReceiver, Received};
pub use event::{ErrorKind, Event, PreparedEvent};

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

/// Subscribers of one conversation
#[derive(Default)]
struct Topic {
    endpoints: HashMap<EndpointId, Arc<dyn Endpoint>>,
    /// Serializes publishes so every endpoint sees the same order
    order: Mutex<()>,
}

/// Counts from one publish
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub ignored: usize,
    pub closed: usize,
}

pub struct Broadcaster {
    topics: RwLock<HashMap<String, Topic>>,
    next_id: AtomicU64,
    queue_capacity: usize,
}

impl Broadcaster {
    pub fn new(queue_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            topics: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            queue_capacity: queue_capacity.max(1),
        })
    }

    /// Capacity transports should give their endpoint queues
    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    /// Register `endpoint`; it stays registered until the returned guard drops
    pub fn subscribe(self: &Arc<Self>, conversation_id: &str, endpoint: Arc<dyn Endpoint>) -> Subscription {
        let endpoint_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut topics = self.topics.write().unwrap_or_else(PoisonError::into_inner);
            topics
                .entry(conversation_id.to_string())
                .or_default()
                .endpoints
                .insert(endpoint_id, endpoint);
        }

        tracing::debug!(conv_id = %conversation_id, endpoint_id, "Subscriber registered");
        Subscription {
            broadcaster: Arc::downgrade(self),
            conversation_id: conversation_id.to_string(),
            endpoint_id,
        }
    }

    /// Remove an endpoint and close it. Returns whether it was registered.
    ///
    /// Idempotent. Once this returns, no publish can reach the endpoint.
    pub fn unsubscribe(&self, conversation_id: &str, endpoint_id: EndpointId) -> bool {
        let removed = {
            let mut topics = self.topics.write().unwrap_or_else(PoisonError::into_inner);
            let removed = topics
                .get_mut(conversation_id)
                .and_then(|topic| topic.endpoints.remove(&endpoint_id));
            if topics.get(conversation_id).is_some_and(|t| t.endpoints.is_empty()) {
                topics.remove(conversation_id);
            }
            removed
        };

        match removed {
            Some(endpoint) => {
                endpoint.close();
                tracing::debug!(conv_id = %conversation_id, endpoint_id, "Subscriber removed");
                true
            }
            None => false,
        }
    }

    /// Deliver `event` to every endpoint registered right now
    pub fn publish(&self, conversation_id: &str, event: Event) -> PublishReport {
        let delivery = Delivery::Event(Arc::new(PreparedEvent::new(event)));
        self.fan_out(conversation_id, &delivery, None)
    }

    /// Forward an already encoded payload to binary endpoints, skipping `exclude`
    pub fn publish_raw(&self, conversation_id: &str, payload: Bytes, exclude: Option<EndpointId>) -> PublishReport {
        self.fan_out(conversation_id, &Delivery::Raw(payload), exclude)
    }

    pub fn subscriber_count(&self, conversation_id: &str) -> usize {
        self.topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(conversation_id)
            .map_or(0, |t| t.endpoints.len())
    }

    fn fan_out(&self, conversation_id: &str, delivery: &Delivery, exclude: Option<EndpointId>) -> PublishReport {
        let mut report = PublishReport::default();

        // Held across delivery so unsubscribe waits for in-flight publishes
        let topics = self.topics.read().unwrap_or_else(PoisonError::into_inner);
        let Some(topic) = topics.get(conversation_id) else {
            return report;
        };
        let _order = topic.order.lock().unwrap_or_else(PoisonError::into_inner);

        for (&endpoint_id, endpoint) in &topic.endpoints {
            if Some(endpoint_id) == exclude {
                continue;
            }
            match endpoint.deliver(delivery) {
                DeliveryStatus::Queued => report.delivered += 1,
                DeliveryStatus::Ignored => report.ignored += 1,
                DeliveryStatus::Closed => {
                    report.closed += 1;
                    tracing::debug!(conv_id = %conversation_id, endpoint_id, "Delivery to closed endpoint");
                }
            }
        }
        report
    }
}

/// Registration guard; unsubscribes on drop
pub struct Subscription {
    broadcaster: Weak<Broadcaster>,
    conversation_id: String,
    endpoint_id: EndpointId,
}

impl Subscription {
    pub fn endpoint_id(&self) -> EndpointId {
        self.endpoint_id
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(broadcaster) = self.broadcaster.upgrade() {
            broadcaster.unsubscribe(&self.conversation_id, self.endpoint_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    /// Queue-backed endpoint recording close calls
    struct TestEndpoint {
        queue: OutboundQueue,
        binary: bool,
        closes: AtomicU64,
    }

    impl TestEndpoint {
        fn new(binary: bool) -> (Arc<Self>, QueueReceiver) {
            let (queue, rx) = outbound_queue(64);
            (
                Arc::new(Self {
                    queue,
                    binary,
                    closes: AtomicU64::new(0),
                }),
                rx,
            )
        }
    }

    impl Endpoint for TestEndpoint {
        fn deliver(&self, delivery: &Delivery) -> DeliveryStatus {
            if matches!(delivery, Delivery::Raw(_)) && !self.binary {
                return DeliveryStatus::Ignored;
            }
            self.queue.push(delivery.clone())
        }

        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.queue.close();
        }
    }

    fn tip_event(n: usize) -> Event {
        Event::Tip {
            conversation_id: "c1".into(),
            tip_message_id: format!("m{n}"),
        }
    }

    fn drain(rx: &mut QueueReceiver) -> Vec<String> {
        let mut seen = Vec::new();
        while let Some(received) = rx.try_recv() {
            match received {
                Received::Delivery(Delivery::Event(p)) => match p.event() {
                    Event::Tip { tip_message_id, .. } => seen.push(tip_message_id.clone()),
                    other => seen.push(other.event_type().to_string()),
                },
                Received::Delivery(Delivery::Raw(b)) => seen.push(format!("raw:{}", b.len())),
                Received::Skipped(n) => seen.push(format!("skipped:{n}")),
            }
        }
        seen
    }

    #[test]
    fn publish_without_subscribers_is_a_noop() {
        let broadcaster = Broadcaster::new(8);
        for n in 0..1000 {
            assert_eq!(broadcaster.publish("c1", tip_event(n)), PublishReport::default());
        }
        assert_eq!(broadcaster.subscriber_count("c1"), 0);
    }

    #[test]
    fn only_post_subscription_events_arrive_in_order() {
        let broadcaster = Broadcaster::new(64);
        broadcaster.publish("c1", tip_event(0));

        let (a, mut rx_a) = TestEndpoint::new(false);
        let (b, mut rx_b) = TestEndpoint::new(true);
        let _sub_a = broadcaster.subscribe("c1", a);
        let _sub_b = broadcaster.subscribe("c1", b);

        for n in 1..=3 {
            assert_eq!(broadcaster.publish("c1", tip_event(n)).delivered, 2);
        }

        let expected = vec!["m1", "m2", "m3"];
        assert_eq!(drain(&mut rx_a), expected);
        assert_eq!(drain(&mut rx_b), expected);
    }

    #[test]
    fn other_conversations_are_isolated() {
        let broadcaster = Broadcaster::new(64);
        let (a, mut rx_a) = TestEndpoint::new(true);
        let _sub = broadcaster.subscribe("c1", a);

        broadcaster.publish("c2", tip_event(1));
        assert!(drain(&mut rx_a).is_empty());
    }

    #[test]
    fn unsubscribe_is_idempotent_and_closes_once() {
        let broadcaster = Broadcaster::new(64);
        let (a, mut rx_a) = TestEndpoint::new(true);
        let sub = broadcaster.subscribe("c1", a.clone());
        let id = sub.endpoint_id();

        assert!(broadcaster.unsubscribe("c1", id));
        assert!(!broadcaster.unsubscribe("c1", id));
        drop(sub);

        assert_eq!(a.closes.load(Ordering::SeqCst), 1);
        assert_eq!(broadcaster.subscriber_count("c1"), 0);

        assert_eq!(broadcaster.publish("c1", tip_event(1)).delivered, 0);
        assert!(drain(&mut rx_a).is_empty());
    }

    #[test]
    fn dropping_guard_unregisters() {
        let broadcaster = Broadcaster::new(64);
        let (a, _rx) = TestEndpoint::new(false);
        {
            let _sub = broadcaster.subscribe("c1", a.clone());
            assert_eq!(broadcaster.subscriber_count("c1"), 1);
        }
        assert_eq!(broadcaster.subscriber_count("c1"), 0);
        assert_eq!(a.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn raw_payloads_reach_binary_endpoints_only() {
        let broadcaster = Broadcaster::new(64);
        let (text, mut rx_text) = TestEndpoint::new(false);
        let (bin, mut rx_bin) = TestEndpoint::new(true);
        let (sender, mut rx_sender) = TestEndpoint::new(true);
        let _t = broadcaster.subscribe("c1", text);
        let _b = broadcaster.subscribe("c1", bin);
        let s = broadcaster.subscribe("c1", sender);

        let report = broadcaster.publish_raw("c1", Bytes::from_static(b"abc"), Some(s.endpoint_id()));
        assert_eq!(report.delivered, 1);
        assert_eq!(report.ignored, 1);

        assert!(drain(&mut rx_text).is_empty());
        assert!(drain(&mut rx_sender).is_empty());
        assert_eq!(drain(&mut rx_bin), vec!["raw:3"]);
    }

    #[test]
    fn slow_endpoint_keeps_newest_and_stays_registered() {
        struct Slow(OutboundQueue);
        impl Endpoint for Slow {
            fn deliver(&self, delivery: &Delivery) -> DeliveryStatus {
                self.0.push(delivery.clone())
            }
            fn close(&self) {
                self.0.close();
            }
        }

        let broadcaster = Broadcaster::new(4);
        let (queue, mut rx) = outbound_queue(broadcaster.queue_capacity());
        let _sub = broadcaster.subscribe("c1", Arc::new(Slow(queue)));

        for n in 0..10 {
            broadcaster.publish("c1", tip_event(n));
        }

        assert_eq!(broadcaster.subscriber_count("c1"), 1);
        assert_eq!(drain(&mut rx), vec!["skipped:6", "m6", "m7", "m8", "m9"]);
    }

    #[test]
    fn concurrent_publishers_give_every_endpoint_the_same_order() {
        let broadcaster = Broadcaster::new(1024);
        let (a, mut rx_a) = TestEndpoint::new(true);
        let (b, mut rx_b) = TestEndpoint::new(true);
        let _sa = broadcaster.subscribe("c1", a);
        let _sb = broadcaster.subscribe("c1", b);

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let broadcaster = broadcaster.clone();
                std::thread::spawn(move || {
                    for n in 0..50 {
                        broadcaster.publish("c1", tip_event(t * 100 + n));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let seen_a = drain(&mut rx_a);
        assert_eq!(seen_a.len(), 200);
        assert_eq!(seen_a, drain(&mut rx_b));
    }

    #[test]
    fn unsubscribe_racing_publish_never_delivers_afterwards() {
        for _ in 0..50 {
            let broadcaster = Broadcaster::new(1024);
            let (a, mut rx) = TestEndpoint::new(true);
            let sub = broadcaster.subscribe("c1", a);
            let id = sub.endpoint_id();
            let stop = Arc::new(AtomicBool::new(false));

            let publisher = {
                let broadcaster = broadcaster.clone();
                let stop = stop.clone();
                std::thread::spawn(move || {
                    let mut n = 0;
                    while !stop.load(Ordering::SeqCst) {
                        broadcaster.publish("c1", tip_event(n));
                        n += 1;
                    }
                })
            };

            std::thread::yield_now();
            assert!(broadcaster.unsubscribe("c1", id));
            let before = drain(&mut rx).len();
            // Anything published from here on must not show up
            std::thread::sleep(std::time::Duration::from_millis(2));
            stop.store(true, Ordering::SeqCst);
            publisher.join().unwrap();
            assert_eq!(drain(&mut rx).len(), 0, "delivered after unsubscribe ({before} before)");
            drop(sub);
        }
    }
}
