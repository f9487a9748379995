//! Subscriber endpoints and their outbound queues

use super::event::PreparedEvent;
use bytes::Bytes;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;

pub type EndpointId = u64;

/// What one publish hands to one endpoint
#[derive(Debug, Clone)]
pub enum Delivery {
    Event(Arc<PreparedEvent>),
    /// Pre-encoded binary payload, forwarded as-is
    Raw(Bytes),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Queued,
    /// The endpoint does not take this kind of payload
    Ignored,
    /// The endpoint's consumer is gone
    Closed,
}

/// Capability a transport implements to receive broadcasts.
///
/// `deliver` must not block: it runs while the broadcaster holds its
/// subscriber lock.
pub trait Endpoint: Send + Sync {
    fn deliver(&self, delivery: &Delivery) -> DeliveryStatus;

    /// Stop accepting deliveries and let the consumer drain and finish
    fn close(&self);
}

/// Producer half of a bounded FIFO that drops its oldest entry when full.
///
/// The capacity is rounded up to a power of two.
pub struct OutboundQueue {
    tx: Mutex<Option<broadcast::Sender<Delivery>>>,
}

/// What the consumer half yields
#[derive(Debug)]
pub enum Received {
    Delivery(Delivery),
    /// This many older deliveries were dropped before the next one
    Skipped(u64),
}

/// Consumer half of an [`OutboundQueue`]
pub struct QueueReceiver {
    rx: broadcast::Receiver<Delivery>,
}

pub fn outbound_queue(capacity: usize) -> (OutboundQueue, QueueReceiver) {
    let (tx, rx) = broadcast::channel(capacity.max(1));
    (
        OutboundQueue {
            tx: Mutex::new(Some(tx)),
        },
        QueueReceiver { rx },
    )
}

impl OutboundQueue {
    pub fn push(&self, delivery: Delivery) -> DeliveryStatus {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        match tx.as_ref() {
            Some(tx) if tx.send(delivery).is_ok() => DeliveryStatus::Queued,
            _ => DeliveryStatus::Closed,
        }
    }

    /// Drop the sender; the receiver sees the end after draining
    pub fn close(&self) {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    #[allow(dead_code)] // Used in tests
    pub fn is_closed(&self) -> bool {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).is_none()
    }
}

impl QueueReceiver {
    /// Next queued item, or `None` once the queue is closed and drained
    pub async fn recv(&mut self) -> Option<Received> {
        match self.rx.recv().await {
            Ok(delivery) => Some(Received::Delivery(delivery)),
            Err(broadcast::error::RecvError::Lagged(n)) => Some(Received::Skipped(n)),
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// Non-blocking variant for tests and draining
    #[allow(dead_code)] // Used in tests
    pub fn try_recv(&mut self) -> Option<Received> {
        match self.rx.try_recv() {
            Ok(delivery) => Some(Received::Delivery(delivery)),
            Err(broadcast::error::TryRecvError::Lagged(n)) => Some(Received::Skipped(n)),
            Err(_) => None,
        }
    }
}
