//! Broadcast of push results, authorization answers and adapter exceptions
//!
//! Hosts subscribe to learn per-item outcomes of background cycles; the
//! adapter never waits for a subscriber. A slow subscriber loses the oldest
//! messages and is told how many it missed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::{debug, info, warn};

use super::events::{Event, EventMessage};

/// Messages buffered per subscriber before the oldest are dropped
const DEFAULT_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EventMessage>,
    subscribers: Arc<AtomicUsize>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Bus buffering `capacity` messages per subscriber
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            subscribers: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Wrap `event` with id and timestamp and hand it to current subscribers.
    ///
    /// Without subscribers the message is dropped.
    pub fn publish(&self, event: Event) {
        let message = EventMessage::new(event);
        let event_type = message.event.event_type();
        let cycle_id = message.event.cycle_id();

        let delivered = self.sender.send(message).unwrap_or(0);
        metrics::counter!("roaming_events_published_total", "type" => event_type).increment(1);
        debug!(event_type, ?cycle_id, delivered, "Event published");
    }

    /// Receive every message published from now on.
    pub fn subscribe(&self) -> EventSubscriber {
        let total = self.subscribers.fetch_add(1, Ordering::SeqCst) + 1;
        info!(total, "Event subscriber attached");

        EventSubscriber {
            receiver: self.sender.subscribe(),
            subscribers: self.subscribers.clone(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.load(Ordering::SeqCst)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

pub struct EventSubscriber {
    receiver: broadcast::Receiver<EventMessage>,
    subscribers: Arc<AtomicUsize>,
}

impl EventSubscriber {
    /// Next message; `None` once the bus is gone. Lag is logged and skipped.
    pub async fn recv(&mut self) -> Option<EventMessage> {
        loop {
            match self.receiver.recv().await {
                Ok(message) => return Some(message),
                Err(RecvError::Lagged(missed)) => lagged(missed),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking receive; `None` when nothing is buffered.
    pub fn try_recv(&mut self) -> Option<EventMessage> {
        loop {
            match self.receiver.try_recv() {
                Ok(message) => return Some(message),
                Err(TryRecvError::Lagged(missed)) => lagged(missed),
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }
}

fn lagged(missed: u64) {
    warn!(missed, "Event subscriber lagged");
    metrics::counter!("roaming_events_missed_total").increment(missed);
}

impl Drop for EventSubscriber {
    fn drop(&mut self) {
        let remaining = self.subscribers.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        info!(remaining, "Event subscriber detached");
    }
}

pub type SharedEventBus = Arc<EventBus>;

pub fn create_event_bus() -> SharedEventBus {
    Arc::new(EventBus::new())
}
