//! Gossip engine: deduplication, typed decoding and per-topic delivery.
//!
//! gossipsub carries the bytes; this module decides what happens to them.
//! For every received payload, [`GossipEngine::on_receive`]:
//!
//! 1. ignores topics the registry does not know (no decode attempted),
//! 2. rejects payloads above the size limit,
//! 3. drops content identifiers already seen within the window,
//! 4. decodes through the registry (failure is a protocol violation by the
//!    sender), and
//! 5. pushes the decoded object onto the topic's [`DeliveryQueue`].
//!
//! The swarm task maps the outcome onto gossipsub validation, which forwards
//! accepted messages to mesh peers other than the origin.
//!
//! Delivery queues never block the producer: a full queue drops its oldest
//! item and counts the drop.

use libp2p::PeerId;
use parking_lot::Mutex;
use sentinel_core::constants::MESSAGE_ID_LEN;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::error::GossipError;
use crate::topics::{message_id, GossipObject, GossipTopic, TopicRegistry};

pub type MessageId = [u8; MESSAGE_ID_LEN];

// ---------------------------------------------------------------------------
// Dedup window
// ---------------------------------------------------------------------------

/// Content identifiers seen recently, bounded by count and age.
#[derive(Debug)]
pub struct SeenCache {
    order: VecDeque<(MessageId, Instant)>,
    ids: HashSet<MessageId>,
    capacity: usize,
    ttl: Duration,
}

impl SeenCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self { order: VecDeque::new(), ids: HashSet::new(), capacity: capacity.max(1), ttl }
    }

    /// Record `id`. Returns `false` if it was already present.
    pub fn insert(&mut self, id: MessageId) -> bool {
        self.expire_old();
        if self.ids.contains(&id) {
            return false;
        }
        while self.order.len() >= self.capacity {
            if let Some((old, _)) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
        self.order.push_back((id, Instant::now()));
        self.ids.insert(id);
        true
    }

    pub fn contains(&mut self, id: &MessageId) -> bool {
        self.expire_old();
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn expire_old(&mut self) {
        let now = Instant::now();
        while let Some((id, at)) = self.order.front() {
            if now.duration_since(*at) < self.ttl {
                break;
            }
            self.ids.remove(id);
            self.order.pop_front();
        }
    }
}

// ---------------------------------------------------------------------------
// Delivery queue
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
    dropped: u64,
}

#[derive(Debug)]
struct QueueShared<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
    capacity: usize,
}

/// Producer side of a bounded, drop-oldest queue.
#[derive(Debug)]
pub struct DeliveryQueue<T> {
    shared: Arc<QueueShared<T>>,
}

/// Consumer side. Clones share the queue; each item is delivered to one of them.
#[derive(Debug)]
pub struct DeliveryReceiver<T> {
    shared: Arc<QueueShared<T>>,
}

impl<T> Clone for DeliveryReceiver<T> {
    fn clone(&self) -> Self {
        Self { shared: self.shared.clone() }
    }
}

impl<T> DeliveryQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let shared = QueueShared {
            state: Mutex::new(QueueState { items: VecDeque::new(), closed: false, dropped: 0 }),
            notify: Notify::new(),
            capacity: capacity.max(1),
        };
        Self { shared: Arc::new(shared) }
    }

    /// Enqueue without blocking. Returns `false` if an older item was
    /// dropped to make room, or if the queue is closed.
    pub fn push(&self, item: T) -> bool {
        let mut kept_all = true;
        {
            let mut state = self.shared.state.lock();
            if state.closed {
                return false;
            }
            if state.items.len() >= self.shared.capacity {
                state.items.pop_front();
                state.dropped += 1;
                kept_all = false;
            }
            state.items.push_back(item);
        }
        self.shared.notify.notify_one();
        kept_all
    }

    /// Close the queue. Receivers drain what is left, then get `None`.
    pub fn close(&self) {
        self.shared.state.lock().closed = true;
        self.shared.notify.notify_waiters();
    }

    pub fn subscribe(&self) -> DeliveryReceiver<T> {
        DeliveryReceiver { shared: self.shared.clone() }
    }

    pub fn dropped(&self) -> u64 {
        self.shared.state.lock().dropped
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> DeliveryReceiver<T> {
    /// Wait for the next item. `None` once the queue is closed and drained.
    pub async fn recv(&self) -> Option<T> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.shared.state.lock();
                if let Some(item) = state.items.pop_front() {
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    pub fn try_recv(&self) -> Option<T> {
        self.shared.state.lock().items.pop_front()
    }

    /// Items discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.shared.state.lock().dropped
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GossipOutcome {
    Accepted(GossipTopic),
    Duplicate,
    UnknownTopic,
    /// The sender violated the protocol; the reason is for logs only.
    Invalid(String),
}

#[derive(Debug)]
pub struct GossipEngine {
    registry: TopicRegistry,
    seen: Mutex<SeenCache>,
    queues: HashMap<GossipTopic, DeliveryQueue<GossipObject>>,
    max_size: usize,
}

impl GossipEngine {
    pub fn new(registry: TopicRegistry, queue_capacity: usize, seen_capacity: usize, seen_ttl: Duration, max_size: usize) -> Self {
        let queues = GossipTopic::ALL
            .iter()
            .map(|t| (*t, DeliveryQueue::new(queue_capacity)))
            .collect();
        Self { registry, seen: Mutex::new(SeenCache::new(seen_capacity, seen_ttl)), queues, max_size }
    }

    pub fn registry(&self) -> &TopicRegistry {
        &self.registry
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Handle a payload received from `source` on `topic`.
    pub fn on_receive(&self, source: &PeerId, topic: &str, data: &[u8]) -> GossipOutcome {
        let Ok(decode) = self.registry.decoder(topic) else {
            trace!(%source, topic, "gossip: unknown topic ignored");
            return GossipOutcome::UnknownTopic;
        };
        if data.len() > self.max_size {
            return GossipOutcome::Invalid(format!("payload too large: {} > {}", data.len(), self.max_size));
        }
        let id = message_id(topic, data);
        if self.seen.lock().contains(&id) {
            return GossipOutcome::Duplicate;
        }
        let object = match decode(data) {
            Ok(object) => object,
            Err(e) => return GossipOutcome::Invalid(e.to_string()),
        };
        if !self.seen.lock().insert(id) {
            return GossipOutcome::Duplicate;
        }

        let kind = object.topic();
        if let Some(queue) = self.queues.get(&kind) {
            if !queue.push(object) {
                debug!(topic = %kind, dropped = queue.dropped(), "gossip: delivery queue full, dropped oldest");
            }
        }
        GossipOutcome::Accepted(kind)
    }

    /// Checks applied before a local publish. Returns the content identifier.
    pub fn check_publish(&self, topic: &str, data: &[u8]) -> Result<MessageId, GossipError> {
        if data.len() > self.max_size {
            return Err(GossipError::MessageTooLarge { size: data.len(), max: self.max_size });
        }
        let id = message_id(topic, data);
        if self.seen.lock().contains(&id) {
            return Err(GossipError::Duplicate);
        }
        Ok(id)
    }

    /// Record a successful local publish so echoes are dropped.
    pub fn mark_published(&self, id: MessageId) {
        self.seen.lock().insert(id);
    }

    pub fn subscribe(&self, topic: GossipTopic) -> Option<DeliveryReceiver<GossipObject>> {
        self.queues.get(&topic).map(DeliveryQueue::subscribe)
    }

    pub fn dropped(&self, topic: GossipTopic) -> u64 {
        self.queues.get(&topic).map_or(0, DeliveryQueue::dropped)
    }

    pub fn close_all(&self) {
        for queue in self.queues.values() {
            queue.close();
        }
    }
}
