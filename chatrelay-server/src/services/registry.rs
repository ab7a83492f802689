//! Per-topic bookkeeping of attached observers.
//!
//! Each observer owns the receiving half of a bounded channel; the registry
//! keeps the sending half under the topic it attached to. A topic entry exists
//! only while it has at least one observer.

use std::{
    collections::HashMap,
    fmt::{Display, Formatter, Result as FmtResult},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use metrics::{counter, gauge};
use shared::models::SseFrame;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};
use uuid::Uuid;

/// Broadcast destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Conversation(Uuid),
    /// Reserved topic carrying conversation lifecycle events.
    AllConversations,
}

impl Display for Topic {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Conversation(id) => write!(f, "{id}"),
            Self::AllConversations => f.write_str("conversations"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(u64);

impl Display for ObserverId {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "observer-{}", self.0)
    }
}

/// Serialized event shared by every observer of one broadcast.
pub type Delivery = Arc<SseFrame>;

/// Sending side of an observer channel, as held by the registry.
#[derive(Debug, Clone)]
pub struct ObserverHandle {
    id: ObserverId,
    sender: mpsc::Sender<Delivery>,
}

impl ObserverHandle {
    #[must_use]
    pub const fn id(&self) -> ObserverId {
        self.id
    }
}

/// Outcome of one broadcast call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub evicted: usize,
}

/// One observer's membership in one topic, shared by every
/// [`Subscription`] handed out for it.
#[derive(Debug)]
struct Member {
    sender: mpsc::Sender<Delivery>,
    handles: usize,
}

type Topics = HashMap<Topic, HashMap<ObserverId, Member>>;

#[derive(Debug)]
pub struct SubscriberRegistry {
    capacity: usize,
    next_id: AtomicU64,
    topics: Mutex<Topics>,
}

pub type SharedRegistry = Arc<SubscriberRegistry>;

impl SubscriberRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
            topics: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a fresh observer channel. The handle is attached to topics;
    /// the receiver is drained by the transport.
    pub fn channel(&self) -> (ObserverHandle, mpsc::Receiver<Delivery>) {
        let (sender, receiver) = mpsc::channel(self.capacity);
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        (ObserverHandle { id, sender }, receiver)
    }

    /// Registers `observer` under `topic`.
    ///
    /// Attaching the same observer twice keeps a single membership shared by
    /// both returned subscriptions; it ends when the last of them is dropped
    /// or on an explicit [`detach`](Self::detach).
    pub fn attach(self: &Arc<Self>, topic: Topic, observer: &ObserverHandle) -> Subscription {
        {
            let mut topics = self.lock();
            let bucket = topics.entry(topic).or_default();
            bucket
                .entry(observer.id)
                .or_insert_with(|| Member {
                    sender: observer.sender.clone(),
                    handles: 0,
                })
                .handles += 1;
            gauge!("chatrelay_topic_observers", "topic_kind" => topic_kind(topic))
                .set(usize_to_f64(bucket.len()));
        }

        debug!(%topic, observer = %observer.id, "observer attached");
        Subscription {
            registry: Arc::clone(self),
            topic,
            observer: observer.id,
        }
    }

    /// Removes the membership regardless of outstanding subscriptions;
    /// returns whether it existed.
    pub fn detach(&self, topic: Topic, observer: ObserverId) -> bool {
        let mut topics = self.lock();
        let Some(bucket) = topics.get_mut(&topic) else {
            return false;
        };

        let removed = bucket.remove(&observer).is_some();
        if bucket.is_empty() {
            topics.remove(&topic);
        }
        drop(topics);

        if removed {
            debug!(%topic, %observer, "observer detached");
        }
        removed
    }

    /// Drops one subscription's share of a membership.
    fn release(&self, topic: Topic, observer: ObserverId) {
        let mut topics = self.lock();
        let Some(bucket) = topics.get_mut(&topic) else {
            return;
        };
        let Some(member) = bucket.get_mut(&observer) else {
            return;
        };

        member.handles = member.handles.saturating_sub(1);
        if member.handles > 0 {
            return;
        }
        bucket.remove(&observer);
        if bucket.is_empty() {
            topics.remove(&topic);
        }
        drop(topics);

        debug!(%topic, %observer, "observer detached");
    }

    /// Delivers `frame` to every observer attached to `topic` right now.
    ///
    /// Observers whose channel is closed or full are detached within this
    /// same call and receive nothing further. Never fails.
    pub fn broadcast(&self, topic: Topic, frame: &Delivery) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let mut topics = self.lock();
        let Some(bucket) = topics.get_mut(&topic) else {
            return report;
        };

        bucket.retain(|observer, Member { sender, .. }| {
            if sender.is_closed() {
                report.evicted += 1;
                debug!(%topic, %observer, "dropping closed observer");
                return false;
            }

            match sender.try_send(Arc::clone(frame)) {
                Ok(()) => {
                    report.delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    report.evicted += 1;
                    warn!(%topic, %observer, event = %frame.event, "observer lagging; detaching");
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    report.evicted += 1;
                    debug!(%topic, %observer, "observer transport closed; detaching");
                    false
                }
            }
        });

        if bucket.is_empty() {
            topics.remove(&topic);
        }
        drop(topics);

        counter!("chatrelay_broadcast_deliveries_total", "event" => frame.event.clone())
            .increment(report.delivered as u64);
        if report.evicted > 0 {
            counter!("chatrelay_observers_evicted_total").increment(report.evicted as u64);
        }

        report
    }

    pub fn observer_count(&self, topic: Topic) -> usize {
        self.lock().get(&topic).map_or(0, HashMap::len)
    }

    pub fn topic_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, Topics> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Membership of one observer in one topic; detaches when dropped.
#[derive(Debug)]
pub struct Subscription {
    registry: SharedRegistry,
    topic: Topic,
    observer: ObserverId,
}

impl Subscription {
    #[must_use]
    pub const fn topic(&self) -> Topic {
        self.topic
    }

    #[must_use]
    pub const fn observer(&self) -> ObserverId {
        self.observer
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.release(self.topic, self.observer);
    }
}

const fn topic_kind(topic: Topic) -> &'static str {
    match topic {
        Topic::Conversation(_) => "conversation",
        Topic::AllConversations => "all",
    }
}

#[allow(clippy::cast_precision_loss)]
fn usize_to_f64(value: usize) -> f64 {
    value as f64
}
