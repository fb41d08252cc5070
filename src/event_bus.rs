//! In-process publish/subscribe dispatcher.
//!
//! Each kernel owns one `EventBus`; there is no process-wide instance, so
//! independent kernels can coexist in one process.
//!
//! # Delivery order
//!
//! `publish` is synchronous: the event reaches every matching subscriber, in
//! registration order, before `publish` returns. Subscribers do not publish
//! directly. They return follow-up payloads, which are queued behind the
//! current fan-out and delivered breadth-first. A handler can therefore never
//! interleave its own events into a fan-out that is still in progress.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::event::{Event, EventPayload, Topic};
use crate::types::SimTime;

/// A consumer of published events.
///
/// Handlers must be short and non-blocking; heavy work belongs in a scheduled
/// event. Returned payloads are published after the current fan-out, stamped
/// with the same simulation time.
pub trait Subscriber: Send {
    fn on_event(&mut self, event: &Event) -> Vec<EventPayload>;
}

impl<F> Subscriber for F
where
    F: FnMut(&Event) -> Vec<EventPayload> + Send,
{
    fn on_event(&mut self, event: &Event) -> Vec<EventPayload> {
        self(event)
    }
}

/// Handle identifying one subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

/// Which events a subscription receives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TopicFilter {
    Only(Topic),
    All,
}

impl TopicFilter {
    fn matches(&self, topic: Topic) -> bool {
        match self {
            TopicFilter::Only(t) => *t == topic,
            TopicFilter::All => true,
        }
    }
}

impl From<Topic> for TopicFilter {
    fn from(topic: Topic) -> Self {
        TopicFilter::Only(topic)
    }
}

struct Registration {
    id: SubscriptionId,
    filter: TopicFilter,
    handler: Box<dyn Subscriber>,
}

/// The event dispatcher.
#[derive(Default)]
pub struct EventBus {
    subscribers: Vec<Registration>,
    queue: VecDeque<Event>,
    next_id: u64,
    published: u64,
}

impl EventBus {
    /// Creates a bus with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscriber for a topic (or all topics).
    pub fn subscribe(
        &mut self,
        filter: impl Into<TopicFilter>,
        handler: impl Subscriber + 'static,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.subscribers.push(Registration {
            id,
            filter: filter.into(),
            handler: Box::new(handler),
        });
        id
    }

    /// Removes a subscription. Returns false if it was already removed.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|r| r.id != id);
        before != self.subscribers.len()
    }

    /// Publishes a payload at `time` and delivers it, plus every follow-up it
    /// causes, before returning.
    ///
    /// Returns the number of events delivered (the original plus follow-ups).
    pub fn publish(&mut self, time: SimTime, payload: EventPayload) -> usize {
        self.queue.push_back(Event::new(time, payload));
        let mut delivered = 0;

        while let Some(event) = self.queue.pop_front() {
            delivered += 1;
            self.published += 1;
            tracing::trace!(time = event.time, topic = event.topic.as_str(), "publish");

            for registration in self.subscribers.iter_mut() {
                if !registration.filter.matches(event.topic) {
                    continue;
                }
                let follow_ups = registration.handler.on_event(&event);
                self.queue
                    .extend(follow_ups.into_iter().map(|p| Event::new(event.time, p)));
            }
        }

        delivered
    }

    /// Returns the number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Returns the total number of events delivered since creation.
    pub fn published(&self) -> u64 {
        self.published
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscribers.len())
            .field("published", &self.published)
            .finish()
    }
}

/// A shareable capture of events, usable as a subscriber.
///
/// Clones share the same buffer, so one clone can be handed to the bus while
/// the driver keeps another to inspect what was delivered.
#[derive(Clone, Debug, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<Event>>>,
}

impl EventLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the captured events.
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Returns the captured events on one topic.
    pub fn on_topic(&self, topic: Topic) -> Vec<Event> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.topic == topic)
            .cloned()
            .collect()
    }

    /// Returns the number of captured events.
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Returns true if nothing was captured.
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Takes all captured events, leaving the log empty.
    pub fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl Subscriber for EventLog {
    fn on_event(&mut self, event: &Event) -> Vec<EventPayload> {
        self.events.lock().push(event.clone());
        Vec::new()
    }
}
