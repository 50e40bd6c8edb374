//! Fan-out event bus.
//!
//! Each subscriber gets its own bounded queue. `publish` is a
//! `try_send` loop and never blocks the caller; a subscriber whose queue
//! is full is dropped on the spot and its stream terminates with an
//! `OVERFLOW` marker after draining what was already queued. Ordering is
//! preserved per subscriber, not coordinated across subscribers.

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{Event, EventFilter};
use crate::metrics::names;

struct Subscriber {
    filter: EventFilter,
    tx: mpsc::Sender<Event>,
    overflowed: Arc<AtomicBool>,
}

struct BusInner {
    subscribers: DashMap<Uuid, Subscriber>,
    capacity: usize,
}

#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: DashMap::new(),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Begin receiving events published after this call. Dropping the
    /// returned stream releases the subscriber slot.
    pub fn subscribe(&self, filter: EventFilter) -> EventStream {
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        let id = Uuid::new_v4();
        let overflowed = Arc::new(AtomicBool::new(false));
        self.inner.subscribers.insert(
            id,
            Subscriber {
                filter,
                tx,
                overflowed: overflowed.clone(),
            },
        );
        EventStream {
            id,
            rx,
            overflowed,
            bus: self.inner.clone(),
            terminated: false,
        }
    }

    /// Deliver `event` to every matching subscriber without blocking.
    /// Subscribers that cannot keep up are removed; the rest are
    /// unaffected.
    pub fn publish(&self, event: Event) {
        let mut dropped: Vec<Uuid> = Vec::new();

        for entry in self.inner.subscribers.iter() {
            if !entry.filter.matches(&event) {
                continue;
            }
            match entry.tx.try_send(event.clone()) {
                Ok(()) => {
                    metrics::counter!(names::EVENTS_PUBLISHED_TOTAL).increment(1);
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    entry.overflowed.store(true, Ordering::Release);
                    dropped.push(*entry.key());
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    dropped.push(*entry.key());
                }
            }
        }

        for id in dropped {
            if self.inner.subscribers.remove(&id).is_some() {
                metrics::counter!(names::EVENT_SUBSCRIBERS_DROPPED_TOTAL).increment(1);
                tracing::warn!("Dropped slow event subscriber {}", id);
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }
}

/// Lazy, possibly-infinite, non-restartable event sequence.
pub struct EventStream {
    id: Uuid,
    rx: mpsc::Receiver<Event>,
    overflowed: Arc<AtomicBool>,
    bus: Arc<BusInner>,
    terminated: bool,
}

impl EventStream {
    /// Next event, or `None` once the stream has ended. A stream that
    /// was dropped for falling behind drains its queue and then yields
    /// one final `OVERFLOW` event.
    pub async fn recv(&mut self) -> Option<Event> {
        if self.terminated {
            return None;
        }
        match self.rx.recv().await {
            Some(event) => Some(event),
            None => {
                self.terminated = true;
                if self.overflowed.load(Ordering::Acquire) {
                    Some(Event::overflow())
                } else {
                    None
                }
            }
        }
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.bus.subscribers.remove(&self.id);
    }
}
