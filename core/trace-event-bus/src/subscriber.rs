//! Subscriber registry and per-subscriber fan-out

use crate::error::DeliveryError;
use crate::events::TraceEvent;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Opaque handle for one live observer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl SubscriberId {
    /// Allocate a process-unique id
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Destination for one observer's copy of the stream.
///
/// `deliver` must not block: the pump calls it inline for every subscriber.
pub trait EventSink: Send {
    fn deliver(&mut self, event: &TraceEvent) -> Result<(), DeliveryError>;
}

/// Sink backed by a bounded queue that a connection task drains.
///
/// A full queue means the observer fell behind and is treated as failed.
#[derive(Debug)]
pub struct ChannelSink {
    tx: flume::Sender<String>,
    capacity: usize,
}

/// Create a sink and the receiver its connection task reads serialized events from
pub fn channel_sink(capacity: usize) -> (ChannelSink, flume::Receiver<String>) {
    let capacity = capacity.max(1);
    let (tx, rx) = flume::bounded(capacity);
    (ChannelSink { tx, capacity }, rx)
}

impl EventSink for ChannelSink {
    fn deliver(&mut self, event: &TraceEvent) -> Result<(), DeliveryError> {
        let payload = event.to_json()?;
        self.tx.try_send(payload).map_err(|e| match e {
            flume::TrySendError::Full(_) => DeliveryError::Lagging {
                capacity: self.capacity,
            },
            flume::TrySendError::Disconnected(_) => DeliveryError::Closed,
        })
    }
}

/// Outcome of one fan-out pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FanoutReport {
    pub delivered: usize,
    pub failed: Vec<SubscriberId>,
}

/// Sole owner of live subscriber state.
///
/// Subscribers are kept in registration order; a failed delivery removes the
/// subscriber immediately without interrupting delivery to the others.
#[derive(Default)]
pub struct SubscriberRegistry {
    subscribers: Vec<(SubscriberId, Box<dyn EventSink>)>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backfill `sink` with `history` (oldest first) and start delivering live events to it.
    ///
    /// If the backfill fails the subscriber is never registered.
    pub fn register<'a>(
        &mut self,
        id: SubscriberId,
        mut sink: Box<dyn EventSink>,
        history: impl IntoIterator<Item = &'a TraceEvent>,
    ) -> Result<(), DeliveryError> {
        let mut replayed = 0usize;
        for event in history {
            sink.deliver(event)?;
            replayed += 1;
        }

        if self.unregister(id) {
            warn!(subscriber = %id, "replacing subscriber registered under the same id");
        }
        self.subscribers.push((id, sink));
        debug!(subscriber = %id, replayed, total = self.subscribers.len(), "subscriber registered");
        Ok(())
    }

    /// Send `event` to every subscriber, dropping the ones that fail
    pub fn deliver(&mut self, event: &TraceEvent) -> FanoutReport {
        let mut report = FanoutReport::default();

        self.subscribers.retain_mut(|(id, sink)| match sink.deliver(event) {
            Ok(()) => {
                report.delivered += 1;
                true
            }
            Err(err) => {
                warn!(subscriber = %id, event_id = %event.id(), error = %err, "delivery failed, unregistering subscriber");
                report.failed.push(*id);
                false
            }
        });

        report
    }

    pub fn unregister(&mut self, id: SubscriberId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(existing, _)| *existing != id);
        before != self.subscribers.len()
    }

    pub fn contains(&self, id: SubscriberId) -> bool {
        self.subscribers.iter().any(|(existing, _)| *existing == id)
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}
