//! Bounded recent history used to backfill new observers

use crate::events::TraceEvent;
use std::collections::VecDeque;

/// Default number of events kept for replay
pub const DEFAULT_REPLAY_CAPACITY: usize = 100;

/// Fixed-capacity history of the most recent events, oldest evicted first.
///
/// Owned by the delivery pump; nothing outside it holds a mutable reference.
#[derive(Debug)]
pub struct ReplayBuffer {
    events: VecDeque<TraceEvent>,
    capacity: usize,
}

impl ReplayBuffer {
    /// Create a buffer holding at most `capacity` events (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append at the tail, evicting the oldest entry when full
    pub fn append(&mut self, event: TraceEvent) {
        if self.events.len() == self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    /// Current contents in insertion order
    pub fn snapshot(&self) -> Vec<TraceEvent> {
        self.events.iter().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TraceEvent> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for ReplayBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_REPLAY_CAPACITY)
    }
}
