//! Offline event queue
//!
//! Holds forwarded events while no assignment table is installed. The queue
//! is bounded (the oldest entry is evicted on overflow) and entries older than
//! the configured age are discarded instead of being routed.

use crate::message::Forward;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
struct QueuedEvent {
    forward: Forward,
    enqueued_at: Instant,
}

/// Result of draining the queue
#[derive(Debug, Default)]
pub struct Drained {
    /// Events still young enough to route, oldest first
    pub live: Vec<Forward>,
    /// Number of events discarded for age
    pub expired: usize,
}

/// Bounded, age-expiring FIFO of forward envelopes
#[derive(Debug)]
pub struct EventQueue {
    entries: VecDeque<QueuedEvent>,
    limit: usize,
    max_age: Duration,
}

impl EventQueue {
    pub fn new(limit: usize, max_age: Duration) -> Self {
        Self {
            entries: VecDeque::new(),
            limit: limit.max(1),
            max_age,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Append an event, returning the entry evicted to make room, if any
    pub fn add(&mut self, forward: Forward) -> Option<Forward> {
        let evicted = if self.entries.len() >= self.limit {
            self.entries.pop_front().map(|e| e.forward)
        } else {
            None
        };
        self.entries.push_back(QueuedEvent {
            forward,
            enqueued_at: Instant::now(),
        });
        evicted
    }

    /// Drop entries older than the maximum age, returning how many went
    pub fn purge_expired(&mut self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries
            .retain(|e| now.duration_since(e.enqueued_at) <= self.max_age);
        before - self.entries.len()
    }

    /// Empty the queue, separating live events from expired ones
    pub fn drain(&mut self) -> Drained {
        let expired = self.purge_expired();
        Drained {
            live: self.entries.drain(..).map(|e| e.forward).collect(),
            expired,
        }
    }
}
