//! Bounded event history

use crate::event::FailoverEvent;
use std::collections::VecDeque;

/// FIFO ring of the most recent events
#[derive(Debug, Clone)]
pub struct EventHistory {
    events: VecDeque<FailoverEvent>,
    capacity: usize,
}

impl EventHistory {
    /// Ring holding at most `capacity` events (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append, evicting the oldest event when full
    pub fn push(&mut self, event: FailoverEvent) {
        if self.events.len() == self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    /// Up to `n` most recent events, oldest first
    pub fn recent(&self, n: usize) -> Vec<FailoverEvent> {
        let skip = self.events.len().saturating_sub(n);
        self.events.iter().skip(skip).cloned().collect()
    }

    /// All retained events, oldest first
    pub fn all(&self) -> Vec<FailoverEvent> {
        self.events.iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<&FailoverEvent> {
        self.events.back()
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
