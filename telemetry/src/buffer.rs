//! Ordered event buffer.
//!
//! Events are kept in insertion order. Every event is tagged with a
//! monotonically increasing sequence number so that a send can acknowledge
//! exactly the events it carried, even when more events were appended while
//! the send was in flight.
//!
//! The buffer only shrinks through three operations, all driven by the
//! dispatcher: [`EventBuffer::acknowledge`] after a successful send,
//! [`EventBuffer::enforce_bound`] after a failed one, and
//! [`EventBuffer::clear`] when the deployment does not collect.

use std::collections::VecDeque;

use tracing::warn;

use crate::types::InteractionEvent;

/// Buffer length above which a failed send triggers eviction.
pub const DEFAULT_HIGH_WATER_MARK: usize = 100;

/// Number of most recent events kept when eviction happens.
pub const DEFAULT_RETAIN_ON_OVERFLOW: usize = 50;

/// Lossy backpressure limits applied after failed sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLimits {
    /// Eviction happens only when the buffer is longer than this.
    pub high_water_mark: usize,
    /// How many of the newest events survive an eviction.
    pub retain: usize,
}

impl Default for BufferLimits {
    fn default() -> Self {
        Self {
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            retain: DEFAULT_RETAIN_ON_OVERFLOW,
        }
    }
}

/// A point-in-time copy of the buffer, handed to the transport.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Events in capture order.
    pub events: Vec<InteractionEvent>,
    /// Sequence number of the last event in `events`.
    last_seq: u64,
}

impl Snapshot {
    /// Number of events in the snapshot.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Returns `true` if the snapshot holds no events.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[derive(Debug)]
struct Entry {
    seq: u64,
    event: InteractionEvent,
}

/// Insertion-ordered buffer of interaction events.
#[derive(Debug, Default)]
pub struct EventBuffer {
    entries: VecDeque<Entry>,
    next_seq: u64,
}

impl EventBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an event at the back.
    pub fn push(&mut self, event: InteractionEvent) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push_back(Entry { seq, event });
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copies the current contents, in order.
    ///
    /// Returns `None` if the buffer is empty.
    #[must_use]
    pub fn snapshot(&self) -> Option<Snapshot> {
        let last_seq = self.entries.back()?.seq;
        Some(Snapshot {
            events: self.entries.iter().map(|e| e.event.clone()).collect(),
            last_seq,
        })
    }

    /// Removes the events carried by `snapshot`, leaving anything appended
    /// after it was taken.
    ///
    /// Returns the number of events removed.
    pub fn acknowledge(&mut self, snapshot: &Snapshot) -> usize {
        let mut removed = 0;
        while self
            .entries
            .front()
            .is_some_and(|entry| entry.seq <= snapshot.last_seq)
        {
            self.entries.pop_front();
            removed += 1;
        }
        removed
    }

    /// Keeps only the newest `limits.retain` events if the buffer is longer
    /// than `limits.high_water_mark`.
    ///
    /// Returns the number of events evicted (oldest first).
    pub fn enforce_bound(&mut self, limits: BufferLimits) -> usize {
        if self.entries.len() <= limits.high_water_mark {
            return 0;
        }

        let evicted = self.entries.len().saturating_sub(limits.retain);
        self.entries.drain(..evicted);

        if evicted > 0 {
            warn!(
                evicted_count = evicted,
                retained = self.entries.len(),
                "Buffer over high water mark, oldest events evicted"
            );
        }

        evicted
    }

    /// Drops every buffered event. Returns how many were dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.entries.len();
        self.entries.clear();
        dropped
    }

    /// Iterates over buffered events in capture order.
    pub fn iter(&self) -> impl Iterator<Item = &InteractionEvent> {
        self.entries.iter().map(|entry| &entry.event)
    }
}
