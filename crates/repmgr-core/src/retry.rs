//! Reconnect scheduling
//!
//! A time-ordered list of pending connection attempts, one entry per idle
//! site. Immediate retries go to the head so newly added sites connect
//! before older, already due ones.
//!
//! Entries keep the due time computed when they were queued. Changing the
//! configured retry interval afterwards does not move them.

use crate::site::Eid;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// One pending reconnect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryEntry {
    /// Site to reconnect to
    pub eid: Eid,
    /// When the attempt becomes due
    pub due: Instant,
}

/// Time-ordered reconnect queue
#[derive(Debug, Default)]
pub struct RetryQueue {
    entries: VecDeque<RetryEntry>,
}

impl RetryQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reconnect for `eid` after `delay`, replacing any entry the
    /// site already has
    pub fn schedule(&mut self, eid: Eid, delay: Duration, now: Instant) {
        self.remove(eid);
        let entry = RetryEntry {
            eid,
            due: now + delay,
        };
        if delay.is_zero() {
            self.entries.push_front(entry);
            return;
        }
        let at = self
            .entries
            .iter()
            .rposition(|e| e.due <= entry.due)
            .map_or(0, |i| i + 1);
        self.entries.insert(at, entry);
    }

    /// Remove and return every entry due at `now`, in queue order
    pub fn pop_due(&mut self, now: Instant) -> Vec<RetryEntry> {
        let mut due = Vec::new();
        self.entries.retain(|e| {
            if e.due <= now {
                due.push(*e);
                false
            } else {
                true
            }
        });
        due
    }

    /// Earliest due time, to bound the manager's wait
    pub fn next_due(&self) -> Option<Instant> {
        self.entries.iter().map(|e| e.due).min()
    }

    /// Drop the entry for `eid`; returns whether there was one
    pub fn remove(&mut self, eid: Eid) -> bool {
        match self.entries.iter().position(|e| e.eid == eid) {
            Some(i) => {
                self.entries.remove(i);
                true
            }
            None => false,
        }
    }

    /// Whether `eid` has a pending entry
    pub fn contains(&self, eid: Eid) -> bool {
        self.entries.iter().any(|e| e.eid == eid)
    }

    /// Due time of `eid`'s entry
    pub fn due_time(&self, eid: Eid) -> Option<Instant> {
        self.entries.iter().find(|e| e.eid == eid).map(|e| e.due)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in queue order
    pub fn iter(&self) -> impl Iterator<Item = &RetryEntry> {
        self.entries.iter()
    }
}
