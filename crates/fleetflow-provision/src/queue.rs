//! Per-key coalescing queue
//!
//! Holds at most two entries: the running head and one pending successor.
//! A newer request replaces the pending successor instead of waiting behind it.

use crate::job::Job;
use std::collections::VecDeque;
use std::sync::Arc;

const CAPACITY: usize = 2;

#[derive(Debug)]
pub struct JobQueue<T = Arc<Job>> {
    entries: VecDeque<T>,
}

impl<T> JobQueue<T> {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::with_capacity(CAPACITY),
        }
    }

    /// Append `entry`, returning the pending entry it replaced, if any.
    ///
    /// The head is never evicted.
    pub fn enqueue(&mut self, entry: T) -> Option<T> {
        let evicted = if self.entries.len() >= CAPACITY {
            self.entries.pop_back()
        } else {
            None
        };
        self.entries.push_back(entry);
        evicted
    }

    /// Oldest entry
    pub fn peek(&self) -> Option<&T> {
        self.entries.front()
    }

    /// Remove the oldest entry
    pub fn dequeue(&mut self) -> Option<T> {
        self.entries.pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> Default for JobQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
