//! Time-ordered feed request queue
//!
//! A min-heap of pending requests keyed by fire time. Entries with equal
//! times pop in insertion order. The queue has a fixed capacity; inserts
//! past it are rejected and the caller decides where the request waits.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Mutex;
use tokio::sync::Notify;

use super::error::{SchedulerError, SchedulerResult};
use crate::models::FeedId;

/// A feed request waiting for its fire time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledRequest {
    pub feed_id: FeedId,
    pub update_number: u64,
    pub time: i64,
}

#[derive(Debug, PartialEq, Eq)]
struct Entry {
    time: i64,
    seq: u64,
    request: ScheduledRequest,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.time
            .cmp(&other.time)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct QueueInner {
    heap: BinaryHeap<Reverse<Entry>>,
    seq: u64,
    closed: bool,
}

/// Bounded min-heap of scheduled feed requests
#[derive(Debug)]
pub struct RequestQueue {
    inner: Mutex<QueueInner>,
    capacity: usize,
    changed: Notify,
}

impl RequestQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            capacity,
            changed: Notify::new(),
        }
    }

    /// Schedule a request at `time`
    pub fn push(&self, feed_id: FeedId, update_number: u64, time: i64) -> SchedulerResult<()> {
        {
            let mut inner = self.lock();
            if inner.closed {
                return Err(SchedulerError::QueueClosed);
            }
            if inner.heap.len() >= self.capacity {
                return Err(SchedulerError::queue_full(feed_id, self.capacity));
            }
            inner.seq += 1;
            let seq = inner.seq;
            inner.heap.push(Reverse(Entry {
                time,
                seq,
                request: ScheduledRequest {
                    feed_id,
                    update_number,
                    time,
                },
            }));
        }
        self.changed.notify_one();
        Ok(())
    }

    /// Remove and return the earliest request if it is due at `now`
    pub fn pop_due(&self, now: i64) -> Option<ScheduledRequest> {
        let mut inner = self.lock();
        match inner.heap.peek() {
            Some(Reverse(entry)) if entry.time <= now => {
                inner.heap.pop().map(|Reverse(entry)| entry.request)
            }
            _ => None,
        }
    }

    /// Fire time of the earliest request
    pub fn next_time(&self) -> Option<i64> {
        self.lock().heap.peek().map(|Reverse(entry)| entry.time)
    }

    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop all pending requests and refuse new ones
    pub fn close(&self) {
        {
            let mut inner = self.lock();
            inner.closed = true;
            inner.heap.clear();
        }
        self.changed.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Wait until a request is pushed or the queue is closed
    pub async fn changed(&self) {
        self.changed.notified().await;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        // A poisoned heap is still structurally valid
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
