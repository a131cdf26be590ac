/// Queue Store
///
/// Per-user bounded backlog of events published while the user had no open
/// connection. Lossy under pressure: on overflow the oldest event is dropped.
/// In-memory only; lost on restart.
use super::{Event, UserId};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

/// Default backlog capacity per user
pub const DEFAULT_BACKLOG_CAPACITY: usize = 100;

/// Result of a single enqueue
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueueOutcome {
    /// Backlog length after the append
    pub backlog_len: usize,
    /// Oldest event evicted to make room, if any
    pub dropped: Option<Event>,
}

pub struct QueueStore {
    backlogs: DashMap<UserId, VecDeque<Event>>,
    capacity: usize,
    dropped_total: AtomicU64,
}

impl QueueStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            backlogs: DashMap::new(),
            capacity: capacity.max(1),
            dropped_total: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append an event, evicting the oldest one if over capacity
    pub fn enqueue(&self, user_id: UserId, event: Event) -> EnqueueOutcome {
        let mut backlog = self.backlogs.entry(user_id).or_default();
        backlog.push_back(event);

        let dropped = if backlog.len() > self.capacity {
            self.dropped_total.fetch_add(1, Ordering::Relaxed);
            backlog.pop_front()
        } else {
            None
        };

        EnqueueOutcome {
            backlog_len: backlog.len(),
            dropped,
        }
    }

    /// Atomically take and clear the user's full backlog, oldest first.
    ///
    /// A concurrent enqueue lands either in this drain or in the next one.
    pub fn drain(&self, user_id: &UserId) -> Vec<Event> {
        self.backlogs
            .remove(user_id)
            .map(|(_, backlog)| backlog.into())
            .unwrap_or_default()
    }

    pub fn len(&self, user_id: &UserId) -> usize {
        self.backlogs
            .get(user_id)
            .map(|backlog| backlog.len())
            .unwrap_or(0)
    }

    /// Number of users with a non-empty backlog
    pub fn user_count(&self) -> usize {
        self.backlogs.len()
    }

    pub fn total_events(&self) -> usize {
        self.backlogs.iter().map(|backlog| backlog.len()).sum()
    }

    /// Events evicted by overflow since construction
    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }
}

impl Default for QueueStore {
    fn default() -> Self {
        Self::new(DEFAULT_BACKLOG_CAPACITY)
    }
}
