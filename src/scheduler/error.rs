//! Error types for the scheduler module

use crate::models::FeedId;
use std::fmt;

/// Result type for scheduler operations
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Request queue errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// Request queue reached its capacity
    QueueFull { feed_id: FeedId, capacity: usize },

    /// Request queue was closed by shutdown
    QueueClosed,
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QueueFull { feed_id, capacity } => {
                write!(
                    f,
                    "Request queue full ({} entries), feed {} not scheduled",
                    capacity, feed_id
                )
            }
            Self::QueueClosed => write!(f, "Request queue closed"),
        }
    }
}

impl std::error::Error for SchedulerError {}

impl SchedulerError {
    pub fn queue_full(feed_id: FeedId, capacity: usize) -> Self {
        Self::QueueFull { feed_id, capacity }
    }

    /// A full queue may drain; a closed one stays closed
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::QueueFull { .. })
    }
}
