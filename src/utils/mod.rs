//! Common utilities and helper functions
//!
//! Time access goes through [`Clock`] so the worker pool can run on tokio's
//! paused clock in tests.

pub mod error;
pub mod retry;

use crate::models::MessageId;
use sha2::{Digest, Sha256};

/// Source of the current time in epoch seconds
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// Clock anchored at a fixed epoch time and advanced by tokio's timer
///
/// Under a paused tokio runtime it moves only when the runtime auto-advances,
/// which keeps epoch-second scheduling and timer sleeps consistent in tests.
#[derive(Debug, Clone)]
pub struct TokioClock {
    base: i64,
    start: tokio::time::Instant,
}

impl TokioClock {
    pub fn new(base: i64) -> Self {
        Self {
            base,
            start: tokio::time::Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now(&self) -> i64 {
        self.base + self.start.elapsed().as_secs() as i64
    }
}

/// Stable message id from an item key (guid, link or title)
pub fn message_id(key: &str) -> MessageId {
    let digest = Sha256::digest(key.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    MessageId(u64::from_be_bytes(bytes))
}

/// Truncate text to at most `max_chars` characters
pub fn truncate_text(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// Format an epoch timestamp for log output
pub fn format_time(secs: i64) -> String {
    chrono::DateTime::from_timestamp(secs, 0)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| secs.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_id_is_stable() {
        let a = message_id("http://example.com/item/1");
        let b = message_id("http://example.com/item/1");
        let c = message_id("http://example.com/item/2");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_clock_follows_paused_time() {
        let clock = TokioClock::new(1000);
        assert_eq!(clock.now(), 1000);
        tokio::time::sleep(std::time::Duration::from_secs(90)).await;
        assert_eq!(clock.now(), 1090);
    }

    #[test]
    fn test_truncate_text() {
        assert_eq!(truncate_text("short", 10), "short");
        assert_eq!(truncate_text("very long text here", 9), "very long");
        assert_eq!(truncate_text("가나다라", 2), "가나");
    }

    #[test]
    fn test_format_time() {
        assert_eq!(format_time(0), "1970-01-01T00:00:00+00:00");
    }
}
