//! Traffic-saving shortcuts replayed over a parsed channel
//!
//! A feed often tells us early that nothing changed: the channel
//! `lastBuildDate` matches the remembered one, the body has the same length
//! as last time, or the first new-looking item is preceded by more known
//! items than the feed's entropy allows. [`intercept`] walks the channel the
//! way a streaming parser would and stops at the first such signal.

use crate::config::SavingTrafficConfig;
use crate::models::{FeedRecord, HeaderLength, MessageCode, TriState};
use crate::parser::ParsedChannel;

/// Why reading a feed document stopped early
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseInterruption {
    SameLastBuildDate,
    SameContentLength,
    SameFirstChunkSize,
    OldMessagesLimitReached,
}

impl ParseInterruption {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SameLastBuildDate => "same_last_build_date",
            Self::SameContentLength => "same_content_length",
            Self::SameFirstChunkSize => "same_first_chunk_size",
            Self::OldMessagesLimitReached => "old_messages_limit_reached",
        }
    }
}

/// Body transfer facts observed by the fetcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferInfo {
    pub content_length: HeaderLength,
    /// Number of non-empty body chunks read
    pub chunks: u32,
    pub first_chunk_size: u64,
}

/// Which checks are armed for one request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InterceptorSetup {
    /// Remembered build date to compare against, 0 when disarmed
    pub last_build_date: i64,
    /// Current and previous Content-Length when both are known
    pub content_length: Option<(u64, u64)>,
    /// Previous single-chunk body size
    pub prev_first_chunk_size: Option<u64>,
    /// Known items tolerated before the document is considered stale
    pub old_messages_limit: Option<u32>,
    /// Newest-first message codes the ordering check compares against
    pub last_messages: Vec<MessageCode>,
    /// The heuristics sequence is currently running
    pub heuristics_active: bool,
    /// A same-build-date stop counts as a heuristic application
    pub last_build_date_as_heuristics: bool,
}

impl InterceptorSetup {
    /// Arm the checks for `record` according to the traffic settings
    pub fn new(record: &FeedRecord, transfer: &TransferInfo, config: &SavingTrafficConfig) -> Self {
        let heuristics = &config.heuristics;
        let state = &record.state;
        let counter = state.heuristics_counter;
        let heuristics_active = counter >= 0 && counter < heuristics.sequence_len;
        let last_build_date_as_heuristics = config.last_build_based > 1;

        let mut setup = Self {
            heuristics_active,
            last_build_date_as_heuristics,
            ..Default::default()
        };

        if config.last_build_based == 1 {
            setup.last_build_date = state.channel.last_build_date;
        }

        if !heuristics_active {
            return setup;
        }

        if last_build_date_as_heuristics {
            setup.last_build_date = state.channel.last_build_date;
        }

        if heuristics.content_length_based {
            if let (Some(current), Some(previous)) =
                (transfer.content_length.value(), state.http.content_length.value())
            {
                setup.content_length = Some((current, previous));
            }
        }

        if heuristics.single_chunk_based && state.http.single_chunked == TriState::Yes {
            setup.prev_first_chunk_size = state.http.first_chunk_size.filter(|size| *size > 0);
        }

        if heuristics.ordering_based {
            setup.old_messages_limit = Some(state.entropy);
            setup.last_messages = record.last_messages.clone();
        }

        setup
    }
}

/// Result of replaying the checks over a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interception {
    pub interruption: Option<ParseInterruption>,
    /// Items read before the stop; all of them on a full parse
    pub items_posted: usize,
    pub new_messages: u32,
    pub old_messages: u32,
}

impl Interception {
    /// A stop that counts as a heuristic application
    pub fn heuristics_applied(&self, setup: &InterceptorSetup) -> bool {
        match self.interruption {
            None => false,
            Some(ParseInterruption::SameLastBuildDate) => setup.last_build_date_as_heuristics,
            Some(_) => true,
        }
    }
}

/// Walk `channel` with the armed checks and report where reading stopped
pub fn intercept(
    setup: &InterceptorSetup,
    channel: &ParsedChannel,
    transfer: &TransferInfo,
) -> Interception {
    let mut result = Interception {
        items_posted: channel.items.len(),
        ..Default::default()
    };

    let stop = |mut result: Interception, reason, posted| {
        result.interruption = Some(reason);
        result.items_posted = posted;
        result
    };

    if channel.last_build_date != 0
        && setup.last_build_date != 0
        && channel.last_build_date == setup.last_build_date
    {
        return stop(result, ParseInterruption::SameLastBuildDate, 0);
    }
    if let Some(reason) = check_content_length(setup, transfer) {
        return stop(result, reason, 0);
    }

    for (index, item) in channel.items.iter().enumerate() {
        if let Some(limit) = setup.old_messages_limit {
            if setup.last_messages.iter().any(|m| m.id == item.id) {
                result.old_messages += 1;
                if result.old_messages > limit {
                    return stop(result, ParseInterruption::OldMessagesLimitReached, index + 1);
                }
            } else {
                result.new_messages += 1;
            }
        }
    }

    result
}

fn check_content_length(
    setup: &InterceptorSetup,
    transfer: &TransferInfo,
) -> Option<ParseInterruption> {
    if let Some((current, previous)) = setup.content_length {
        if current > 0 && current == previous {
            return Some(ParseInterruption::SameContentLength);
        }
    }

    if let Some(previous) = setup.prev_first_chunk_size {
        if transfer.chunks == 1
            && transfer.first_chunk_size > 0
            && transfer.first_chunk_size == previous
        {
            return Some(ParseInterruption::SameFirstChunkSize);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::models::{FeedDefinition, FeedId, FeedState, FeedStatus, FeedType, MessageId};
    use crate::parser::ParsedItem;

    fn record() -> FeedRecord {
        FeedRecord::from_definition(
            FeedDefinition {
                id: FeedId(1),
                status: FeedStatus::Active,
                url: "http://example.com/rss".into(),
                encoding: String::new(),
                feed_type: FeedType::Rss,
                space: 0,
                language: String::new(),
                country: String::new(),
                adjustment_script: String::new(),
                state: FeedState::default(),
                last_messages: Vec::new(),
            },
            1,
        )
    }

    fn channel(ids: &[u64], last_build_date: i64) -> ParsedChannel {
        ParsedChannel {
            feed_type: FeedType::Rss,
            last_build_date,
            items: ids
                .iter()
                .map(|id| ParsedItem {
                    id: MessageId(*id),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_same_last_build_date_stops_before_items() {
        let config = Config::default().saving_traffic;
        let mut rec = record();
        rec.state.heuristics_counter = -5;
        rec.state.channel.last_build_date = 1000;

        let transfer = TransferInfo::default();
        let setup = InterceptorSetup::new(&rec, &transfer, &config);
        assert!(!setup.heuristics_active);

        let result = intercept(&setup, &channel(&[1, 2], 1000), &transfer);
        assert_eq!(result.interruption, Some(ParseInterruption::SameLastBuildDate));
        assert_eq!(result.items_posted, 0);
        assert!(!result.heuristics_applied(&setup));
    }

    #[test]
    fn test_inactive_heuristics_parse_to_the_end() {
        let config = Config::default().saving_traffic;
        let mut rec = record();
        rec.state.heuristics_counter = -1;
        rec.state.http.content_length = HeaderLength::Value(500);

        let transfer = TransferInfo {
            content_length: HeaderLength::Value(500),
            chunks: 1,
            first_chunk_size: 500,
        };
        let setup = InterceptorSetup::new(&rec, &transfer, &config);
        let result = intercept(&setup, &channel(&[1, 2, 3], 0), &transfer);

        assert_eq!(result.interruption, None);
        assert_eq!(result.items_posted, 3);
    }

    #[test]
    fn test_same_content_length_when_active() {
        let config = Config::default().saving_traffic;
        let mut rec = record();
        rec.state.heuristics_counter = 0;
        rec.state.http.content_length = HeaderLength::Value(500);

        let transfer = TransferInfo {
            content_length: HeaderLength::Value(500),
            chunks: 3,
            first_chunk_size: 100,
        };
        let setup = InterceptorSetup::new(&rec, &transfer, &config);
        let result = intercept(&setup, &channel(&[1], 900), &transfer);

        assert_eq!(result.interruption, Some(ParseInterruption::SameContentLength));
        assert_eq!(result.items_posted, 0);
        assert!(result.heuristics_applied(&setup));
    }

    #[test]
    fn test_same_first_chunk_size() {
        let mut config = Config::default().saving_traffic;
        config.heuristics.ordering_based = false;
        let mut rec = record();
        rec.state.heuristics_counter = 2;
        rec.state.http.single_chunked = TriState::Yes;
        rec.state.http.first_chunk_size = Some(4096);

        let transfer = TransferInfo {
            content_length: HeaderLength::Absent,
            chunks: 1,
            first_chunk_size: 4096,
        };
        let setup = InterceptorSetup::new(&rec, &transfer, &config);
        let result = intercept(&setup, &channel(&[7, 8], 0), &transfer);

        assert_eq!(result.interruption, Some(ParseInterruption::SameFirstChunkSize));
        assert_eq!(result.items_posted, 0);
    }

    #[test]
    fn test_same_content_length_without_build_date() {
        let config = Config::default().saving_traffic;
        let mut rec = record();
        rec.state.heuristics_counter = 0;
        rec.state.http.content_length = HeaderLength::Value(500);
        rec.last_messages = vec![MessageCode::new(MessageId(1), 100)];

        let transfer = TransferInfo {
            content_length: HeaderLength::Value(500),
            chunks: 2,
            first_chunk_size: 250,
        };
        let setup = InterceptorSetup::new(&rec, &transfer, &config);
        // A new first item does not mask an unchanged body length
        let result = intercept(&setup, &channel(&[9, 1], 0), &transfer);

        assert_eq!(result.interruption, Some(ParseInterruption::SameContentLength));
        assert_eq!(result.items_posted, 0);
        assert_eq!(result.new_messages, 0);
    }

    #[test]
    fn test_old_messages_limit() {
        let config = Config::default().saving_traffic;
        let mut rec = record();
        rec.state.heuristics_counter = 0;
        rec.state.entropy = 1;
        rec.last_messages = vec![
            MessageCode::new(MessageId(2), 200),
            MessageCode::new(MessageId(3), 100),
        ];

        let transfer = TransferInfo::default();
        let setup = InterceptorSetup::new(&rec, &transfer, &config);
        let result = intercept(&setup, &channel(&[1, 2, 3, 4], 0), &transfer);

        assert_eq!(result.interruption, Some(ParseInterruption::OldMessagesLimitReached));
        assert_eq!(result.items_posted, 3);
        assert_eq!(result.new_messages, 1);
        assert_eq!(result.old_messages, 2);
    }

    #[test]
    fn test_counter_past_sequence_disarms_heuristics() {
        let config = Config::default().saving_traffic;
        let mut rec = record();
        rec.state.heuristics_counter = config.heuristics.sequence_len;
        rec.state.entropy = 0;
        rec.last_messages = vec![MessageCode::new(MessageId(1), 100)];

        let transfer = TransferInfo::default();
        let setup = InterceptorSetup::new(&rec, &transfer, &config);
        assert!(!setup.heuristics_active);
        assert_eq!(setup.old_messages_limit, None);

        let result = intercept(&setup, &channel(&[1, 2], 0), &transfer);
        assert_eq!(result.interruption, None);
    }
}
