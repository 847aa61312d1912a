//! Next-request time computation
//!
//! [`RequestScheduler::next_request`] is a pure function of the feed record,
//! the request type and the current time. It blends three signals: the
//! observed gaps between message publication times, the channel TTL, and
//! the configured min/max bounds around the last request.

use crate::config::Config;
use crate::models::{FeedRecord, ScheduleRequestType};
use serde::{Deserialize, Serialize};

/// Tunables for schedule computation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulePolicy {
    pub delay_on_failure: i64,
    pub approximate_msg_intervals: usize,
    pub default_period: i64,
    pub message_period_factor: f64,
    pub min_period: i64,
    pub max_period: i64,
}

impl SchedulePolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            delay_on_failure: config.saving_feed_state.delay_on_failure,
            approximate_msg_intervals: config.feed_request.approximate_msg_intervals,
            default_period: config.feed_request.default_period,
            message_period_factor: config.feed_request.message_period_factor,
            min_period: config.feed_request.min_period,
            max_period: config.feed_request.max_period,
        }
    }
}

impl Default for SchedulePolicy {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Result of a schedule computation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleDecision {
    /// When the next request should fire
    pub request_time: i64,

    /// Value to store back into the record's `no_message_request_time`
    pub no_message_request_time: i64,

    /// The previous forecast already lies in the past
    pub forecast_failed: bool,
}

/// Computes when a feed should be requested next
#[derive(Debug, Clone, Default)]
pub struct RequestScheduler {
    policy: SchedulePolicy,
}

impl RequestScheduler {
    pub fn new(policy: SchedulePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &SchedulePolicy {
        &self.policy
    }

    /// Compute the next request time for `record`
    pub fn next_request(
        &self,
        record: &FeedRecord,
        request_type: ScheduleRequestType,
        now: i64,
    ) -> ScheduleDecision {
        let policy = &self.policy;
        let state = &record.state;
        let mut decision = ScheduleDecision {
            request_time: now,
            no_message_request_time: record.no_message_request_time,
            forecast_failed: false,
        };

        if request_type == ScheduleRequestType::SkippedRequest {
            decision.request_time = now + policy.delay_on_failure;
            return decision;
        }

        let last_request_date = state.last_request_date;
        if last_request_date == 0 {
            if request_type != ScheduleRequestType::FirstRequest {
                decision.request_time = now + policy.delay_on_failure;
            }
            return decision;
        }

        let (avg_time, mut last_message_time) = self.message_cadence(record, now);

        let ttl = i64::from(state.channel.ttl) * 60;
        let mut message_period = match (ttl, avg_time) {
            (0, avg) => avg,
            (ttl, 0) => ttl,
            (ttl, avg) => ttl.min(avg),
        };

        message_period = if message_period != 0 {
            (message_period as f64 * policy.message_period_factor) as i64
        } else {
            policy.default_period
        };

        if last_message_time == 0 {
            if decision.no_message_request_time == 0 {
                decision.no_message_request_time = now;
            }
            let nmrt = decision.no_message_request_time;
            let last_build_date = state.channel.last_build_date;
            last_message_time = if last_build_date != 0 {
                last_build_date.min(nmrt)
            } else {
                nmrt
            };
        } else {
            decision.no_message_request_time = 0;
        }

        last_message_time = last_message_time.min(now);

        let base = if last_message_time == 0 {
            now
        } else {
            last_message_time
        };
        let mut request_time = base + message_period;

        if request_type == ScheduleRequestType::FirstRequest
            && request_time < now
            && request_time < last_request_date
        {
            let mut delay = last_request_date - request_time;
            if ttl != 0 {
                delay = delay.min(ttl);
            }
            request_time = last_request_date + delay;
        }

        if request_time < now {
            if request_type == ScheduleRequestType::FirstRequest {
                request_time = now;
            } else {
                let mut delay = now - request_time;
                if ttl != 0 && ttl < delay {
                    delay = (ttl + delay) / 2;
                }
                request_time = now + delay;
                decision.forecast_failed = true;
            }
        }

        request_time = request_time.min(last_request_date + policy.max_period);
        request_time = request_time.max(last_request_date + policy.min_period);

        decision.request_time = request_time;
        decision
    }

    /// Average gap between recent distinct publication times, and the
    /// newest publication time
    fn message_cadence(&self, record: &FeedRecord, now: i64) -> (i64, i64) {
        let messages = &record.last_messages;
        let Some(first) = messages.first() else {
            return (0, 0);
        };

        let mut last_message_time = first.published;
        let mut intervals = (messages.len() - 1).min(self.policy.approximate_msg_intervals);
        if intervals == 0 {
            return (0, last_message_time);
        }

        let mut dates: Vec<i64> = Vec::with_capacity(messages.len());
        for message in messages {
            let published = message.published.min(now);
            if published == 0 {
                continue;
            }
            last_message_time = last_message_time.max(published);
            dates.push(published);
        }

        dates.sort_unstable_by(|a, b| b.cmp(a));
        dates.dedup();

        intervals = intervals.min(dates.len().saturating_sub(1));
        if intervals == 0 {
            return (0, last_message_time);
        }

        let avg_time = (dates[0] - dates[intervals]) / intervals as i64;
        (avg_time, last_message_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FeedDefinition, FeedId, FeedState, FeedStatus, FeedType, MessageCode, MessageId};

    const NOW: i64 = 1_700_000_000;

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

    fn policy() -> SchedulePolicy {
        SchedulePolicy {
            delay_on_failure: 600,
            approximate_msg_intervals: 5,
            default_period: 3600,
            message_period_factor: 0.5,
            min_period: 60,
            max_period: 86_400,
        }
    }

    fn messages(newest: i64, step: i64, count: usize) -> Vec<MessageCode> {
        (0..count)
            .map(|i| MessageCode::new(MessageId(i as u64 + 1), newest - step * i as i64))
            .collect()
    }

    #[test]
    fn test_skipped_request_backs_off() {
        let scheduler = RequestScheduler::new(policy());
        let mut rec = record();
        rec.state.last_request_date = NOW - 10;
        rec.last_messages = messages(NOW - 100, 60, 5);

        let decision = scheduler.next_request(&rec, ScheduleRequestType::SkippedRequest, NOW);
        assert_eq!(decision.request_time, NOW + 600);
    }

    #[test]
    fn test_first_request_never_requested_fires_now() {
        let scheduler = RequestScheduler::new(policy());
        let mut rec = record();
        rec.state.channel.ttl = 60;

        let decision = scheduler.next_request(&rec, ScheduleRequestType::FirstRequest, NOW);
        assert_eq!(decision.request_time, NOW);
    }

    #[test]
    fn test_regular_never_requested_retries_later() {
        let scheduler = RequestScheduler::new(policy());
        let decision = scheduler.next_request(&record(), ScheduleRequestType::Regular, NOW);
        assert_eq!(decision.request_time, NOW + 600);
    }

    #[test]
    fn test_message_period_from_intervals() {
        let scheduler = RequestScheduler::new(policy());
        let mut rec = record();
        rec.state.last_request_date = NOW;
        rec.last_messages = messages(NOW - 60, 600, 5);

        let decision = scheduler.next_request(&rec, ScheduleRequestType::Regular, NOW);
        // avg 600s scaled by 0.5, past due by 0: (NOW - 60) + 300
        assert_eq!(decision.request_time, NOW - 60 + 300);
        assert!(!decision.forecast_failed);
        assert_eq!(decision.no_message_request_time, 0);
    }

    #[test]
    fn test_ttl_caps_message_period() {
        let scheduler = RequestScheduler::new(policy());
        let mut rec = record();
        rec.state.last_request_date = NOW;
        rec.state.channel.ttl = 5;
        rec.last_messages = messages(NOW, 3600, 5);

        let decision = scheduler.next_request(&rec, ScheduleRequestType::Regular, NOW);
        // min(300, 3600) * 0.5 = 150
        assert_eq!(decision.request_time, NOW + 150);
    }

    #[test]
    fn test_no_messages_uses_default_period_and_records_time() {
        let scheduler = RequestScheduler::new(policy());
        let mut rec = record();
        rec.state.last_request_date = NOW - 10;

        let decision = scheduler.next_request(&rec, ScheduleRequestType::Regular, NOW);
        assert_eq!(decision.no_message_request_time, NOW);
        assert_eq!(decision.request_time, NOW + 3600);
    }

    #[test]
    fn test_no_messages_prefers_older_last_build_date() {
        let scheduler = RequestScheduler::new(policy());
        let mut rec = record();
        rec.state.last_request_date = NOW - 10;
        rec.no_message_request_time = NOW - 1000;
        rec.state.channel.last_build_date = NOW - 2000;

        let decision = scheduler.next_request(&rec, ScheduleRequestType::Regular, NOW);
        assert_eq!(decision.no_message_request_time, NOW - 1000);
        // NOW - 2000 + 3600
        assert_eq!(decision.request_time, NOW + 1600);
    }

    #[test]
    fn test_forecast_failure_averages_with_ttl() {
        let scheduler = RequestScheduler::new(policy());
        let mut rec = record();
        rec.state.last_request_date = NOW - 100;
        rec.state.channel.ttl = 10;
        // Single message long ago: period = ttl * factor = 300
        rec.last_messages = vec![MessageCode::new(MessageId(1), NOW - 10_000)];

        let decision = scheduler.next_request(&rec, ScheduleRequestType::Regular, NOW);
        // delay = 10_000 - 300 = 9700 > ttl 600: (600 + 9700) / 2 = 5150
        assert!(decision.forecast_failed);
        assert_eq!(decision.request_time, NOW + 5150);
    }

    #[test]
    fn test_first_request_catch_up_steps_from_last_request() {
        let scheduler = RequestScheduler::new(policy());
        let mut rec = record();
        rec.state.last_request_date = NOW - 100;
        rec.state.channel.ttl = 1;
        rec.last_messages = vec![MessageCode::new(MessageId(1), NOW - 5000)];

        let decision = scheduler.next_request(&rec, ScheduleRequestType::FirstRequest, NOW);
        // request = NOW - 5000 + 30; delay = min(60, 4870) = 60; NOW - 100 + 60 < NOW -> NOW
        assert_eq!(decision.request_time, NOW);
    }

    #[test]
    fn test_bounds_clamp() {
        let mut p = policy();
        p.min_period = 1000;
        p.max_period = 2000;
        let scheduler = RequestScheduler::new(p);
        let mut rec = record();
        rec.state.last_request_date = NOW;

        rec.last_messages = messages(NOW, 10, 5);
        let early = scheduler.next_request(&rec, ScheduleRequestType::Regular, NOW);
        assert_eq!(early.request_time, NOW + 1000);

        rec.last_messages = messages(NOW, 100_000, 5);
        let late = scheduler.next_request(&rec, ScheduleRequestType::Regular, NOW);
        assert_eq!(late.request_time, NOW + 2000);
    }

    #[test]
    fn test_future_dates_clamped_to_now() {
        let scheduler = RequestScheduler::new(policy());
        let mut rec = record();
        rec.state.last_request_date = NOW;
        rec.last_messages = vec![
            MessageCode::new(MessageId(1), NOW + 10_000),
            MessageCode::new(MessageId(2), NOW - 600),
        ];

        let decision = scheduler.next_request(&rec, ScheduleRequestType::Regular, NOW);
        // Dates {NOW, NOW - 600}: avg 600 -> 300
        assert_eq!(decision.request_time, NOW + 300);
    }

    #[test]
    fn test_duplicate_dates_collapse() {
        let scheduler = RequestScheduler::new(policy());
        let mut rec = record();
        rec.state.last_request_date = NOW;
        rec.last_messages = vec![
            MessageCode::new(MessageId(1), NOW - 100),
            MessageCode::new(MessageId(2), NOW - 100),
            MessageCode::new(MessageId(3), NOW - 100),
        ];

        let decision = scheduler.next_request(&rec, ScheduleRequestType::Regular, NOW);
        // Single distinct date: no average, default period applies
        assert_eq!(decision.request_time, NOW - 100 + 3600);
    }

    #[test]
    fn test_deterministic() {
        let scheduler = RequestScheduler::new(policy());
        let mut rec = record();
        rec.state.last_request_date = NOW - 50;
        rec.last_messages = messages(NOW - 400, 321, 7);

        let a = scheduler.next_request(&rec, ScheduleRequestType::Regular, NOW);
        let b = scheduler.next_request(&rec, ScheduleRequestType::Regular, NOW);
        assert_eq!(a, b);
    }
}
