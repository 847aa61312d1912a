//! Daily per-feed request statistics
//!
//! Request infos are folded into additive counters bucketed by the UTC day
//! of the request. The buckets are handed to the manager in packets and
//! dropped once accepted.

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::models::{FeedId, FeedRequestInfo, FeedRequestOutcome};

/// Counters for one feed on one day
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedStat {
    pub id: FeedId,
    pub requests: u64,
    pub failed: u64,
    pub unchanged: u64,
    pub not_modified: u64,
    pub presumably_unchanged: u64,
    pub has_changes: u64,
    /// Sum of per-request waste fractions
    pub wasted: f64,
    pub outbound: u64,
    pub inbound: u64,
    pub requests_duration_ms: u64,
    pub messages: u64,
    pub messages_size: u64,
    pub messages_delay: u64,
    pub max_message_delay: u64,
    /// Largest-magnitude clock skew seen
    pub mistiming: i64,
}

impl FeedStat {
    pub fn new(id: FeedId) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    /// Count one request
    pub fn add(&mut self, info: &FeedRequestInfo) {
        self.requests += 1;
        match info.outcome {
            FeedRequestOutcome::Failed => self.failed += 1,
            FeedRequestOutcome::NotModified => self.not_modified += 1,
            FeedRequestOutcome::PresumablyUnchanged => self.presumably_unchanged += 1,
            FeedRequestOutcome::HasChanges => self.has_changes += 1,
            FeedRequestOutcome::Unchanged => self.unchanged += 1,
            FeedRequestOutcome::Wasted => self.wasted += f64::from(info.wasted),
            FeedRequestOutcome::ParsedToTheEnd => {}
        }

        self.outbound += info.outbound;
        self.inbound += info.inbound;
        self.requests_duration_ms += info.duration_ms;
        self.messages += u64::from(info.messages);
        self.messages_size += info.messages_size;
        self.messages_delay += info.messages_delay;
        self.max_message_delay = self.max_message_delay.max(info.max_message_delay);
        if self.mistiming.abs() < info.mistiming.abs() {
            self.mistiming = info.mistiming;
        }
    }

    /// Fold another counter set for the same feed and day into this one
    pub fn merge(&mut self, other: &FeedStat) {
        self.requests += other.requests;
        self.failed += other.failed;
        self.unchanged += other.unchanged;
        self.not_modified += other.not_modified;
        self.presumably_unchanged += other.presumably_unchanged;
        self.has_changes += other.has_changes;
        self.wasted += other.wasted;
        self.outbound += other.outbound;
        self.inbound += other.inbound;
        self.requests_duration_ms += other.requests_duration_ms;
        self.messages += other.messages;
        self.messages_size += other.messages_size;
        self.messages_delay += other.messages_delay;
        self.max_message_delay = self.max_message_delay.max(other.max_message_delay);
        if self.mistiming.abs() < other.mistiming.abs() {
            self.mistiming = other.mistiming;
        }
    }
}

/// One packet of statistics for a single day
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedsStatistics {
    pub date: NaiveDate,
    pub feeds_stat: Vec<FeedStat>,
}

/// Accumulates statistics until the manager accepts them
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatAccumulator {
    days: BTreeMap<NaiveDate, BTreeMap<FeedId, FeedStat>>,
    retained_days: usize,
}

impl StatAccumulator {
    pub fn new(retained_days: usize) -> Self {
        Self {
            days: BTreeMap::new(),
            retained_days,
        }
    }

    /// Add request infos of an accepted state pack
    pub fn accumulate(&mut self, requests: &[FeedRequestInfo]) {
        for info in requests {
            let date = day_of(info.request_time);
            self.days
                .entry(date)
                .or_default()
                .entry(info.feed_id)
                .or_insert_with(|| FeedStat::new(info.feed_id))
                .add(info);
        }
        self.prune();
    }

    /// Merge counters back, e.g. after a failed push or from the cache
    pub fn merge(&mut self, other: StatAccumulator) {
        for (date, feeds) in other.days {
            let day = self.days.entry(date).or_default();
            for (id, stat) in feeds {
                day.entry(id)
                    .and_modify(|s| s.merge(&stat))
                    .or_insert(stat);
            }
        }
        self.prune();
    }

    /// Take everything, leaving the accumulator empty
    pub fn take(&mut self) -> StatAccumulator {
        StatAccumulator {
            days: std::mem::take(&mut self.days),
            retained_days: self.retained_days,
        }
    }

    /// Up to `packet_size` feeds of the oldest day
    pub fn next_packet(&self, packet_size: usize) -> Option<FeedsStatistics> {
        let (date, feeds) = self.days.iter().next()?;
        Some(FeedsStatistics {
            date: *date,
            feeds_stat: feeds.values().take(packet_size.max(1)).cloned().collect(),
        })
    }

    /// Forget a packet the manager accepted
    pub fn remove_packet(&mut self, packet: &FeedsStatistics) {
        if let Some(feeds) = self.days.get_mut(&packet.date) {
            for stat in &packet.feeds_stat {
                feeds.remove(&stat.id);
            }
            if feeds.is_empty() {
                self.days.remove(&packet.date);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }

    pub fn days(&self) -> usize {
        self.days.len()
    }

    pub fn get(&self, date: NaiveDate, id: FeedId) -> Option<&FeedStat> {
        self.days.get(&date).and_then(|feeds| feeds.get(&id))
    }

    /// All buckets as packets of unlimited size
    pub fn to_statistics(&self) -> Vec<FeedsStatistics> {
        self.days
            .iter()
            .map(|(date, feeds)| FeedsStatistics {
                date: *date,
                feeds_stat: feeds.values().cloned().collect(),
            })
            .collect()
    }

    pub fn from_statistics(stats: Vec<FeedsStatistics>, retained_days: usize) -> Self {
        let mut acc = Self::new(retained_days);
        for packet in stats {
            let day = acc.days.entry(packet.date).or_default();
            for stat in packet.feeds_stat {
                day.entry(stat.id)
                    .and_modify(|s| s.merge(&stat))
                    .or_insert(stat);
            }
        }
        acc.prune();
        acc
    }

    /// Drop the oldest days beyond the retention limit
    fn prune(&mut self) {
        if self.retained_days == 0 {
            return;
        }
        while self.days.len() > self.retained_days {
            if let Some((date, feeds)) = self.days.pop_first() {
                tracing::warn!(%date, feeds = feeds.len(), "Dropping unsent feed statistics");
            }
        }
    }
}

/// UTC day of an epoch timestamp
pub fn day_of(secs: i64) -> NaiveDate {
    DateTime::from_timestamp(secs, 0)
        .map(|t| t.date_naive())
        .unwrap_or_default()
}

/// When the next stat push should run
///
/// A push crossing midnight is moved to `flush_prev_day` of the next day so
/// the finished day is sent as a whole.
pub fn next_stat_push_time(now: i64, delay: i64, flush_prev_day: NaiveTime) -> i64 {
    let next = now + delay;
    let today = day_of(now);
    if day_of(next) > today {
        let tomorrow = today + ChronoDuration::days(1);
        return tomorrow.and_time(flush_prev_day).and_utc().timestamp();
    }
    next
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2024-01-01T00:00:00Z
    const DAY: i64 = 1_704_067_200;

    fn info(feed: u64, time: i64, outcome: FeedRequestOutcome) -> FeedRequestInfo {
        let mut info = FeedRequestInfo::new(FeedId(feed), time);
        info.outcome = outcome;
        info.inbound = 100;
        info
    }

    #[test]
    fn test_accumulate_by_day_and_feed() {
        let mut acc = StatAccumulator::new(7);
        acc.accumulate(&[
            info(1, DAY + 10, FeedRequestOutcome::Failed),
            info(1, DAY + 20, FeedRequestOutcome::NotModified),
            info(2, DAY + 30, FeedRequestOutcome::HasChanges),
            info(1, DAY + 86_400, FeedRequestOutcome::Unchanged),
        ]);

        let date = day_of(DAY);
        let stat = acc.get(date, FeedId(1)).unwrap();
        assert_eq!(stat.requests, 2);
        assert_eq!(stat.failed, 1);
        assert_eq!(stat.not_modified, 1);
        assert_eq!(stat.inbound, 200);
        assert_eq!(acc.days(), 2);
    }

    #[test]
    fn test_wasted_and_mistiming() {
        let mut acc = StatAccumulator::new(7);
        let mut a = info(1, DAY, FeedRequestOutcome::Wasted);
        a.wasted = 0.25;
        a.mistiming = 30;
        let mut b = info(1, DAY, FeedRequestOutcome::Wasted);
        b.wasted = 1.0;
        b.mistiming = -90;
        let mut c = info(1, DAY, FeedRequestOutcome::ParsedToTheEnd);
        c.mistiming = 60;
        acc.accumulate(&[a, b, c]);

        let stat = acc.get(day_of(DAY), FeedId(1)).unwrap();
        assert!((stat.wasted - 1.25).abs() < 1e-9);
        assert_eq!(stat.mistiming, -90);
    }

    #[test]
    fn test_packets_and_removal() {
        let mut acc = StatAccumulator::new(7);
        acc.accumulate(&[
            info(1, DAY, FeedRequestOutcome::Failed),
            info(2, DAY, FeedRequestOutcome::Failed),
            info(3, DAY, FeedRequestOutcome::Failed),
        ]);

        let packet = acc.next_packet(2).unwrap();
        assert_eq!(packet.feeds_stat.len(), 2);
        acc.remove_packet(&packet);

        let packet = acc.next_packet(2).unwrap();
        assert_eq!(packet.feeds_stat.len(), 1);
        assert_eq!(packet.feeds_stat[0].id, FeedId(3));
        acc.remove_packet(&packet);
        assert!(acc.is_empty());
    }

    #[test]
    fn test_merge_adds_counters() {
        let mut acc = StatAccumulator::new(7);
        acc.accumulate(&[info(1, DAY, FeedRequestOutcome::Failed)]);
        let taken = acc.take();
        assert!(acc.is_empty());

        acc.accumulate(&[info(1, DAY, FeedRequestOutcome::Failed)]);
        acc.merge(taken);
        assert_eq!(acc.get(day_of(DAY), FeedId(1)).unwrap().requests, 2);
    }

    #[test]
    fn test_retention_drops_oldest_days() {
        let mut acc = StatAccumulator::new(2);
        for day in 0..4 {
            acc.accumulate(&[info(1, DAY + day * 86_400, FeedRequestOutcome::Failed)]);
        }
        assert_eq!(acc.days(), 2);
        assert!(acc.get(day_of(DAY), FeedId(1)).is_none());
        assert!(acc.get(day_of(DAY + 3 * 86_400), FeedId(1)).is_some());
    }

    #[test]
    fn test_next_push_time_same_day() {
        let flush = NaiveTime::from_hms_opt(0, 10, 0).unwrap();
        assert_eq!(next_stat_push_time(DAY + 3600, 600, flush), DAY + 4200);
    }

    #[test]
    fn test_next_push_time_crosses_midnight() {
        let flush = NaiveTime::from_hms_opt(0, 10, 0).unwrap();
        let now = DAY + 86_400 - 100;
        assert_eq!(next_stat_push_time(now, 600, flush), DAY + 86_400 + 600);
    }
}
