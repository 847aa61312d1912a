//! Housekeeping triggers
//!
//! Three timers run next to the worker pool while a session is open:
//! - feed state push every `max_delay` seconds, sooner after a failure
//! - feed stat push every `period`, moved to `flush_prev_day` when it
//!   would cross midnight
//! - liveness ping every `poll_period`
//!
//! Each tick reschedules itself whatever its outcome. A `Logout` answer
//! from the manager ends the loop and raises the session's logout signal.

use anyhow::Result;
use chrono::NaiveTime;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

use crate::config::{Config, SavingFeedStatConfig, SavingFeedStateConfig};
use crate::coordinator::{PullerManager, UpstreamError};
use crate::crawler::pool::FeedWorkerPool;
use crate::metrics;
use crate::stats::next_stat_push_time;
use crate::storage::checkpoint::StatCache;

/// Why the housekeeping loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HousekeepingExit {
    Stopped,
    Logout,
}

/// Periodic pushes and pings for one session
pub struct Housekeeping {
    pool: FeedWorkerPool,
    manager: Arc<dyn PullerManager>,
    cache: StatCache,
    feed_state: SavingFeedStateConfig,
    feed_stat: SavingFeedStatConfig,
    poll_period: u64,
    flush_prev_day: NaiveTime,
    stat_failures: u32,
}

impl Housekeeping {
    pub fn new(
        config: &Config,
        pool: FeedWorkerPool,
        manager: Arc<dyn PullerManager>,
        cache: StatCache,
    ) -> Result<Self> {
        Ok(Self {
            pool,
            manager,
            cache,
            feed_state: config.saving_feed_state.clone(),
            feed_stat: config.saving_feed_stat.clone(),
            poll_period: config.manager.poll_period.max(1),
            flush_prev_day: config.flush_prev_day_time()?,
            stat_failures: 0,
        })
    }

    /// Seconds until the next state push
    pub fn state_push_delay(&self, success: bool) -> i64 {
        let delay = if success {
            self.feed_state.max_delay
        } else {
            self.feed_state.max_delay.min(self.feed_state.retry_timeout)
        };
        delay.max(1) as i64
    }

    /// Push pending feed state packs, or ping when there are none
    ///
    /// Returns whether the manager took everything. Only `Logout` is
    /// returned as an error.
    pub async fn push_feed_state(&self) -> Result<bool, UpstreamError> {
        let Some(session) = self.pool.session().await else {
            return Ok(false);
        };

        let mut packs = self.pool.take_pending().await;
        let mut failure = None;

        if packs.is_empty() {
            if let Err(e) = self.manager.ping(&session).await {
                failure = Some(e);
            }
        }

        while let Some(pack) = packs.pop_front() {
            match self.manager.feed_state(&session, &pack).await {
                Ok(true) => {
                    debug!(updates = pack.len(), "Feed state pack accepted");
                    self.pool.accumulate_stats(&pack).await;
                }
                Ok(false) => {
                    packs.push_front(pack);
                    failure = Some(UpstreamError::NotReady("feed state not accepted".into()));
                    break;
                }
                Err(e) => {
                    packs.push_front(pack);
                    failure = Some(e);
                    break;
                }
            }
        }

        if !packs.is_empty() {
            self.pool.restore_pending(packs).await;
        }

        let success = failure.is_none();
        self.pool.set_request_feeds(success).await;

        match failure {
            None => Ok(true),
            Some(UpstreamError::Logout) => {
                metrics::record_upstream_failure("feed_state");
                Err(UpstreamError::Logout)
            }
            Some(e) => {
                metrics::record_upstream_failure("feed_state");
                warn!(error = %e, kind = e.kind(), "Feed state push failed");
                Ok(false)
            }
        }
    }

    /// Push accumulated statistics packet by packet
    pub async fn push_feed_stat(&mut self) -> Result<bool, UpstreamError> {
        let Some(session) = self.pool.session().await else {
            return Ok(false);
        };

        let mut stats = self.pool.take_stats().await;
        if stats.is_empty() {
            return Ok(true);
        }

        let mut failure = None;
        while let Some(packet) = stats.next_packet(self.feed_stat.packet_size) {
            match self.manager.feed_stat(&session, &packet).await {
                Ok(()) => {
                    debug!(date = %packet.date, feeds = packet.feeds_stat.len(), "Feed stat packet accepted");
                    stats.remove_packet(&packet);
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        let Some(e) = failure else {
            self.stat_failures = 0;
            if let Err(e) = self.cache.delete() {
                error!(error = %e, "Failed to delete stat cache");
            }
            return Ok(true);
        };

        self.pool.restore_stats(stats).await;
        self.stat_failures += 1;
        metrics::record_upstream_failure("feed_stat");

        if matches!(e, UpstreamError::Logout) {
            return Err(e);
        }

        warn!(error = %e, failures = self.stat_failures, "Feed stat push failed");
        let threshold = self.feed_stat.persist_after_failures;
        if threshold > 0 && self.stat_failures >= threshold {
            self.persist_stats().await;
            self.stat_failures = 0;
        }
        Ok(false)
    }

    /// Write the accumulated statistics to the local cache
    pub async fn persist_stats(&self) {
        let stats = self.pool.tables().read().await.stats.clone();
        if let Err(e) = self.cache.save(&stats) {
            error!(error = %e, path = %self.cache.path().display(), "Failed to persist feed statistics");
        }
    }

    async fn ping(&self) -> Result<(), UpstreamError> {
        let Some(session) = self.pool.session().await else {
            return Ok(());
        };
        match self.manager.ping(&session).await {
            Ok(()) => Ok(()),
            Err(UpstreamError::Logout) => Err(UpstreamError::Logout),
            Err(e) => {
                metrics::record_upstream_failure("ping");
                warn!(error = %e, "Manager ping failed");
                Ok(())
            }
        }
    }

    /// Run until `stop` is raised or the manager asks for logout
    ///
    /// On a regular stop one last state push is attempted.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>, logout: Arc<Notify>) -> HousekeepingExit {
        let now = self.pool.now();
        let mut next_state = now + self.state_push_delay(true);
        let mut next_stat = next_stat_push_time(now, self.feed_stat.period.max(1) as i64, self.flush_prev_day);
        let mut next_ping = now + self.poll_period as i64;

        info!(
            state_every = self.feed_state.max_delay,
            stat_every = self.feed_stat.period,
            ping_every = self.poll_period,
            "Housekeeping started"
        );

        let exit = loop {
            if *stop.borrow() {
                break HousekeepingExit::Stopped;
            }

            let now = self.pool.now();
            let mut outcome = Ok(());

            if now >= next_state {
                let result = self.push_feed_state().await;
                let success = matches!(result, Ok(true));
                next_state = self.pool.now() + self.state_push_delay(success);
                outcome = result.map(|_| ());
            }

            if outcome.is_ok() && now >= next_stat {
                let result = self.push_feed_stat().await;
                let now = self.pool.now();
                next_stat = match result {
                    Ok(true) => next_stat_push_time(
                        now,
                        self.feed_stat.period.max(1) as i64,
                        self.flush_prev_day,
                    ),
                    _ => now + self.feed_stat.period.min(self.feed_stat.retry_timeout).max(1) as i64,
                };
                outcome = result.map(|_| ());
            }

            if outcome.is_ok() && now >= next_ping {
                outcome = self.ping().await;
                next_ping = self.pool.now() + self.poll_period as i64;
            }

            if outcome.is_err() {
                info!("Manager requested logout");
                logout.notify_one();
                break HousekeepingExit::Logout;
            }

            let wake = next_state.min(next_stat).min(next_ping);
            let wait = Duration::from_secs((wake - self.pool.now()).max(1) as u64);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = stop.changed() => {}
            }
        };

        if exit == HousekeepingExit::Stopped {
            if let Err(e) = self.push_feed_state().await {
                debug!(error = %e, "Final feed state push failed");
            }
        }
        exit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::fetcher::{FeedFetcher, FetchRequest, FetchResponse};
    use crate::models::{FeedStateUpdatePack, SessionId};
    use crate::stats::FeedsStatistics;
    use crate::utils::error::FetchError;
    use crate::utils::SystemClock;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct NoFetch;

    #[async_trait]
    impl FeedFetcher for NoFetch {
        async fn fetch(&self, _request: &FetchRequest) -> Result<FetchResponse, FetchError> {
            Err(FetchError::Timeout)
        }
    }

    #[derive(Default)]
    struct ScriptedManager {
        ping_error: Mutex<Option<UpstreamError>>,
        pings: Mutex<u32>,
    }

    #[async_trait]
    impl PullerManager for ScriptedManager {
        async fn login(&self) -> Result<SessionId, UpstreamError> {
            Ok(SessionId("s".into()))
        }
        async fn logout(&self, _session: &SessionId) -> Result<(), UpstreamError> {
            Ok(())
        }
        async fn ping(&self, _session: &SessionId) -> Result<(), UpstreamError> {
            *self.pings.lock().unwrap() += 1;
            match self.ping_error.lock().unwrap().take() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
        async fn feed_state(
            &self,
            _session: &SessionId,
            _pack: &FeedStateUpdatePack,
        ) -> Result<bool, UpstreamError> {
            Ok(true)
        }
        async fn feed_stat(
            &self,
            _session: &SessionId,
            _stats: &FeedsStatistics,
        ) -> Result<(), UpstreamError> {
            Ok(())
        }
    }

    async fn housekeeping(manager: Arc<ScriptedManager>, dir: &TempDir) -> Housekeeping {
        let config = Config::default();
        let pool = FeedWorkerPool::new(&config, Arc::new(NoFetch), Arc::new(SystemClock));
        pool.set_session(Some(SessionId("s".into()))).await;
        let cache = StatCache::new(&dir.path().join("stat.json"));
        Housekeeping::new(&config, pool, manager, cache).unwrap()
    }

    #[tokio::test]
    async fn test_empty_state_push_pings() {
        let dir = TempDir::new().unwrap();
        let manager = Arc::new(ScriptedManager::default());
        let hk = housekeeping(Arc::clone(&manager), &dir).await;

        assert!(hk.push_feed_state().await.unwrap());
        assert_eq!(*manager.pings.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failed_ping_stops_requesting() {
        let dir = TempDir::new().unwrap();
        let manager = Arc::new(ScriptedManager::default());
        *manager.ping_error.lock().unwrap() = Some(UpstreamError::NotReady("busy".into()));
        let hk = housekeeping(Arc::clone(&manager), &dir).await;

        assert!(!hk.push_feed_state().await.unwrap());
        assert!(!hk.pool.tables().read().await.request_feeds);

        assert!(hk.push_feed_state().await.unwrap());
        assert!(hk.pool.tables().read().await.request_feeds);
    }

    #[tokio::test]
    async fn test_logout_ping_is_error() {
        let dir = TempDir::new().unwrap();
        let manager = Arc::new(ScriptedManager::default());
        *manager.ping_error.lock().unwrap() = Some(UpstreamError::Logout);
        let hk = housekeeping(Arc::clone(&manager), &dir).await;

        assert!(matches!(hk.push_feed_state().await, Err(UpstreamError::Logout)));
    }

    #[tokio::test]
    async fn test_state_push_delay() {
        let dir = TempDir::new().unwrap();
        let hk = housekeeping(Arc::new(ScriptedManager::default()), &dir).await;
        let cfg = &hk.feed_state;
        assert_eq!(hk.state_push_delay(true), cfg.max_delay as i64);
        assert_eq!(
            hk.state_push_delay(false),
            cfg.max_delay.min(cfg.retry_timeout) as i64
        );
    }
}
