//! Feed worker pool
//!
//! Scheduled feed requests wait in a [`RequestQueue`]. A dispatcher task
//! hands the due ones to a fixed set of workers through a bounded channel.
//! Each worker fetches on a snapshot of the feed record, classifies the
//! result outside any lock, then merges it back under the table lock and
//! reschedules the feed.
//!
//! ```text
//! ┌──────────────┐   due    ┌────────────┐  mpsc   ┌──────────┐
//! │ RequestQueue │ ───────▶ │ Dispatcher │ ──────▶ │ Worker N │──┐
//! └──────────────┘          └────────────┘         └──────────┘  │
//!        ▲                                                       │
//!        └────────────── reschedule ◀── merge into PullerTables ◀┘
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::classifier::OutcomeClassifier;
use super::fetcher::{FeedFetcher, FetchRequest};
use crate::config::Config;
use crate::metrics;
use crate::models::{
    FeedId, FeedPack, FeedRecord, FeedRequestInfo, FeedStateUpdate, FeedStateUpdatePack,
    FeedStatus, FeedType, ScheduleRequestType, SessionId,
};
use crate::scheduler::error::SchedulerError;
use crate::scheduler::queue::{RequestQueue, ScheduledRequest};
use crate::scheduler::request::{RequestScheduler, SchedulePolicy};
use crate::stats::StatAccumulator;
use crate::utils::error::FetchError;
use crate::utils::Clock;

/// Longest the dispatcher sleeps with an empty queue
const IDLE_WAIT: Duration = Duration::from_secs(60);

/// State shared by the workers, the control server and housekeeping
#[derive(Debug)]
pub struct PullerTables {
    pub feeds: HashMap<FeedId, FeedRecord>,
    /// Results not yet accepted by the manager, oldest first
    pub pending: VecDeque<FeedStateUpdatePack>,
    /// Bumped on every accepted feed pack
    pub accept_counter: u64,
    /// Whether the last state push went through
    pub request_feeds: bool,
    pub session: Option<SessionId>,
    pub stats: StatAccumulator,
}

impl PullerTables {
    fn new(retained_days: usize) -> Self {
        Self {
            feeds: HashMap::new(),
            pending: VecDeque::new(),
            accept_counter: 0,
            request_feeds: true,
            session: None,
            stats: StatAccumulator::new(retained_days),
        }
    }

    fn push_result(&mut self, update: FeedStateUpdate, info: FeedRequestInfo, packet_size: usize) {
        match self.pending.back_mut() {
            Some(pack) if pack.len() < packet_size => {
                pack.updates.push(update);
                pack.requests.push(info);
            }
            _ => self.pending.push_back(FeedStateUpdatePack {
                updates: vec![update],
                requests: vec![info],
            }),
        }
    }

    /// Updates waiting for the manager
    pub fn pending_updates(&self) -> usize {
        self.pending.iter().map(FeedStateUpdatePack::len).sum()
    }
}

/// What happened to a feed pack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptOutcome {
    Accepted {
        added: usize,
        updated: usize,
        removed: usize,
    },
    /// Pack belongs to another session; the puller must log out
    SessionMismatch,
}

struct PoolInner {
    tables: RwLock<PullerTables>,
    queue: RequestQueue,
    fetcher: Arc<dyn FeedFetcher>,
    clock: Arc<dyn Clock>,
    scheduler: RequestScheduler,
    classifier: OutcomeClassifier,
    threads: usize,
    packet_size: usize,
    /// Initial heuristics counter of a never-requested feed
    warmup_counter: i32,
    /// Requests the queue had no room for
    overflow: std::sync::Mutex<Vec<ScheduledRequest>>,
    overflowed: Notify,
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

/// Schedules, fetches and tracks feeds
#[derive(Clone)]
pub struct FeedWorkerPool {
    inner: Arc<PoolInner>,
}

impl FeedWorkerPool {
    pub fn new(config: &Config, fetcher: Arc<dyn FeedFetcher>, clock: Arc<dyn Clock>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let heuristics = &config.saving_traffic.heuristics;

        Self {
            inner: Arc::new(PoolInner {
                tables: RwLock::new(PullerTables::new(config.saving_feed_stat.retained_days)),
                queue: RequestQueue::new(config.feed_request.queue_capacity),
                fetcher,
                clock,
                scheduler: RequestScheduler::new(SchedulePolicy::from_config(config)),
                classifier: OutcomeClassifier::new(config),
                threads: config.feed_request.threads.max(1),
                packet_size: config.saving_feed_state.packet_size.max(1),
                warmup_counter: -(heuristics.apply_after + heuristics.calc_entropy_after),
                overflow: std::sync::Mutex::new(Vec::new()),
                overflowed: Notify::new(),
                shutdown_tx,
                handles: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn tables(&self) -> &RwLock<PullerTables> {
        &self.inner.tables
    }

    pub fn queue(&self) -> &RequestQueue {
        &self.inner.queue
    }

    pub fn now(&self) -> i64 {
        self.inner.clock.now()
    }

    pub fn is_stopped(&self) -> bool {
        *self.inner.shutdown_tx.borrow()
    }

    pub async fn set_session(&self, session: Option<SessionId>) {
        self.inner.tables.write().await.session = session;
    }

    pub async fn session(&self) -> Option<SessionId> {
        self.inner.tables.read().await.session.clone()
    }

    /// Queue a request for `feed_id` at `time`
    ///
    /// A request the queue has no room for is parked and handed to the
    /// dispatcher directly, so a tracked feed is never left unscheduled.
    pub fn schedule_at(&self, feed_id: FeedId, update_number: u64, time: i64) {
        match self.inner.queue.push(feed_id, update_number, time) {
            Ok(()) => {}
            Err(SchedulerError::QueueClosed) => {
                debug!(feed_id = %feed_id, "Not scheduling, pool stopped");
            }
            Err(e @ SchedulerError::QueueFull { .. }) => {
                warn!(feed_id = %feed_id, error = %e, "Request queue full, parking feed request");
                metrics::record_invariant_violation("queue_overflow");
                self.lock_overflow().push(ScheduledRequest {
                    feed_id,
                    update_number,
                    time,
                });
                self.inner.overflowed.notify_one();
            }
        }
    }

    /// Requests parked while the queue was full
    pub fn overflow_len(&self) -> usize {
        self.lock_overflow().len()
    }

    fn lock_overflow(&self) -> std::sync::MutexGuard<'_, Vec<ScheduledRequest>> {
        self.inner.overflow.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take the parked requests due at `now` and move the rest back into
    /// the queue while it has room
    fn drain_overflow(&self, now: i64) -> Vec<ScheduledRequest> {
        let mut overflow = self.lock_overflow();
        let mut due = Vec::new();
        let mut parked = Vec::new();
        for request in overflow.drain(..) {
            if request.time <= now {
                due.push(request);
            } else if self
                .inner
                .queue
                .push(request.feed_id, request.update_number, request.time)
                .is_err()
            {
                parked.push(request);
            }
        }
        *overflow = parked;
        due.sort_by_key(|request| request.time);
        due
    }

    fn next_overflow_time(&self) -> Option<i64> {
        self.lock_overflow().iter().map(|request| request.time).min()
    }

    pub fn schedule_now(&self, feed_id: FeedId, update_number: u64) {
        self.schedule_at(feed_id, update_number, self.now());
    }

    /// Merge a feed pack delivered by the manager
    pub async fn accept_feeds(&self, pack: FeedPack) -> AcceptOutcome {
        let now = self.now();
        let mut to_schedule = Vec::new();
        let (mut added, mut updated, mut removed) = (0, 0, 0);

        let tracked = {
            let mut tables = self.inner.tables.write().await;
            if tables.session.as_ref() != Some(&pack.session) {
                warn!(
                    session = %pack.session,
                    current = ?tables.session,
                    "Feed pack for a foreign session"
                );
                return AcceptOutcome::SessionMismatch;
            }

            tables.accept_counter += 1;
            let update_number = tables.accept_counter;

            for def in pack.feeds {
                if def.status != FeedStatus::Active {
                    if tables.feeds.remove(&def.id).is_some() {
                        debug!(feed_id = %def.id, "Feed removed");
                        removed += 1;
                    }
                    continue;
                }

                if let Some(record) = tables.feeds.get_mut(&def.id) {
                    let url_changed = record.url != def.url;
                    record.encoding = def.encoding;
                    record.feed_type = def.feed_type;
                    record.space = def.space;
                    record.language = def.language;
                    record.country = def.country;
                    record.adjustment_script = def.adjustment_script;
                    updated += 1;

                    if url_changed {
                        info!(feed_id = %def.id, old = %record.url, new = %def.url, "Feed URL changed");
                        record.url = def.url;
                        record.reset_state();
                        record.state.heuristics_counter = self.inner.warmup_counter;
                        record.update_number = update_number;
                        let decision = self.inner.scheduler.next_request(
                            record,
                            ScheduleRequestType::FirstRequest,
                            now,
                        );
                        record.no_message_request_time = decision.no_message_request_time;
                        to_schedule.push((record.id, update_number, decision.request_time));
                    } else if record.state.last_request_date == 0 {
                        record.state.heuristics_counter = self.inner.warmup_counter;
                    }
                    continue;
                }

                let mut record = FeedRecord::from_definition(def, update_number);
                if record.state.last_request_date == 0 {
                    record.state.heuristics_counter = self.inner.warmup_counter;
                }
                let decision = self.inner.scheduler.next_request(
                    &record,
                    ScheduleRequestType::FirstRequest,
                    now,
                );
                record.no_message_request_time = decision.no_message_request_time;
                to_schedule.push((record.id, update_number, decision.request_time));
                tables.feeds.insert(record.id, record);
                added += 1;
            }

            tables.feeds.len()
        };

        for (feed_id, update_number, time) in to_schedule {
            self.schedule_at(feed_id, update_number, time);
        }
        metrics::update_schedule_metrics(self.inner.queue.len(), tracked);

        info!(added, updated, removed, tracked, "Feed pack accepted");
        AcceptOutcome::Accepted {
            added,
            updated,
            removed,
        }
    }

    /// Fetch one feed, record the result and reschedule it
    pub async fn request_feed(&self, feed_id: FeedId, update_number: u64) {
        let inner = &self.inner;
        let request_time = self.now();

        let (record, request_feeds) = {
            let tables = inner.tables.read().await;
            match tables.feeds.get(&feed_id) {
                Some(record) if record.update_number == update_number => {
                    (record.clone(), tables.request_feeds)
                }
                _ => {
                    debug!(feed_id = %feed_id, update_number, "Dropping stale feed request");
                    return;
                }
            }
        };

        if !request_feeds {
            let decision = inner.scheduler.next_request(
                &record,
                ScheduleRequestType::SkippedRequest,
                request_time,
            );
            debug!(feed_id = %feed_id, "Manager not accepting results, request skipped");
            self.schedule_at(feed_id, update_number, decision.request_time);
            return;
        }

        let request = FetchRequest {
            feed_id,
            url: record.url.clone(),
            encoding: record.encoding.clone(),
            last_modified: record.state.http.last_modified.clone(),
            etag: record.state.http.etag.clone(),
            script: record.adjustment_script.clone(),
            shutdown: inner.shutdown_tx.subscribe(),
        };

        let result = if record.feed_type == FeedType::Html {
            if record.adjustment_script.trim().is_empty() {
                Err(FetchError::Script("No script provided".to_string()))
            } else {
                inner.fetcher.scrape(&request).await
            }
        } else {
            inner.fetcher.fetch(&request).await
        };

        match &result {
            Err(FetchError::ServiceStopped) => {
                debug!(feed_id = %feed_id, "Feed request abandoned on shutdown");
                return;
            }
            Err(e @ FetchError::Script(_)) => {
                warn!(feed_id = %feed_id, url = %record.url, error = %e, "HTML feed script failed");
            }
            _ => {}
        }

        let classified = inner.classifier.classify(&record, request_time, result);
        let info = classified.request_info;
        metrics::record_request(info.outcome.as_str(), info.duration_ms as f64 / 1000.0);

        let now = self.now();
        let next_time = {
            let mut tables = inner.tables.write().await;
            let Some(live) = tables.feeds.get_mut(&feed_id) else {
                debug!(feed_id = %feed_id, "Feed removed while requested, result dropped");
                return;
            };
            if live.update_number != update_number || live.url != record.url {
                debug!(feed_id = %feed_id, "Feed changed while requested, result dropped");
                return;
            }

            let mut updated = classified.record;
            let decision =
                inner
                    .scheduler
                    .next_request(&updated, ScheduleRequestType::Regular, now);
            updated.no_message_request_time = decision.no_message_request_time;
            if decision.forecast_failed {
                debug!(feed_id = %feed_id, "Request forecast missed");
            }
            *live = updated;

            tables.push_result(classified.state_update, info.clone(), inner.packet_size);
            decision.request_time
        };

        debug!(
            feed_id = %feed_id,
            outcome = %info.outcome,
            interruption = classified.interruption.map(|i| i.as_str()).unwrap_or("none"),
            messages = info.messages,
            next = %crate::utils::format_time(next_time),
            "Feed requested"
        );
        self.schedule_at(feed_id, update_number, next_time);
    }

    /// Take every pending result pack
    pub async fn take_pending(&self) -> VecDeque<FeedStateUpdatePack> {
        std::mem::take(&mut self.inner.tables.write().await.pending)
    }

    /// Put packs back in front of anything queued since they were taken
    pub async fn restore_pending(&self, mut packs: VecDeque<FeedStateUpdatePack>) {
        let mut tables = self.inner.tables.write().await;
        packs.append(&mut tables.pending);
        tables.pending = packs;
    }

    pub async fn set_request_feeds(&self, value: bool) {
        let mut tables = self.inner.tables.write().await;
        if tables.request_feeds != value {
            info!(request_feeds = value, "Feed requesting toggled");
        }
        tables.request_feeds = value;
    }

    /// Count the requests of a state pack the manager accepted
    pub async fn accumulate_stats(&self, pack: &FeedStateUpdatePack) {
        self.inner.tables.write().await.stats.accumulate(&pack.requests);
    }

    pub async fn take_stats(&self) -> StatAccumulator {
        self.inner.tables.write().await.stats.take()
    }

    pub async fn restore_stats(&self, stats: StatAccumulator) {
        self.inner.tables.write().await.stats.merge(stats);
    }

    /// Spawn the dispatcher and the workers
    pub async fn start(&self) {
        let mut handles = self.inner.handles.lock().await;
        if !handles.is_empty() {
            warn!("Worker pool already started");
            return;
        }

        let (job_tx, job_rx) = mpsc::channel::<ScheduledRequest>(self.inner.threads * 2);
        let job_rx = Arc::new(Mutex::new(job_rx));

        for worker_id in 0..self.inner.threads {
            let job_rx = Arc::clone(&job_rx);
            let pool = self.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let job = {
                        let mut rx = job_rx.lock().await;
                        rx.recv().await
                    };
                    let Some(job) = job else {
                        break;
                    };
                    pool.request_feed(job.feed_id, job.update_number).await;
                }
                debug!(worker_id, "Feed worker shutting down");
            }));
        }

        let pool = self.clone();
        handles.push(tokio::spawn(async move { pool.dispatch(job_tx).await }));

        info!(workers = self.inner.threads, "Worker pool started");
    }

    async fn dispatch(&self, job_tx: mpsc::Sender<ScheduledRequest>) {
        let inner = &self.inner;
        let mut shutdown = inner.shutdown_tx.subscribe();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let now = self.now();
            while let Some(job) = inner.queue.pop_due(now) {
                if job_tx.send(job).await.is_err() {
                    error!("Worker channel closed");
                    return;
                }
            }
            for job in self.drain_overflow(now) {
                if job_tx.send(job).await.is_err() {
                    error!("Worker channel closed");
                    return;
                }
            }

            let next = match (inner.queue.next_time(), self.next_overflow_time()) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            let wait = next
                .map(|t| Duration::from_secs((t - now).max(1) as u64))
                .unwrap_or(IDLE_WAIT)
                .min(IDLE_WAIT);

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = inner.queue.changed() => {}
                _ = inner.overflowed.notified() => {}
                _ = shutdown.changed() => {}
            }
        }

        debug!("Dispatcher shutting down");
    }

    /// Stop dispatching and wait for in-flight requests to settle
    pub async fn stop(&self) {
        self.inner.shutdown_tx.send_replace(true);
        self.inner.queue.close();
        self.lock_overflow().clear();

        let handles = std::mem::take(&mut *self.inner.handles.lock().await);
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                error!(error = %e, "Worker task failed");
            }
        }
        info!("Worker pool stopped");
    }
}
