//! Common test utilities
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::DateTime;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use feedpull::coordinator::{PullerManager, UpstreamError};
use feedpull::crawler::fetcher::{FeedFetcher, FetchBody, FetchRequest, FetchResponse};
use feedpull::crawler::interceptor::TransferInfo;
use feedpull::models::{
    FeedDefinition, FeedId, FeedRecord, FeedState, FeedStateUpdatePack, FeedStatus, FeedType,
    HeaderLength, MessageCode, SessionId,
};
use feedpull::stats::FeedsStatistics;
use feedpull::utils::error::FetchError;
use feedpull::utils::message_id;

/// 2024-01-01T00:00:00Z
pub const BASE_TIME: i64 = 1_704_067_200;

/// RSS 2.0 document with `(guid, published)` items
pub fn rss_document(items: &[(&str, i64)]) -> String {
    let mut doc = String::from(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<rss version=\"2.0\"><channel>\
         <title>Test Feed</title><link>http://example.com/</link>\
         <description>Feed used in tests</description>",
    );
    for (guid, published) in items {
        let date = DateTime::from_timestamp(*published, 0)
            .map(|t| t.to_rfc2822())
            .unwrap_or_default();
        doc.push_str(&format!(
            "<item><title>Item {guid}</title><link>http://example.com/{guid}</link>\
             <guid>{guid}</guid><pubDate>{date}</pubDate></item>"
        ));
    }
    doc.push_str("</channel></rss>");
    doc
}

/// Fetch response carrying a full document
pub fn document_response(text: String) -> FetchResponse {
    let len = text.len() as u64;
    FetchResponse {
        final_url: "http://example.com/rss".to_string(),
        new_location: None,
        outbound: 120,
        inbound: len,
        duration: Duration::from_millis(40),
        body: FetchBody::Document {
            text,
            last_modified: "Mon, 01 Jan 2024 00:00:00 GMT".to_string(),
            etag: "\"v1\"".to_string(),
            transfer: TransferInfo {
                content_length: HeaderLength::Value(len),
                chunks: 2,
                first_chunk_size: len / 2,
            },
        },
    }
}

pub fn not_modified_response() -> FetchResponse {
    FetchResponse {
        final_url: "http://example.com/rss".to_string(),
        new_location: None,
        outbound: 150,
        inbound: 80,
        duration: Duration::from_millis(15),
        body: FetchBody::NotModified,
    }
}

pub fn feed_record(id: u64) -> FeedRecord {
    FeedRecord {
        id: FeedId(id),
        url: format!("http://example.com/rss/{id}"),
        encoding: String::new(),
        feed_type: FeedType::Rss,
        space: 0,
        language: String::new(),
        country: String::new(),
        adjustment_script: String::new(),
        state: FeedState::default(),
        last_messages: Vec::new(),
        no_message_request_time: 0,
        update_number: 1,
    }
}

/// Known messages, newest first, `gap` seconds apart
pub fn known_messages(guids: &[&str], newest: i64, gap: i64) -> Vec<MessageCode> {
    guids
        .iter()
        .enumerate()
        .map(|(i, guid)| MessageCode::new(message_id(guid), newest - i as i64 * gap))
        .collect()
}

pub fn feed_definition(id: u64) -> FeedDefinition {
    FeedDefinition {
        id: FeedId(id),
        status: FeedStatus::Active,
        url: format!("http://example.com/rss/{id}"),
        encoding: String::new(),
        feed_type: FeedType::Rss,
        space: 0,
        language: String::new(),
        country: String::new(),
        adjustment_script: String::new(),
        state: FeedState::default(),
        last_messages: Vec::new(),
    }
}

/// Fetcher that answers from a script, repeating the last answer
pub struct ScriptedFetcher {
    responses: Mutex<VecDeque<Result<FetchResponse, FetchError>>>,
    fallback: FetchResponse,
    calls: AtomicUsize,
}

impl ScriptedFetcher {
    pub fn new(fallback: FetchResponse) -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            fallback,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, response: Result<FetchResponse, FetchError>) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FeedFetcher for ScriptedFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
        request.ensure_running()?;
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.responses.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(self.fallback.clone()))
    }
}

/// Manager that records what it was sent
#[derive(Default)]
pub struct RecordingManager {
    pub accept_state: Mutex<VecDeque<Result<bool, UpstreamError>>>,
    pub state_packs: Mutex<Vec<FeedStateUpdatePack>>,
    pub stat_packets: Mutex<Vec<FeedsStatistics>>,
    pub fail_stats: Mutex<bool>,
    pub logins: AtomicUsize,
    pub logouts: AtomicUsize,
}

impl RecordingManager {
    pub fn state_updates(&self) -> usize {
        self.state_packs.lock().unwrap().iter().map(|p| p.len()).sum()
    }
}

#[async_trait]
impl PullerManager for RecordingManager {
    async fn login(&self) -> Result<SessionId, UpstreamError> {
        let n = self.logins.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SessionId(format!("session-{n}")))
    }

    async fn logout(&self, _session: &SessionId) -> Result<(), UpstreamError> {
        self.logouts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn ping(&self, _session: &SessionId) -> Result<(), UpstreamError> {
        Ok(())
    }

    async fn feed_state(
        &self,
        _session: &SessionId,
        pack: &FeedStateUpdatePack,
    ) -> Result<bool, UpstreamError> {
        let answer = self.accept_state.lock().unwrap().pop_front().unwrap_or(Ok(true));
        if matches!(answer, Ok(true)) {
            self.state_packs.lock().unwrap().push(pack.clone());
        }
        answer
    }

    async fn feed_stat(
        &self,
        _session: &SessionId,
        stats: &FeedsStatistics,
    ) -> Result<(), UpstreamError> {
        if *self.fail_stats.lock().unwrap() {
            return Err(UpstreamError::NotReady("stats later".into()));
        }
        self.stat_packets.lock().unwrap().push(stats.clone());
        Ok(())
    }
}
