// Core data structures for the feed puller

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque feed identifier assigned by the manager
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct FeedId(pub u64);

impl fmt::Display for FeedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Message identifier, a stable hash of the item's guid/link/title
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Session identifier issued by the manager on login
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Feed document type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedType {
    #[default]
    Undefined,
    Rss,
    Atom,
    Rdf,
    Html,
}

impl FeedType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Rss => "rss",
            Self::Atom => "atom",
            Self::Rdf => "rdf",
            Self::Html => "html",
        }
    }
}

impl fmt::Display for FeedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Three-valued flag for facts learned about a feed over time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriState {
    #[default]
    Unknown,
    No,
    Yes,
}

impl From<bool> for TriState {
    fn from(value: bool) -> Self {
        if value {
            Self::Yes
        } else {
            Self::No
        }
    }
}

/// Content-Length header as last observed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderLength {
    #[default]
    Unknown,
    Absent,
    Value(u64),
}

impl HeaderLength {
    /// Usable value for the content-length heuristic
    pub fn value(&self) -> Option<u64> {
        match self {
            Self::Value(v) if *v > 0 => Some(*v),
            _ => None,
        }
    }
}

/// A remembered message: id plus its published time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageCode {
    pub id: MessageId,
    pub published: i64,
}

impl MessageCode {
    pub fn new(id: MessageId, published: i64) -> Self {
        Self { id, published }
    }
}

/// Channel-level facts from the last full parse
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChannelState {
    pub feed_type: FeedType,
    pub title: String,
    pub description: String,
    pub html_link: String,
    pub lang: String,
    pub country: String,
    /// Suggested refresh interval in minutes, 0 when unset
    pub ttl: u32,
    pub last_build_date: i64,
}

/// Conditional-GET and transfer facts
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HttpState {
    pub last_modified: String,
    pub etag: String,
    pub content_length: HeaderLength,
    pub single_chunked: TriState,
    pub first_chunk_size: Option<u64>,
}

/// Mutable per-feed request state
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedState {
    pub last_request_date: i64,
    pub channel: ChannelState,
    pub http: HttpState,
    pub size: u32,
    pub entropy: u32,
    pub entropy_updated_date: i64,
    pub heuristics_counter: i32,
}

/// Feed status in an upstream feed pack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedStatus {
    Active,
    Removed,
}

/// Feed definition as delivered by the manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedDefinition {
    pub id: FeedId,
    pub status: FeedStatus,
    pub url: String,
    #[serde(default)]
    pub encoding: String,
    #[serde(default)]
    pub feed_type: FeedType,
    #[serde(default)]
    pub space: u64,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub adjustment_script: String,
    #[serde(default)]
    pub state: FeedState,
    #[serde(default)]
    pub last_messages: Vec<MessageCode>,
}

/// Batch of feed definitions for one session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedPack {
    pub session: SessionId,
    pub feeds: Vec<FeedDefinition>,
}

/// Everything the puller knows about one tracked feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedRecord {
    pub id: FeedId,
    pub url: String,
    #[serde(default)]
    pub encoding: String,
    #[serde(default)]
    pub feed_type: FeedType,
    #[serde(default)]
    pub space: u64,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub adjustment_script: String,
    #[serde(default)]
    pub state: FeedState,
    /// Newest first
    #[serde(default)]
    pub last_messages: Vec<MessageCode>,
    #[serde(default)]
    pub no_message_request_time: i64,
    #[serde(default)]
    pub update_number: u64,
}

impl FeedRecord {
    /// Create a record from an upstream definition
    pub fn from_definition(def: FeedDefinition, update_number: u64) -> Self {
        Self {
            id: def.id,
            url: def.url,
            encoding: def.encoding,
            feed_type: def.feed_type,
            space: def.space,
            language: def.language,
            country: def.country,
            adjustment_script: def.adjustment_script,
            state: def.state,
            last_messages: def.last_messages,
            no_message_request_time: 0,
            update_number,
        }
    }

    /// Forget everything learned from the previous URL
    pub fn reset_state(&mut self) {
        self.state = FeedState::default();
        self.last_messages.clear();
        self.no_message_request_time = 0;
    }

    pub fn is_message_known(&self, id: MessageId) -> bool {
        self.last_messages.iter().any(|m| m.id == id)
    }
}

/// Why a schedule is being computed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleRequestType {
    FirstRequest,
    Regular,
    SkippedRequest,
}

impl ScheduleRequestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FirstRequest => "first",
            Self::Regular => "regular",
            Self::SkippedRequest => "skipped",
        }
    }
}

impl std::str::FromStr for ScheduleRequestType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "first" | "first_request" => Ok(Self::FirstRequest),
            "regular" => Ok(Self::Regular),
            "skipped" | "skipped_request" => Ok(Self::SkippedRequest),
            other => Err(format!("unknown request type: {other}")),
        }
    }
}

/// Outcome of one fetch attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedRequestOutcome {
    ParsedToTheEnd,
    NotModified,
    PresumablyUnchanged,
    HasChanges,
    Unchanged,
    Failed,
    Wasted,
}

impl FeedRequestOutcome {
    /// The document was read far enough to trust its headers
    pub fn is_parsed(&self) -> bool {
        matches!(self, Self::ParsedToTheEnd | Self::Unchanged | Self::Wasted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ParsedToTheEnd => "parsed_to_the_end",
            Self::NotModified => "not_modified",
            Self::PresumablyUnchanged => "presumably_unchanged",
            Self::HasChanges => "has_changes",
            Self::Unchanged => "unchanged",
            Self::Failed => "failed",
            Self::Wasted => "wasted",
        }
    }
}

impl fmt::Display for FeedRequestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-request figures that feed the daily statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedRequestInfo {
    pub feed_id: FeedId,
    pub request_time: i64,
    pub outcome: FeedRequestOutcome,
    pub wasted: f32,
    pub outbound: u64,
    pub inbound: u64,
    pub duration_ms: u64,
    pub messages: u32,
    pub messages_size: u64,
    pub messages_delay: u64,
    pub max_message_delay: u64,
    pub mistiming: i64,
}

impl FeedRequestInfo {
    pub fn new(feed_id: FeedId, request_time: i64) -> Self {
        Self {
            feed_id,
            request_time,
            outcome: FeedRequestOutcome::Failed,
            wasted: 0.0,
            outbound: 0,
            inbound: 0,
            duration_ms: 0,
            messages: 0,
            messages_size: 0,
            messages_delay: 0,
            max_message_delay: 0,
            mistiming: 0,
        }
    }
}

/// Delta of a feed's state; `Some` marks a changed field
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FeedStateUpdate {
    pub feed_id: FeedId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_request_date: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_type: Option<FeedType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lang: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_build_date: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_length: Option<HeaderLength>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub single_chunked: Option<TriState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_chunk_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heuristics_counter: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entropy: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entropy_updated_date: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub new_messages: Vec<MessageCode>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub updated_messages: Vec<MessageCode>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expired_messages: Vec<MessageId>,
}

impl FeedStateUpdate {
    pub fn new(feed_id: FeedId) -> Self {
        Self {
            feed_id,
            ..Default::default()
        }
    }
}

/// Batch of request results pushed upstream together
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedStateUpdatePack {
    pub updates: Vec<FeedStateUpdate>,
    pub requests: Vec<FeedRequestInfo>,
}

impl FeedStateUpdatePack {
    pub fn len(&self) -> usize {
        self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }
}
