//! Turning a raw fetch result into a feed state delta
//!
//! [`OutcomeClassifier::classify`] works on a snapshot of the feed record
//! and returns the updated record, the [`FeedStateUpdate`] describing every
//! changed field, and the [`FeedRequestInfo`] that feeds the statistics.
//! Nothing here touches shared state or the network.

use chrono::DateTime;
use std::time::Duration;
use tracing::{debug, warn};

use super::fetcher::{FetchBody, FetchResponse};
use super::interceptor::{intercept, InterceptorSetup, ParseInterruption, TransferInfo};
use crate::config::{Config, SavingFeedStateConfig, SavingTrafficConfig};
use crate::metrics;
use crate::models::{
    FeedRecord, FeedRequestInfo, FeedRequestOutcome, FeedStateUpdate, FeedType, HeaderLength,
    MessageCode, MessageId, TriState,
};
use crate::parser::sanitize::clean_text;
use crate::parser::{
    parse_channel, ParsedChannel, ParsedItem, DESCRIPTION_MAX_LEN, LINK_MAX_LEN, TITLE_MAX_LEN,
};
use crate::utils::error::FetchError;
use crate::utils::truncate_text;

/// A classified request, ready to be merged into the feed table
#[derive(Debug, Clone)]
pub struct ClassifiedRequest {
    pub record: FeedRecord,
    pub state_update: FeedStateUpdate,
    pub request_info: FeedRequestInfo,
    pub interruption: Option<ParseInterruption>,
}

/// HTTP-level facts gathered while fetching
#[derive(Debug, Clone, Default)]
struct HttpFacts {
    new_location: Option<String>,
    last_modified: String,
    etag: String,
    content_length: HeaderLength,
    single_chunked: TriState,
    first_chunk_size: Option<u64>,
    feed_size: u32,
    heuristics_applied: bool,
    entropy: u32,
}

/// Outcome of merging parsed items into the remembered message list
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reconciliation {
    /// New list, newest first
    pub messages: Vec<MessageCode>,
    pub new_messages: Vec<MessageCode>,
    pub updated_messages: Vec<MessageCode>,
    pub expired_messages: Vec<MessageId>,
    /// Items that were already known
    pub old_messages: u32,
    /// Known items seen before the last new one, 0 when not calculated
    pub entropy: u32,
    /// Codes cut off by the list size limit
    pub truncated: usize,
}

/// Classifies fetch results and applies them to feed records
#[derive(Debug, Clone)]
pub struct OutcomeClassifier {
    feed_state: SavingFeedStateConfig,
    traffic: SavingTrafficConfig,
    request_timeout: Duration,
}

impl OutcomeClassifier {
    pub fn new(config: &Config) -> Self {
        Self {
            feed_state: config.saving_feed_state.clone(),
            traffic: config.saving_traffic.clone(),
            request_timeout: config.request_timeout(),
        }
    }

    pub fn traffic(&self) -> &SavingTrafficConfig {
        &self.traffic
    }

    /// Classify one request made at `request_time` for `record`
    ///
    /// `FetchError::ServiceStopped` must be filtered out by the caller; if it
    /// gets here it is classified as a failure like any other error.
    pub fn classify(
        &self,
        record: &FeedRecord,
        request_time: i64,
        result: Result<FetchResponse, FetchError>,
    ) -> ClassifiedRequest {
        let mut request_info = FeedRequestInfo::new(record.id, request_time);

        let response = match result {
            Ok(response) => response,
            Err(err) => {
                if matches!(err, FetchError::Timeout) {
                    request_info.duration_ms += self.request_timeout.as_millis() as u64;
                }
                debug!(feed_id = %record.id, url = %record.url, error = %err, "Feed request failed");
                return if record.feed_type == FeedType::Html {
                    self.failed_html(record, request_info)
                } else {
                    self.process_channel(record, HttpFacts::default(), None, request_info, None)
                };
            }
        };

        request_info.outbound = response.outbound;
        request_info.inbound = response.inbound;
        request_info.duration_ms += response.duration.as_millis() as u64;

        let mut facts = HttpFacts {
            new_location: response.new_location,
            ..Default::default()
        };

        match response.body {
            FetchBody::NotModified => {
                request_info.outcome = FeedRequestOutcome::NotModified;
                self.process_channel(record, facts, None, request_info, None)
            }
            FetchBody::Scraped(channel) => {
                self.process_scraped(record, facts, channel, request_info)
            }
            FetchBody::Document {
                text,
                last_modified,
                etag,
                transfer,
            } => {
                facts.last_modified = last_modified;
                facts.etag = etag;
                facts.content_length = transfer.content_length;

                let mut channel = match parse_channel(&text) {
                    Ok(channel) => channel,
                    Err(err) => {
                        debug!(feed_id = %record.id, url = %record.url, error = %err, "Feed document rejected");
                        request_info.outcome = FeedRequestOutcome::Failed;
                        return self.process_channel(record, facts, None, request_info, None);
                    }
                };

                let interruption =
                    self.apply_interception(record, &transfer, &mut channel, &mut facts, &mut request_info);
                self.process_channel(record, facts, Some(channel), request_info, interruption)
            }
        }
    }

    /// Replay the traffic-saving checks and set the request outcome
    fn apply_interception(
        &self,
        record: &FeedRecord,
        transfer: &TransferInfo,
        channel: &mut ParsedChannel,
        facts: &mut HttpFacts,
        request_info: &mut FeedRequestInfo,
    ) -> Option<ParseInterruption> {
        let setup = InterceptorSetup::new(record, transfer, &self.traffic);
        let interception = intercept(&setup, channel, transfer);

        facts.heuristics_applied = interception.heuristics_applied(&setup);

        request_info.outcome = match interception.interruption {
            None => {
                facts.feed_size = channel.items.len() as u32;
                FeedRequestOutcome::ParsedToTheEnd
            }
            Some(ParseInterruption::SameLastBuildDate) => FeedRequestOutcome::Unchanged,
            Some(ParseInterruption::OldMessagesLimitReached) => {
                if interception.new_messages > 0
                    && interception.new_messages + interception.old_messages < record.state.size
                {
                    FeedRequestOutcome::HasChanges
                } else {
                    FeedRequestOutcome::Wasted
                }
            }
            Some(ParseInterruption::SameContentLength | ParseInterruption::SameFirstChunkSize) => {
                FeedRequestOutcome::PresumablyUnchanged
            }
        };

        if let Some(reason) = interception.interruption {
            debug!(feed_id = %record.id, reason = reason.as_str(), "Parse interrupted");
        }

        channel.items.truncate(interception.items_posted);

        if !facts.heuristics_applied && transfer.chunks > 0 {
            let single = transfer.chunks == 1;
            facts.single_chunked = TriState::from(single);
            facts.first_chunk_size = single.then_some(transfer.first_chunk_size);
        }

        interception.interruption
    }

    /// Apply a classified fetch to a copy of `current`
    fn process_channel(
        &self,
        current: &FeedRecord,
        mut facts: HttpFacts,
        channel: Option<ParsedChannel>,
        mut request_info: FeedRequestInfo,
        interruption: Option<ParseInterruption>,
    ) -> ClassifiedRequest {
        let mut record = current.clone();
        let mut update = FeedStateUpdate::new(record.id);
        let request_time = request_info.request_time;
        let parsed_to_end = request_info.outcome == FeedRequestOutcome::ParsedToTheEnd;
        let parsed = request_info.outcome.is_parsed();

        if let Some(channel) = channel.as_ref() {
            let state = &mut record.state.channel;

            if channel.feed_type != FeedType::Undefined && channel.feed_type != state.feed_type {
                state.feed_type = channel.feed_type;
                update.channel_type = Some(channel.feed_type);
            }

            if parsed_to_end {
                let title = clean_text(&channel.title, TITLE_MAX_LEN);
                if title != state.title {
                    update.title = Some(title.clone());
                    state.title = title;
                }

                let description = clean_text(&channel.description, DESCRIPTION_MAX_LEN);
                if description != state.description {
                    update.description = Some(description.clone());
                    state.description = description;
                }

                let html_link = truncate_text(channel.html_link.trim(), LINK_MAX_LEN);
                if html_link != state.html_link {
                    update.html_link = Some(html_link.clone());
                    state.html_link = html_link;
                }

                let lang = truncate_text(channel.lang.trim(), 16);
                if lang != state.lang {
                    update.lang = Some(lang.clone());
                    state.lang = lang;
                }

                if channel.country != state.country {
                    update.country = Some(channel.country.clone());
                    state.country = channel.country.clone();
                }

                if channel.ttl != state.ttl {
                    update.ttl = Some(channel.ttl);
                    state.ttl = channel.ttl;
                }

                if channel.last_build_date != state.last_build_date {
                    update.last_build_date = Some(channel.last_build_date);
                    state.last_build_date = channel.last_build_date;
                }
            }
        }

        let http = &mut record.state.http;
        if parsed {
            if facts.last_modified != http.last_modified {
                update.last_modified = Some(facts.last_modified.clone());
                http.last_modified = facts.last_modified.clone();
            }
            if facts.etag != http.etag {
                update.etag = Some(facts.etag.clone());
                http.etag = facts.etag.clone();
            }
            if facts.content_length != http.content_length {
                update.content_length = Some(facts.content_length);
                http.content_length = facts.content_length;
            }
        }

        if request_info.outcome != FeedRequestOutcome::Failed {
            if let Some(location) = facts.new_location.take() {
                debug!(feed_id = %record.id, from = %record.url, to = %location, "Feed moved permanently");
                record.url = location.clone();
                update.url = Some(location);
            }
        }

        if parsed_to_end {
            if facts.single_chunked != TriState::Unknown && facts.single_chunked != http.single_chunked {
                // A feed once seen multi-chunked is not trusted to stay single
                let single_chunked =
                    if facts.single_chunked == TriState::Yes && http.single_chunked == TriState::No {
                        TriState::No
                    } else {
                        facts.single_chunked
                    };
                if single_chunked != http.single_chunked {
                    update.single_chunked = Some(single_chunked);
                    http.single_chunked = single_chunked;
                }
            }

            if facts.first_chunk_size != http.first_chunk_size {
                update.first_chunk_size = Some(facts.first_chunk_size.unwrap_or(0));
                http.first_chunk_size = facts.first_chunk_size;
            }

            if facts.feed_size != record.state.size {
                update.size = Some(facts.feed_size);
                record.state.size = facts.feed_size;
            }
        }

        if matches!(
            request_info.outcome,
            FeedRequestOutcome::ParsedToTheEnd
                | FeedRequestOutcome::HasChanges
                | FeedRequestOutcome::Wasted
        ) {
            if let Some(channel) = channel.as_ref() {
                let reconciliation = self.reconcile_messages(
                    &record,
                    channel,
                    facts.heuristics_applied,
                    &mut request_info,
                );
                facts.entropy = reconciliation.entropy;
                record.last_messages = reconciliation.messages;
                update.new_messages = reconciliation.new_messages;
                update.updated_messages = reconciliation.updated_messages;
                update.expired_messages = reconciliation.expired_messages;
            }
        }

        let state = &mut record.state;
        let previous_counter = state.heuristics_counter;
        if state.heuristics_counter < 0 {
            if request_info.outcome == FeedRequestOutcome::ParsedToTheEnd && request_info.messages > 0 {
                state.heuristics_counter += 1;
            }
        } else if facts.heuristics_applied {
            state.heuristics_counter += 1;
        } else if request_info.outcome.is_parsed() {
            state.heuristics_counter = 0;
        }
        if previous_counter != state.heuristics_counter || state.last_request_date == 0 {
            update.heuristics_counter = Some(state.heuristics_counter);
        }

        if facts.entropy > 0 && facts.entropy >= state.entropy {
            state.entropy_updated_date = request_time;
            update.entropy_updated_date = Some(request_time);
            debug!(feed_id = %record.id, entropy = facts.entropy, "Entropy max reached");
        }
        if facts.entropy > state.entropy {
            state.entropy = facts.entropy;
            update.entropy = Some(facts.entropy);
        }

        let force_down_after = self.traffic.heuristics.force_down_entropy_after;
        if force_down_after > 0
            && request_info.outcome == FeedRequestOutcome::ParsedToTheEnd
            && state.entropy > 0
            && state.heuristics_counter == 0
            && request_time - state.entropy_updated_date >= force_down_after
        {
            state.entropy -= 1;
            state.entropy_updated_date = request_time;
            update.entropy = Some(state.entropy);
            update.entropy_updated_date = Some(request_time);
            debug!(feed_id = %record.id, entropy = state.entropy, "Entropy forced down");
        }

        state.last_request_date = request_time;
        update.last_request_date = Some(request_time);

        debug!(
            feed_id = %record.id,
            url = %record.url,
            outcome = %request_info.outcome,
            messages = request_info.messages,
            "Feed request classified"
        );

        ClassifiedRequest {
            record,
            state_update: update,
            request_info,
            interruption,
        }
    }

    /// Merge `channel.items` into the remembered message list of `record`
    ///
    /// Counts new messages, their size and delay into `request_info` and
    /// marks the request wasted when nothing new was found.
    pub fn reconcile_messages(
        &self,
        record: &FeedRecord,
        channel: &ParsedChannel,
        heuristics_applied: bool,
        request_info: &mut FeedRequestInfo,
    ) -> Reconciliation {
        let current = &record.last_messages;
        let state = &record.state;
        let request_time = request_info.request_time;
        let items = &channel.items;
        let mut result = Reconciliation::default();

        let mut kept: Vec<bool> = current
            .iter()
            .map(|code| items.iter().any(|item| item.id == code.id))
            .collect();

        let mut messages: Vec<MessageCode> = current
            .iter()
            .zip(&kept)
            .filter(|(_, present)| **present)
            .map(|(code, _)| *code)
            .collect();

        let messages_count = items.len() as u32;
        let max_state_messages = (messages_count.max(state.size))
            .saturating_mul(self.feed_state.state_messages_factor)
            .max(self.feed_state.min_state_messages) as usize;
        let can_preserve = (max_state_messages as u32).saturating_sub(messages_count);

        let threshold = request_time - self.feed_state.message_timeout;
        let mut preserved = 0u32;
        for (code, present) in current.iter().zip(kept.iter_mut()) {
            if preserved >= can_preserve {
                break;
            }
            if *present {
                continue;
            }
            if !heuristics_applied && code.published < threshold {
                break;
            }
            messages.push(*code);
            preserved += 1;
            *present = true;
        }

        result.expired_messages = current
            .iter()
            .zip(&kept)
            .filter(|(_, kept)| !**kept)
            .map(|(code, _)| code.id)
            .collect();

        let calc_entropy = state.heuristics_counter >= -self.traffic.heuristics.apply_after;
        let mut date_for_no_pubdate = 0i64;
        let mut old_messages = 0u32;

        for item in items {
            if let Some(known) = messages.iter_mut().find(|m| m.id == item.id) {
                old_messages += 1;
                if item.published > known.published && item.published < request_time {
                    known.published = item.published;
                    result.updated_messages.push(*known);
                }
                continue;
            }

            request_info.messages += 1;

            if date_for_no_pubdate == 0 {
                date_for_no_pubdate = channel.last_build_date;
                if date_for_no_pubdate != 0 && date_for_no_pubdate < state.last_request_date {
                    date_for_no_pubdate = request_time;
                }
                if date_for_no_pubdate <= 0 || date_for_no_pubdate > request_time {
                    date_for_no_pubdate = request_time;
                }
            }

            let mut code = MessageCode::new(item.id, item.published);
            if code.published <= 0 || code.published > date_for_no_pubdate {
                code.published = date_for_no_pubdate;
            }

            let mut mistiming = 0i64;
            if code.published > request_time {
                mistiming = code.published - request_time;
                code.published = request_time;
            }

            if calc_entropy {
                result.entropy = old_messages;
            }

            result.new_messages.push(code);
            messages.push(code);
            request_info.messages_size += item_size(item, code.published);

            if mistiming == 0 {
                if !current.is_empty()
                    && state.last_request_date != 0
                    && code.published >= state.last_request_date
                {
                    let delay = (request_time - code.published) as u64;
                    request_info.messages_delay += delay;
                    request_info.max_message_delay = request_info.max_message_delay.max(delay);
                }
            } else if request_info.mistiming.abs() < mistiming.abs() {
                request_info.mistiming = mistiming;
            }
        }

        let mut ordered: Vec<MessageCode> = Vec::with_capacity(messages.len());
        for code in messages {
            let pos = ordered.partition_point(|c| code.published < c.published);
            ordered.insert(pos, code);
        }

        if ordered.len() > max_state_messages {
            let dropped = ordered.split_off(max_state_messages);
            warn!(
                feed_id = %record.id,
                count = dropped.len() + max_state_messages,
                max = max_state_messages,
                "Message list exceeds maximum, truncating"
            );
            result.truncated = dropped.len();
            result.expired_messages.extend(
                dropped
                    .iter()
                    .filter(|code| current.iter().any(|c| c.id == code.id))
                    .map(|code| code.id),
            );
            metrics::record_messages_truncated(dropped.len());
        }

        result.messages = ordered;
        result.old_messages = old_messages;

        if request_info.messages == 0 {
            request_info.outcome = FeedRequestOutcome::Wasted;
            request_info.wasted = if old_messages > 0 && old_messages < state.size {
                old_messages as f32 / state.size as f32
            } else {
                1.0
            };
            debug!(feed_id = %record.id, wasted = request_info.wasted, "Request wasted");
        }

        result
    }

    /// Apply items produced by an HTML adjustment script
    fn process_scraped(
        &self,
        current: &FeedRecord,
        mut facts: HttpFacts,
        channel: ParsedChannel,
        mut request_info: FeedRequestInfo,
    ) -> ClassifiedRequest {
        let mut record = current.clone();
        let mut update = FeedStateUpdate::new(record.id);
        let request_time = request_info.request_time;

        record.state.last_request_date = request_time;
        update.last_request_date = Some(request_time);

        let mut old_messages = 0u32;
        for item in &channel.items {
            let code = MessageCode::new(item.id, request_time);

            if let Some(pos) = record.last_messages.iter().position(|m| m.id == item.id) {
                old_messages += 1;
                record.last_messages.remove(pos);
                record.last_messages.insert(0, code);
                update.updated_messages.push(code);
                continue;
            }

            request_info.messages += 1;
            request_info.messages_size += item_size(item, request_time);
            record.last_messages.insert(0, code);
            update.new_messages.push(code);
        }

        if request_info.messages > 0 {
            let state = &mut record.state.channel;
            let title = clean_text(&channel.title, TITLE_MAX_LEN);
            if !title.is_empty() && title != state.title {
                update.title = Some(title.clone());
                state.title = title;
            }
            let html_link = truncate_text(channel.html_link.trim(), LINK_MAX_LEN);
            if !html_link.is_empty() && html_link != state.html_link {
                update.html_link = Some(html_link.clone());
                state.html_link = html_link;
            }
            request_info.outcome = FeedRequestOutcome::ParsedToTheEnd;
            facts.feed_size = request_info.messages;
        } else {
            request_info.outcome = FeedRequestOutcome::Wasted;
            request_info.wasted = 1.0;
        }

        let threshold = request_time - self.feed_state.message_timeout;
        record.last_messages.retain(|code| {
            let keep = code.published >= threshold;
            if !keep {
                update.expired_messages.push(code.id);
            }
            keep
        });

        if let Some(location) = facts.new_location.take() {
            record.url = location.clone();
            update.url = Some(location);
        }

        let size = facts.feed_size.max(record.state.size);
        if size != record.state.size {
            record.state.size = size;
            update.size = Some(size);
        }

        debug!(
            feed_id = %record.id,
            new = request_info.messages,
            old = old_messages,
            "HTML feed processed"
        );

        ClassifiedRequest {
            record,
            state_update: update,
            request_info,
            interruption: None,
        }
    }

    /// An HTML feed whose script could not run only records the attempt
    fn failed_html(&self, current: &FeedRecord, request_info: FeedRequestInfo) -> ClassifiedRequest {
        let mut record = current.clone();
        let mut update = FeedStateUpdate::new(record.id);
        record.state.last_request_date = request_info.request_time;
        update.last_request_date = Some(request_info.request_time);

        ClassifiedRequest {
            record,
            state_update: update,
            request_info,
            interruption: None,
        }
    }
}

/// Size of a message as counted in the statistics
fn item_size(item: &ParsedItem, published: i64) -> u64 {
    let date_len = DateTime::from_timestamp(published, 0)
        .map(|d| d.to_rfc2822().len())
        .unwrap_or(0);
    item.size() + date_len as u64
}
