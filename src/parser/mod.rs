//! Feed document parsing
//!
//! RSS 2.0 and RDF documents are read with the `rss` crate, Atom with
//! `atom_syndication`. Both are reduced to a [`ParsedChannel`] whose items
//! keep document order.

pub mod sanitize;

use atom_syndication::Feed;
use chrono::DateTime;
use rss::Channel;
use std::io::BufReader;

use crate::models::{FeedType, MessageId};
use crate::utils::error::ParseError;
use crate::utils::message_id;

/// Maximum stored length of channel titles
pub const TITLE_MAX_LEN: usize = 200;

/// Maximum stored length of channel descriptions
pub const DESCRIPTION_MAX_LEN: usize = 1000;

/// Maximum stored length of links and short channel fields
pub const LINK_MAX_LEN: usize = 2000;

/// One item of a parsed feed
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParsedItem {
    pub id: MessageId,
    pub title: String,
    pub description: String,
    pub url: String,
    /// Epoch seconds, 0 when the item carries no usable date
    pub published: i64,
}

impl ParsedItem {
    /// Approximate stored size of the item
    pub fn size(&self) -> u64 {
        (self.title.len() + self.description.len() + self.url.len()) as u64
    }
}

/// Channel-level data of a parsed feed
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParsedChannel {
    pub feed_type: FeedType,
    pub title: String,
    pub description: String,
    pub html_link: String,
    pub lang: String,
    pub country: String,
    /// Minutes, 0 when absent
    pub ttl: u32,
    /// Epoch seconds, 0 when absent
    pub last_build_date: i64,
    /// Items in document order
    pub items: Vec<ParsedItem>,
}

/// Guess the document type from its root element
pub fn detect_feed_type(text: &str) -> Option<FeedType> {
    let head: String = text.chars().take(4096).collect();
    if head.contains("<rdf:RDF") {
        Some(FeedType::Rdf)
    } else if head.contains("<rss") {
        Some(FeedType::Rss)
    } else if head.contains("<feed") {
        Some(FeedType::Atom)
    } else {
        None
    }
}

/// Parse a decoded feed document
pub fn parse_channel(text: &str) -> Result<ParsedChannel, ParseError> {
    match detect_feed_type(text) {
        Some(FeedType::Atom) => parse_atom(text),
        Some(feed_type @ (FeedType::Rss | FeedType::Rdf)) => parse_rss(text, feed_type),
        _ => Err(ParseError::UnknownFormat),
    }
}

fn parse_rss(text: &str, feed_type: FeedType) -> Result<ParsedChannel, ParseError> {
    let channel = Channel::read_from(BufReader::new(text.as_bytes()))
        .map_err(|e| ParseError::Rss(e.to_string()))?;

    let items = channel
        .items()
        .iter()
        .map(|item| {
            let url = item.link().unwrap_or_default().trim().to_string();
            let key = item
                .guid()
                .map(|g| g.value().trim().to_string())
                .filter(|g| !g.is_empty())
                .or_else(|| (!url.is_empty()).then(|| url.clone()))
                .unwrap_or_else(|| item.title().unwrap_or_default().to_string());

            let published = item
                .pub_date()
                .and_then(parse_date)
                .or_else(|| {
                    item.dublin_core_ext()
                        .and_then(|dc| dc.dates().first())
                        .and_then(|d| parse_date(d))
                })
                .unwrap_or(0);

            ParsedItem {
                id: message_id(&key),
                title: item.title().unwrap_or_default().to_string(),
                description: item.description().unwrap_or_default().to_string(),
                url,
                published,
            }
        })
        .collect();

    Ok(ParsedChannel {
        feed_type,
        title: channel.title().to_string(),
        description: channel.description().to_string(),
        html_link: channel.link().to_string(),
        lang: channel.language().unwrap_or_default().to_string(),
        country: String::new(),
        ttl: channel
            .ttl()
            .and_then(|t| t.trim().parse::<u32>().ok())
            .unwrap_or(0),
        last_build_date: channel
            .last_build_date()
            .and_then(parse_date)
            .unwrap_or(0),
        items,
    })
}

fn parse_atom(text: &str) -> Result<ParsedChannel, ParseError> {
    let feed = Feed::read_from(BufReader::new(text.as_bytes()))
        .map_err(|e| ParseError::Atom(e.to_string()))?;

    let html_link = feed
        .links()
        .iter()
        .find(|l| l.rel() == "alternate")
        .or_else(|| feed.links().first())
        .map(|l| l.href().to_string())
        .unwrap_or_default();

    let items = feed
        .entries()
        .iter()
        .map(|entry| {
            let url = entry
                .links()
                .iter()
                .find(|l| l.rel() == "alternate")
                .or_else(|| entry.links().first())
                .map(|l| l.href().trim().to_string())
                .unwrap_or_default();
            let key = if entry.id().trim().is_empty() {
                url.clone()
            } else {
                entry.id().trim().to_string()
            };
            let published = entry.published().unwrap_or(entry.updated()).timestamp();

            ParsedItem {
                id: message_id(&key),
                title: entry.title().as_str().to_string(),
                description: entry
                    .summary()
                    .map(|s| s.as_str().to_string())
                    .unwrap_or_default(),
                url,
                published,
            }
        })
        .collect();

    Ok(ParsedChannel {
        feed_type: FeedType::Atom,
        title: feed.title().as_str().to_string(),
        description: feed
            .subtitle()
            .map(|s| s.as_str().to_string())
            .unwrap_or_default(),
        html_link,
        lang: feed.lang().unwrap_or_default().to_string(),
        country: String::new(),
        ttl: 0,
        last_build_date: feed.updated().timestamp(),
        items,
    })
}

/// Parse an RFC 2822 or RFC 3339 date into epoch seconds
pub fn parse_date(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    DateTime::parse_from_rfc2822(raw)
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .ok()
        .map(|d| d.timestamp())
}
