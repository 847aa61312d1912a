//! Feed fetching over HTTP
//!
//! [`FeedFetcher`] is the seam between the worker pool and the network.
//! [`ReqwestFetcher`] is the production implementation:
//! - Rate limiting with governor
//! - Conditional GET from the remembered `Last-Modified`/`ETag`
//! - Manual redirect handling, so permanent moves can be reported
//! - Chunk accounting for the traffic-saving heuristics
//! - Charset decoding with encoding_rs

use async_trait::async_trait;
use encoding_rs::{Encoding, UTF_8};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use regex::Regex;
use reqwest::{
    header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE, IF_MODIFIED_SINCE, IF_NONE_MATCH, LOCATION},
    redirect::Policy,
    Client, Response, StatusCode,
};
use std::num::NonZeroU32;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use url::Url;

use super::interceptor::TransferInfo;
use crate::config::FeedRequestConfig;
use crate::models::{FeedId, HeaderLength};
use crate::parser::ParsedChannel;
use crate::utils::error::FetchError;

static XML_ENCODING_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)^\s*<\?xml[^>]*?encoding\s*=\s*["']([A-Za-z0-9._:-]+)["']"#).unwrap()
});

static CHARSET_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)charset\s*=\s*"?([A-Za-z0-9._:-]+)"#).unwrap());

/// One fetch to perform
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub feed_id: FeedId,
    pub url: String,
    /// Forced document encoding, empty to detect
    pub encoding: String,
    pub last_modified: String,
    pub etag: String,
    /// Adjustment script of an HTML feed
    pub script: String,
    /// Becomes `true` when the puller shuts down
    pub shutdown: watch::Receiver<bool>,
}

impl FetchRequest {
    /// Fail with `ServiceStopped` once shutdown has been signalled
    pub fn ensure_running(&self) -> Result<(), FetchError> {
        if *self.shutdown.borrow() {
            Err(FetchError::ServiceStopped)
        } else {
            Ok(())
        }
    }
}

/// What the server sent back
#[derive(Debug, Clone, PartialEq)]
pub enum FetchBody {
    /// HTTP 304
    NotModified,

    /// A decoded feed document
    Document {
        text: String,
        last_modified: String,
        etag: String,
        transfer: TransferInfo,
    },

    /// Items produced by an HTML adjustment script
    Scraped(ParsedChannel),
}

/// Result of a completed fetch
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResponse {
    /// URL the body was read from
    pub final_url: String,
    /// Set only when every redirect hop was permanent
    pub new_location: Option<String>,
    pub outbound: u64,
    pub inbound: u64,
    pub duration: Duration,
    pub body: FetchBody,
}

/// Network collaborator of the worker pool
#[async_trait]
pub trait FeedFetcher: Send + Sync {
    /// Fetch an RSS, RDF or Atom document
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError>;

    /// Produce items for an HTML feed by running its adjustment script
    async fn scrape(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
        request.ensure_running()?;
        Err(FetchError::Script("script sandbox is not available".to_string()))
    }
}

/// reqwest-backed feed fetcher
pub struct ReqwestFetcher {
    client: Client,

    /// Rate limiter shared by all workers
    rate_limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,

    redirects_to_follow: u32,

    max_feed_size: u64,
}

impl ReqwestFetcher {
    /// Build the client from the request settings
    ///
    /// # Errors
    ///
    /// Returns `FetchError::Http` if the HTTP client cannot be created
    pub fn new(config: &FeedRequestConfig) -> Result<Self, FetchError> {
        let client = Client::builder()
            .redirect(Policy::none())
            .connect_timeout(Duration::from_secs(config.connect_timeout))
            .timeout(Duration::from_secs(config.request_timeout))
            .user_agent(config.user_agent.clone())
            .gzip(true)
            .build()?;

        let rate = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = RateLimiter::direct(Quota::per_second(rate));

        Ok(Self {
            client,
            rate_limiter,
            redirects_to_follow: config.redirects_to_follow,
            max_feed_size: config.max_feed_size,
        })
    }

    fn build_headers(request: &FetchRequest) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(
                "application/rss+xml, application/atom+xml, application/xml;q=0.9, text/xml;q=0.8, */*;q=0.5",
            ),
        );

        if !request.last_modified.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&request.last_modified) {
                headers.insert(IF_MODIFIED_SINCE, value);
            }
        }
        if !request.etag.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&request.etag) {
                headers.insert(IF_NONE_MATCH, value);
            }
        }

        headers
    }

    /// Follow redirects by hand and return the final response
    async fn send(
        &self,
        request: &FetchRequest,
        outbound: &mut u64,
    ) -> Result<(Response, String, Option<String>), FetchError> {
        let headers = Self::build_headers(request);
        let mut url = Url::parse(&request.url).map_err(|e| FetchError::InvalidUrl(e.to_string()))?;
        let mut all_permanent = true;
        let mut hops = 0;

        loop {
            request.ensure_running()?;

            *outbound += request_size(&url, &headers);
            let response = self
                .client
                .get(url.clone())
                .headers(headers.clone())
                .send()
                .await
                .map_err(map_reqwest_error)?;

            let status = response.status();
            if !status.is_redirection() || status == StatusCode::NOT_MODIFIED {
                let new_location = (hops > 0 && all_permanent).then(|| url.to_string());
                return Ok((response, url.to_string(), new_location));
            }

            if hops >= self.redirects_to_follow {
                return Err(FetchError::Redirect(format!(
                    "more than {} redirects",
                    self.redirects_to_follow
                )));
            }

            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| FetchError::Redirect(format!("{status} without Location")))?;
            let next = url
                .join(location)
                .map_err(|e| FetchError::Redirect(format!("bad Location '{location}': {e}")))?;

            all_permanent &= matches!(
                status,
                StatusCode::MOVED_PERMANENTLY | StatusCode::PERMANENT_REDIRECT
            );
            hops += 1;
            url = next;
        }
    }

    /// Read the body chunk by chunk, checking for shutdown in between
    async fn read_body(
        &self,
        request: &FetchRequest,
        response: &mut Response,
    ) -> Result<(Vec<u8>, u32, u64), FetchError> {
        let mut body = Vec::new();
        let mut chunks = 0u32;
        let mut first_chunk_size = 0u64;

        while let Some(chunk) = response.chunk().await.map_err(map_reqwest_error)? {
            request.ensure_running()?;
            if chunk.is_empty() {
                continue;
            }
            if chunks == 0 {
                first_chunk_size = chunk.len() as u64;
            }
            chunks += 1;
            if (body.len() + chunk.len()) as u64 > self.max_feed_size {
                return Err(FetchError::TooLarge {
                    limit: self.max_feed_size,
                });
            }
            body.extend_from_slice(&chunk);
        }

        Ok((body, chunks, first_chunk_size))
    }
}

#[async_trait]
impl FeedFetcher for ReqwestFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
        request.ensure_running()?;
        self.rate_limiter.until_ready().await;

        let started = Instant::now();
        let mut outbound = 0u64;
        let (mut response, final_url, new_location) = self.send(request, &mut outbound).await?;

        let status = response.status();
        let mut inbound = headers_size(response.headers());

        if status == StatusCode::NOT_MODIFIED {
            return Ok(FetchResponse {
                final_url,
                new_location,
                outbound,
                inbound,
                duration: started.elapsed(),
                body: FetchBody::NotModified,
            });
        }
        if status != StatusCode::OK {
            return Err(FetchError::BadStatus(status.as_u16()));
        }

        let content_length = match response.content_length() {
            Some(length) if length > self.max_feed_size => {
                return Err(FetchError::TooLarge {
                    limit: self.max_feed_size,
                });
            }
            Some(length) => HeaderLength::Value(length),
            None => HeaderLength::Absent,
        };
        let last_modified = header_string(response.headers(), reqwest::header::LAST_MODIFIED);
        let etag = header_string(response.headers(), reqwest::header::ETAG);
        let content_type = header_string(response.headers(), CONTENT_TYPE);

        let (bytes, chunks, first_chunk_size) = self.read_body(request, &mut response).await?;
        inbound += bytes.len() as u64;

        let text = decode_document(&bytes, &request.encoding, &content_type)?;

        Ok(FetchResponse {
            final_url,
            new_location,
            outbound,
            inbound,
            duration: started.elapsed(),
            body: FetchBody::Document {
                text,
                last_modified,
                etag,
                transfer: TransferInfo {
                    content_length,
                    chunks,
                    first_chunk_size,
                },
            },
        })
    }
}

fn map_reqwest_error(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Http(err)
    }
}

fn header_string(headers: &HeaderMap, name: reqwest::header::HeaderName) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

fn request_size(url: &Url, headers: &HeaderMap) -> u64 {
    // Request line plus headers; the client adds a few more we do not see
    let line = url.as_str().len() + "GET  HTTP/1.1\r\n".len();
    (line + headers_size(headers) as usize) as u64
}

fn headers_size(headers: &HeaderMap) -> u64 {
    headers
        .iter()
        .map(|(name, value)| (name.as_str().len() + value.len() + 4) as u64)
        .sum()
}

/// Decode a feed document to UTF-8
///
/// The encoding comes from, in order: the feed's forced encoding, the
/// `Content-Type` charset, the XML declaration, then UTF-8. A non-UTF-8
/// declaration is rewritten so the XML parser does not decode twice.
pub fn decode_document(
    bytes: &[u8],
    forced: &str,
    content_type: &str,
) -> Result<String, FetchError> {
    let head = String::from_utf8_lossy(&bytes[..bytes.len().min(512)]);

    let declared = XML_ENCODING_REGEX
        .captures(&head)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string());

    let from_header = CHARSET_REGEX
        .captures(content_type)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string());

    let label = [Some(forced.to_string()), from_header, declared]
        .into_iter()
        .flatten()
        .find(|label| !label.trim().is_empty());

    let encoding = match label {
        Some(label) => Encoding::for_label(label.trim().as_bytes())
            .ok_or_else(|| FetchError::Decode(format!("unknown encoding '{label}'")))?,
        None => UTF_8,
    };

    let (text, actual, had_errors) = encoding.decode(bytes);
    if had_errors {
        return Err(FetchError::Decode(format!(
            "{} decoding errors",
            actual.name()
        )));
    }

    if actual == UTF_8 {
        return Ok(text.into_owned());
    }

    Ok(XML_ENCODING_REGEX
        .replace(&text, |caps: &regex::Captures| {
            let whole = &caps[0];
            let label = &caps[1];
            whole.replacen(label, "UTF-8", 1)
        })
        .into_owned())
}
