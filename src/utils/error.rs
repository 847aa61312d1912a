//! Error types for feed fetching and parsing
//!
//! `FetchError::ServiceStopped` is not a failure: it tells the caller the
//! request was abandoned because the puller is shutting down.

use thiserror::Error;

/// Errors that can occur while fetching a feed
#[derive(Error, Debug)]
pub enum FetchError {
    /// HTTP request error
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success status code
    #[error("Bad HTTP status: {0}")]
    BadStatus(u16),

    /// Request timeout
    #[error("Request timeout")]
    Timeout,

    /// Redirect chain longer than allowed or without a Location header
    #[error("Redirect error: {0}")]
    Redirect(String),

    /// Content decoding error
    #[error("Decoding error: {0}")]
    Decode(String),

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Body exceeded the configured size limit
    #[error("Feed document larger than {limit} bytes")]
    TooLarge { limit: u64 },

    /// Adjustment script missing or rejected
    #[error("Script error: {0}")]
    Script(String),

    /// Feed document could not be parsed
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    /// Puller is shutting down
    #[error("Service stopped")]
    ServiceStopped,
}

impl FetchError {
    /// Whether the error should be counted as a failed request
    pub fn is_failure(&self) -> bool {
        !matches!(self, Self::ServiceStopped)
    }

    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::BadStatus(code) => *code >= 500 || *code == 429,
            Self::Timeout | Self::ServiceStopped => true,
            Self::Redirect(_)
            | Self::Decode(_)
            | Self::InvalidUrl(_)
            | Self::TooLarge { .. }
            | Self::Script(_)
            | Self::Parse(_) => false,
        }
    }
}

/// Errors that can occur while parsing a feed document
#[derive(Error, Debug)]
pub enum ParseError {
    /// RSS or RDF document rejected by the parser
    #[error("Invalid RSS document: {0}")]
    Rss(String),

    /// Atom document rejected by the parser
    #[error("Invalid Atom document: {0}")]
    Atom(String),

    /// Neither RSS, RDF nor Atom
    #[error("Unknown or unsupported format")]
    UnknownFormat,
}
