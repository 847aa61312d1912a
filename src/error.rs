//! Unified error handling for the feedpull crate
//!
//! Domain errors stay in their modules; [`Error`] wraps them when a value
//! has to cross module boundaries.
//!
//! - [`FeedpullErrorTrait`] - Common interface implemented by all error types
//! - [`ErrorCategory`] - Classification of errors for handling strategies
//! - [`Error`] - Unified error enum wrapping all domain-specific errors

use std::io;
use thiserror::Error;

pub use crate::coordinator::UpstreamError;
pub use crate::scheduler::error::SchedulerError;
pub use crate::utils::error::{FetchError, ParseError};

/// Common trait for all feedpull error types
pub trait FeedpullErrorTrait: std::error::Error {
    /// Check if this error is recoverable (can be retried)
    fn is_recoverable(&self) -> bool;

    /// Get the error category for handling strategies
    fn category(&self) -> ErrorCategory;
}

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Feed fetching (HTTP, timeout, redirects)
    Network,
    /// Feed document parsing
    Parsing,
    /// Manager session and pushes
    Upstream,
    /// Local stat cache and other I/O
    Storage,
    /// Scheduling and queueing errors
    Scheduler,
    /// Other/unknown errors
    Other,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Parsing => "parsing",
            Self::Upstream => "upstream",
            Self::Storage => "storage",
            Self::Scheduler => "scheduler",
            Self::Other => "other",
        }
    }
}

/// Unified error type for the feedpull crate
#[derive(Error, Debug)]
pub enum Error {
    /// Fetch-specific errors
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// Parse-specific errors
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    /// Manager communication errors
    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    /// Scheduler and queueing errors
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{context}")]
    Other {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl FeedpullErrorTrait for Error {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::Fetch(e) => e.is_recoverable(),
            Self::Parse(_) => false,
            Self::Upstream(e) => e.is_recoverable(),
            Self::Scheduler(e) => e.is_recoverable(),
            Self::Io(_) => true,
            Self::Json(_) => false,
            Self::Other { .. } => false,
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Fetch(FetchError::Parse(_)) | Self::Parse(_) | Self::Json(_) => {
                ErrorCategory::Parsing
            }
            Self::Fetch(_) => ErrorCategory::Network,
            Self::Upstream(_) => ErrorCategory::Upstream,
            Self::Io(_) => ErrorCategory::Storage,
            Self::Scheduler(_) => ErrorCategory::Scheduler,
            Self::Other {
                source: Some(source),
                ..
            } if source.is::<std::io::Error>() => ErrorCategory::Storage,
            Self::Other { .. } => ErrorCategory::Other,
        }
    }
}

impl Error {
    /// Create a generic error with context and source
    pub fn with_source(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Other {
            context: context.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category() {
        let fetch_err = Error::Fetch(FetchError::Timeout);
        assert_eq!(fetch_err.category(), ErrorCategory::Network);

        let parse_err = Error::Fetch(FetchError::Parse(ParseError::UnknownFormat));
        assert_eq!(parse_err.category(), ErrorCategory::Parsing);

        let queue_err = Error::Scheduler(SchedulerError::QueueClosed);
        assert_eq!(queue_err.category(), ErrorCategory::Scheduler);
    }

    #[test]
    fn test_is_recoverable() {
        assert!(Error::Fetch(FetchError::Timeout).is_recoverable());
        assert!(!Error::Parse(ParseError::UnknownFormat).is_recoverable());
        assert!(Error::Upstream(UpstreamError::NotReady("busy".into())).is_recoverable());
        assert!(!Error::Upstream(UpstreamError::Logout).is_recoverable());
    }

    #[test]
    fn test_error_conversion() {
        let unified: Error = SchedulerError::QueueClosed.into();
        assert!(matches!(unified, Error::Scheduler(_)));
    }

    #[test]
    fn test_io_context_is_storage() {
        let err = Error::with_source(
            "Failed to open stat cache",
            io::Error::new(io::ErrorKind::NotFound, "gone"),
        );
        assert_eq!(err.category(), ErrorCategory::Storage);
        assert_eq!(err.to_string(), "Failed to open stat cache");
    }

    #[test]
    fn test_other_error() {
        let err = Error::Other {
            context: "Something went wrong".into(),
            source: None,
        };
        assert_eq!(err.category(), ErrorCategory::Other);
        assert_eq!(ErrorCategory::Other.as_str(), "other");
    }
}
