//! feedpull - adaptive RSS/Atom feed puller
//!
//! Pulls feeds on a per-feed schedule learned from how often each feed
//! publishes, skips work when a feed has evidently not changed, and
//! reports feed state and daily statistics to a manager.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Configuration management and settings
//! - [`models`] - Core data structures and types
//! - [`scheduler`] - Next-request computation, request queue, housekeeping
//! - [`crawler`] - Fetching, early-stop heuristics, outcome classification
//! - [`parser`] - RSS/RDF/Atom parsing and text cleanup
//! - [`stats`] - Daily per-feed statistics
//! - [`storage`] - Local statistics cache
//! - [`coordinator`] - Manager client, control server, session lifecycle
//! - [`metrics`] - Prometheus metrics
//! - [`utils`] - Common utilities and helpers
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use feedpull::config::Config;
//! use feedpull::coordinator::{HttpManagerClient, SessionHandle, SessionRunner};
//! use feedpull::crawler::ReqwestFetcher;
//! use feedpull::utils::SystemClock;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let manager = Arc::new(HttpManagerClient::new(&config.manager, "puller-1")?);
//!     let fetcher = Arc::new(ReqwestFetcher::new(&config.feed_request)?);
//!     let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//!
//!     SessionRunner::new(config, manager, fetcher, Arc::new(SystemClock), SessionHandle::new())
//!         .run(shutdown_rx)
//!         .await
//! }
//! ```

pub mod config;
pub mod coordinator;
pub mod crawler;
pub mod error;
pub mod metrics;
pub mod models;
pub mod parser;
pub mod scheduler;
pub mod stats;
pub mod storage;
pub mod utils;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::coordinator::{PullerManager, SessionRunner, UpstreamError};
    pub use crate::crawler::{FeedFetcher, FeedWorkerPool, OutcomeClassifier};
    pub use crate::error::{Error, ErrorCategory, FeedpullErrorTrait, Result};
    pub use crate::models::{FeedId, FeedPack, FeedRecord, FeedRequestOutcome, ScheduleRequestType};
    pub use crate::scheduler::{RequestQueue, RequestScheduler};
    pub use crate::stats::StatAccumulator;
}

// Direct re-exports for convenience
pub use models::{FeedId, FeedRecord, MessageId};
