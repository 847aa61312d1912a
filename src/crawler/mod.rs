//! Feed requesting
//!
//! - [`fetcher`] - HTTP fetching behind the [`FeedFetcher`] trait
//! - [`interceptor`] - early-stop checks run while reading a feed
//! - [`classifier`] - turns a fetch result into a state update and stats
//! - [`pool`] - the scheduled worker pool tying them together

pub mod classifier;
pub mod fetcher;
pub mod interceptor;
pub mod pool;

pub use classifier::{ClassifiedRequest, OutcomeClassifier};
pub use fetcher::{FeedFetcher, FetchBody, FetchRequest, FetchResponse, ReqwestFetcher};
pub use interceptor::ParseInterruption;
pub use pool::{AcceptOutcome, FeedWorkerPool, PullerTables};
