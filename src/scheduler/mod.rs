//! Feed request scheduling
//!
//! # Overview
//!
//! Every tracked feed has exactly one pending request in the
//! [`RequestQueue`]. Its fire time comes from [`RequestScheduler`], which
//! looks at how often the feed has published lately, its channel TTL, and
//! the configured bounds.
//!
//! | Request type     | When                                   |
//! |------------------|----------------------------------------|
//! | `FirstRequest`   | feed just added or its URL changed     |
//! | `Regular`        | after every completed request          |
//! | `SkippedRequest` | manager is not taking results          |
//!
//! # Modules
//!
//! - [`request`] - the pure next-request computation
//! - [`queue`] - bounded time-ordered queue of pending requests
//! - [`trigger`] - periodic state/stat pushes and pings
//! - [`error`] - scheduling errors
//!
//! # Example
//!
//! ```
//! use feedpull::models::{FeedId, FeedRecord, ScheduleRequestType};
//! use feedpull::scheduler::{RequestScheduler, SchedulePolicy};
//!
//! let scheduler = RequestScheduler::new(SchedulePolicy::default());
//! let record = FeedRecord {
//!     id: FeedId(1),
//!     url: "http://example.com/rss".to_string(),
//!     encoding: String::new(),
//!     feed_type: Default::default(),
//!     space: 0,
//!     language: String::new(),
//!     country: String::new(),
//!     adjustment_script: String::new(),
//!     state: Default::default(),
//!     last_messages: Vec::new(),
//!     no_message_request_time: 0,
//!     update_number: 1,
//! };
//!
//! // A feed never requested before fires right away
//! let decision = scheduler.next_request(&record, ScheduleRequestType::FirstRequest, 1_000);
//! assert_eq!(decision.request_time, 1_000);
//! ```

pub mod error;
pub mod queue;
pub mod request;
pub mod trigger;

pub use error::{SchedulerError, SchedulerResult};
pub use queue::{RequestQueue, ScheduledRequest};
pub use request::{RequestScheduler, ScheduleDecision, SchedulePolicy};
pub use trigger::{Housekeeping, HousekeepingExit};
