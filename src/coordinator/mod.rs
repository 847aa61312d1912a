//! Talking to the puller manager
//!
//! The manager owns the feed set. It logs the puller in, pushes feed packs
//! to it, and receives feed state updates and daily statistics back.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐   POST /api/feeds    ┌──────────────────────────┐
//! │                  │ ───────────────────▶ │  ControlServer (axum)    │
//! │     Manager      │                      │    └─▶ FeedWorkerPool    │
//! │                  │ ◀─────────────────── │  HttpManagerClient       │
//! └──────────────────┘  login / ping /      │    ◀── Housekeeping      │
//!                       feed-state / stat   └──────────────────────────┘
//! ```
//!
//! - [`client`] - reqwest implementation of [`PullerManager`]
//! - [`server`] - axum control endpoints
//! - [`session`] - login/pull/logout state machine

pub mod client;
pub mod server;
pub mod session;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{FeedStateUpdatePack, SessionId};
use crate::stats::FeedsStatistics;

pub use client::HttpManagerClient;
pub use server::ControlServer;
pub use session::{PullerState, SessionCommand, SessionEvent, SessionHandle, SessionRunner};

/// Errors returned by the manager
#[derive(Error, Debug)]
pub enum UpstreamError {
    /// Manager is up but cannot take the call right now
    #[error("Manager not ready: {0}")]
    NotReady(String),

    /// Session is no longer valid
    #[error("Manager requested logout")]
    Logout,

    #[error("Manager transport error: {0}")]
    Transport(String),

    /// Manager refused the call
    #[error("Manager rejected request: {0}")]
    Rejected(String),
}

impl UpstreamError {
    /// Whether the call may succeed if retried in the same session
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::NotReady(_) | Self::Transport(_))
    }

    /// Label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotReady(_) => "not_ready",
            Self::Logout => "logout",
            Self::Transport(_) => "transport",
            Self::Rejected(_) => "rejected",
        }
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Result sink and liveness channel of the puller
#[async_trait]
pub trait PullerManager: Send + Sync {
    /// Open a session
    async fn login(&self) -> Result<SessionId, UpstreamError>;

    async fn logout(&self, session: &SessionId) -> Result<(), UpstreamError>;

    async fn ping(&self, session: &SessionId) -> Result<(), UpstreamError>;

    /// Push feed state updates; `Ok(false)` means the pack was not taken
    async fn feed_state(
        &self,
        session: &SessionId,
        pack: &FeedStateUpdatePack,
    ) -> Result<bool, UpstreamError>;

    /// Push one day's worth of feed statistics
    async fn feed_stat(
        &self,
        session: &SessionId,
        stats: &FeedsStatistics,
    ) -> Result<(), UpstreamError>;
}
