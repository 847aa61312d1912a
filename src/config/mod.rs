//! Configuration management for the feed puller
//!
//! Settings come from a TOML file or from `FEEDPULL_*` environment variables.
//! Every section has defaults, so a config file only needs the values it
//! changes. All periods are expressed in seconds unless noted otherwise.

use anyhow::{Context, Result};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Manager connection and control endpoint
    pub manager: ManagerConfig,

    /// Feed fetching and schedule computation
    pub feed_request: FeedRequestConfig,

    /// Feed state reconciliation and upstream state push
    pub saving_feed_state: SavingFeedStateConfig,

    /// Daily statistics push
    pub saving_feed_stat: SavingFeedStatConfig,

    /// Traffic-saving heuristics
    pub saving_traffic: SavingTrafficConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Manager connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Base URL of the manager API
    pub url: String,

    /// Liveness ping period
    pub poll_period: u64,

    /// Address the control server listens on
    pub listen_addr: String,

    /// Delay between login attempts
    pub login_retry_secs: u64,

    /// Manager request timeout
    pub request_timeout_secs: u64,
}

/// Fetch and schedule settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedRequestConfig {
    /// Number of fetch workers
    pub threads: usize,

    /// Ceiling on scheduled feed requests
    pub queue_capacity: usize,

    pub connect_timeout: u64,
    pub request_timeout: u64,

    /// Redirect hops followed before giving up
    pub redirects_to_follow: u32,

    /// Largest feed document read, in bytes
    pub max_feed_size: u64,

    pub user_agent: String,

    /// Outbound request rate limit
    pub requests_per_second: u32,

    /// Number of message intervals averaged for the publishing period
    pub approximate_msg_intervals: usize,

    /// Period used when neither TTL nor message history is available
    pub default_period: i64,

    /// Scale applied to the estimated message period
    pub message_period_factor: f64,

    pub min_period: i64,
    pub max_period: i64,
}

/// Feed state settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SavingFeedStateConfig {
    /// Upper bound between two state pushes
    pub max_delay: u64,

    /// Retry delay after a failed state push
    pub retry_timeout: u64,

    /// State updates per pushed pack
    pub packet_size: usize,

    /// Back-off for skipped or never-completed requests
    pub delay_on_failure: i64,

    /// Age after which a vanished message is forgotten
    pub message_timeout: i64,

    pub state_messages_factor: u32,
    pub min_state_messages: u32,
}

/// Statistics settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SavingFeedStatConfig {
    /// Period between stat pushes
    pub period: u64,

    /// Retry delay after a failed stat push
    pub retry_timeout: u64,

    /// Feed entries per stat packet
    pub packet_size: usize,

    /// Time of day (UTC, `HH:MM:SS`) at which the previous day is flushed
    pub flush_prev_day: String,

    /// Local stat cache written when the manager is unreachable
    pub cache_file: PathBuf,

    /// Days of statistics kept while pushes keep failing
    pub retained_days: usize,

    /// Consecutive push failures before the cache is written
    pub persist_after_failures: u32,
}

/// Traffic-saving heuristics settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SavingTrafficConfig {
    /// 0 = off, 1 = always, 2 = only while heuristics are active
    pub last_build_based: u32,

    pub heuristics: HeuristicsConfig,
}

/// Heuristics warm-up and sequence settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeuristicsConfig {
    /// Full parses required before heuristics are applied
    pub apply_after: i32,

    /// Full parses required before entropy is calculated
    pub calc_entropy_after: i32,

    /// Consecutive heuristic requests before a full parse is forced
    pub sequence_len: i32,

    pub content_length_based: bool,
    pub single_chunk_based: bool,
    pub ordering_based: bool,

    /// Idle time after which entropy is lowered by one, 0 disables
    pub force_down_entropy_after: i64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("FEEDPULL_MANAGER_URL") {
            config.manager.url = url;
        }
        if let Ok(addr) = std::env::var("FEEDPULL_LISTEN_ADDR") {
            config.manager.listen_addr = addr;
        }
        config.manager.poll_period = env_parse("FEEDPULL_POLL_PERIOD", config.manager.poll_period);

        config.feed_request.threads = env_parse("FEEDPULL_THREADS", config.feed_request.threads);
        config.feed_request.requests_per_second = env_parse(
            "FEEDPULL_REQUESTS_PER_SECOND",
            config.feed_request.requests_per_second,
        );
        config.feed_request.request_timeout = env_parse(
            "FEEDPULL_REQUEST_TIMEOUT",
            config.feed_request.request_timeout,
        );
        config.feed_request.max_feed_size = env_parse(
            "FEEDPULL_MAX_FEED_SIZE",
            config.feed_request.max_feed_size,
        );
        if let Ok(agent) = std::env::var("FEEDPULL_USER_AGENT") {
            config.feed_request.user_agent = agent;
        }

        if let Ok(path) = std::env::var("FEEDPULL_STAT_CACHE") {
            config.saving_feed_stat.cache_file = path.into();
        }

        if let Ok(level) = std::env::var("FEEDPULL_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Ok(format) = std::env::var("FEEDPULL_LOG_FORMAT") {
            config.logging.format = format;
        }

        Ok(config)
    }

    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.manager.url.is_empty() {
            anyhow::bail!("manager.url must be set");
        }

        if self.manager.poll_period == 0 {
            anyhow::bail!("manager.poll_period must be greater than 0");
        }

        let req = &self.feed_request;
        if req.threads == 0 {
            anyhow::bail!("feed_request.threads must be greater than 0");
        }

        if req.queue_capacity == 0 {
            anyhow::bail!("feed_request.queue_capacity must be greater than 0");
        }

        if req.max_feed_size == 0 {
            anyhow::bail!("feed_request.max_feed_size must be greater than 0");
        }

        if req.requests_per_second == 0 {
            anyhow::bail!("feed_request.requests_per_second must be greater than 0");
        }

        if req.message_period_factor.is_nan() || req.message_period_factor <= 0.0 {
            anyhow::bail!("feed_request.message_period_factor must be positive");
        }

        if req.min_period < 0 || req.max_period < req.min_period {
            anyhow::bail!(
                "feed_request periods must satisfy 0 <= min_period ({}) <= max_period ({})",
                req.min_period,
                req.max_period
            );
        }

        if req.default_period <= 0 {
            anyhow::bail!("feed_request.default_period must be positive");
        }

        let state = &self.saving_feed_state;
        if state.max_delay == 0 {
            anyhow::bail!("saving_feed_state.max_delay must be greater than 0");
        }

        if state.packet_size == 0 {
            anyhow::bail!("saving_feed_state.packet_size must be greater than 0");
        }

        if state.delay_on_failure <= 0 {
            anyhow::bail!("saving_feed_state.delay_on_failure must be positive");
        }

        let stat = &self.saving_feed_stat;
        if stat.period == 0 || stat.packet_size == 0 {
            anyhow::bail!("saving_feed_stat.period and packet_size must be greater than 0");
        }

        self.flush_prev_day_time()?;

        let heuristics = &self.saving_traffic.heuristics;
        if heuristics.apply_after < 0 || heuristics.calc_entropy_after < 0 {
            anyhow::bail!("heuristics warm-up counts must not be negative");
        }

        if self.saving_traffic.last_build_based > 2 {
            anyhow::bail!("saving_traffic.last_build_based must be 0, 1 or 2");
        }

        Ok(())
    }

    /// Parsed time of day for the previous-day stat flush
    pub fn flush_prev_day_time(&self) -> Result<NaiveTime> {
        NaiveTime::parse_from_str(&self.saving_feed_stat.flush_prev_day, "%H:%M:%S")
            .with_context(|| {
                format!(
                    "saving_feed_stat.flush_prev_day is not HH:MM:SS: {}",
                    self.saving_feed_stat.flush_prev_day
                )
            })
    }

    /// Get fetch request timeout as Duration
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.feed_request.request_timeout)
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.feed_request.connect_timeout)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            url: String::from("http://localhost:8080"),
            poll_period: 60,
            listen_addr: String::from("0.0.0.0:8090"),
            login_retry_secs: 10,
            request_timeout_secs: 30,
        }
    }
}

impl Default for FeedRequestConfig {
    fn default() -> Self {
        Self {
            threads: 10,
            queue_capacity: 100_000,
            connect_timeout: 20,
            request_timeout: 60,
            redirects_to_follow: 5,
            max_feed_size: 5 * 1024 * 1024,
            user_agent: format!("feedpull/{}", env!("CARGO_PKG_VERSION")),
            requests_per_second: 20,
            approximate_msg_intervals: 5,
            default_period: 3600,
            message_period_factor: 0.5,
            min_period: 600,
            max_period: 86_400,
        }
    }
}

impl Default for SavingFeedStateConfig {
    fn default() -> Self {
        Self {
            max_delay: 10,
            retry_timeout: 5,
            packet_size: 100,
            delay_on_failure: 600,
            message_timeout: 7 * 86_400,
            state_messages_factor: 2,
            min_state_messages: 50,
        }
    }
}

impl Default for SavingFeedStatConfig {
    fn default() -> Self {
        Self {
            period: 600,
            retry_timeout: 60,
            packet_size: 1000,
            flush_prev_day: String::from("00:10:00"),
            cache_file: PathBuf::from("data/feed_stat.json"),
            retained_days: 7,
            persist_after_failures: 3,
        }
    }
}

impl Default for SavingTrafficConfig {
    fn default() -> Self {
        Self {
            last_build_based: 1,
            heuristics: HeuristicsConfig::default(),
        }
    }
}

impl Default for HeuristicsConfig {
    fn default() -> Self {
        Self {
            apply_after: 3,
            calc_entropy_after: 3,
            sequence_len: 10,
            content_length_based: true,
            single_chunk_based: true,
            ordering_based: true,
            force_down_entropy_after: 7 * 86_400,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}
