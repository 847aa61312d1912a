use anyhow::{Context, Result};
use std::path::Path;

use feedpull::config::Config;
use feedpull::models::{FeedRecord, ScheduleRequestType};
use feedpull::scheduler::{RequestScheduler, SchedulePolicy};
use feedpull::utils::format_time;

/// Run the scheduler on a stored feed record and print its decision
pub fn replay(
    config: &Config,
    record_path: &Path,
    now: Option<i64>,
    request_type: ScheduleRequestType,
) -> Result<()> {
    let content = std::fs::read_to_string(record_path)
        .with_context(|| format!("Failed to read feed record: {}", record_path.display()))?;
    let record: FeedRecord = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse feed record: {}", record_path.display()))?;

    let now = now.unwrap_or_else(|| chrono::Utc::now().timestamp());
    let scheduler = RequestScheduler::new(SchedulePolicy::from_config(config));
    let decision = scheduler.next_request(&record, request_type, now);

    println!("Feed {} ({})", record.id, record.url);
    println!("  Request type:      {}", request_type.as_str());
    println!("  Now:               {}", format_time(now));
    println!(
        "  Last request:      {}",
        format_time(record.state.last_request_date)
    );
    println!("  Known messages:    {}", record.last_messages.len());
    println!(
        "  Next request:      {} (+{}s)",
        format_time(decision.request_time),
        decision.request_time - now
    );
    println!(
        "  No-message marker: {}",
        decision.no_message_request_time
    );
    if decision.forecast_failed {
        println!("  Previous forecast missed");
    }
    Ok(())
}
