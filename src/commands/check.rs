use anyhow::Result;

use feedpull::config::Config;

pub fn check_config(config: &Config) -> Result<()> {
    config.validate()?;
    let flush = config.flush_prev_day_time()?;

    println!("Configuration OK");
    println!("  Manager:          {}", config.manager.url);
    println!("  Listen address:   {}", config.manager.listen_addr);
    println!("  Worker threads:   {}", config.feed_request.threads);
    println!(
        "  Request period:   {}s .. {}s",
        config.feed_request.min_period, config.feed_request.max_period
    );
    println!(
        "  State push:       every {}s, {} updates per pack",
        config.saving_feed_state.max_delay, config.saving_feed_state.packet_size
    );
    println!(
        "  Stat push:        every {}s, previous day flushed at {}",
        config.saving_feed_stat.period, flush
    );
    println!(
        "  Stat cache:       {}",
        config.saving_feed_stat.cache_file.display()
    );
    Ok(())
}
