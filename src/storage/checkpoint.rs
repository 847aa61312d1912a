//! Local cache of unsent feed statistics
//!
//! When the manager keeps rejecting stat pushes, or the puller shuts down
//! with counters still pending, the statistics are written to a JSON file
//! and merged back on the next start.
//!
//! # Example
//!
//! ```no_run
//! use feedpull::stats::StatAccumulator;
//! use feedpull::storage::checkpoint::StatCache;
//! use std::path::Path;
//!
//! # fn example() -> anyhow::Result<()> {
//! let cache = StatCache::new(Path::new("data/feed_stat.json"));
//! cache.save(&StatAccumulator::new(7))?;
//! let restored = cache.load(7)?;
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::stats::{FeedsStatistics, StatAccumulator};

/// File layout of the stat cache
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedStats {
    saved_at: DateTime<Utc>,
    days: Vec<FeedsStatistics>,
}

/// JSON file holding statistics not yet accepted by the manager
#[derive(Debug, Clone)]
pub struct StatCache {
    path: PathBuf,
}

impl StatCache {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `stats`, replacing any previous cache
    ///
    /// An empty accumulator removes the file instead.
    pub fn save(&self, stats: &StatAccumulator) -> Result<()> {
        if stats.is_empty() {
            return self.delete();
        }

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| {
                Error::with_source(format!("Failed to create cache directory: {}", dir.display()), e)
            })?;
        }

        // Write to temp file first, then rename (atomic)
        let mut temp_name = self.path.as_os_str().to_owned();
        temp_name.push(".tmp");
        let temp_path = PathBuf::from(temp_name);

        let file = File::create(&temp_path).map_err(|e| {
            Error::with_source(format!("Failed to create stat cache: {}", temp_path.display()), e)
        })?;

        let cached = CachedStats {
            saved_at: Utc::now(),
            days: stats.to_statistics(),
        };
        serde_json::to_writer_pretty(BufWriter::new(file), &cached)?;

        fs::rename(&temp_path, &self.path).map_err(|e| {
            Error::with_source(format!("Failed to rename stat cache: {}", self.path.display()), e)
        })?;

        tracing::info!(path = %self.path.display(), days = cached.days.len(), "Feed statistics cached");
        Ok(())
    }

    /// Read the cache; a missing file yields an empty accumulator
    pub fn load(&self, retained_days: usize) -> Result<StatAccumulator> {
        if !self.path.exists() {
            return Ok(StatAccumulator::new(retained_days));
        }

        let file = File::open(&self.path).map_err(|e| {
            Error::with_source(format!("Failed to open stat cache: {}", self.path.display()), e)
        })?;
        let cached: CachedStats = serde_json::from_reader(BufReader::new(file))?;

        tracing::info!(
            path = %self.path.display(),
            days = cached.days.len(),
            saved_at = %cached.saved_at,
            "Feed statistics restored"
        );
        Ok(StatAccumulator::from_statistics(cached.days, retained_days))
    }

    /// Remove the cache file if present
    pub fn delete(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path).map_err(|e| {
                Error::with_source(format!("Failed to delete stat cache: {}", self.path.display()), e)
            })?;
            tracing::debug!(path = %self.path.display(), "Stat cache deleted");
        }
        Ok(())
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorCategory, FeedpullErrorTrait};
    use crate::models::{FeedId, FeedRequestInfo};
    use tempfile::TempDir;

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let cache = StatCache::new(&dir.path().join("nested/feed_stat.json"));

        let mut stats = StatAccumulator::new(7);
        stats.accumulate(&[FeedRequestInfo::new(FeedId(4), 1_704_067_200)]);
        cache.save(&stats).unwrap();
        assert!(cache.exists());

        let restored = cache.load(7).unwrap();
        assert_eq!(restored, stats);
    }

    #[test]
    fn test_missing_cache_is_empty() {
        let dir = TempDir::new().unwrap();
        let cache = StatCache::new(&dir.path().join("none.json"));
        assert!(cache.load(7).unwrap().is_empty());
    }

    #[test]
    fn test_empty_save_deletes() {
        let dir = TempDir::new().unwrap();
        let cache = StatCache::new(&dir.path().join("feed_stat.json"));

        let mut stats = StatAccumulator::new(7);
        stats.accumulate(&[FeedRequestInfo::new(FeedId(1), 1_704_067_200)]);
        cache.save(&stats).unwrap();
        cache.save(&StatAccumulator::new(7)).unwrap();
        assert!(!cache.exists());
    }

    #[test]
    fn test_corrupt_cache_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("feed_stat.json");
        fs::write(&path, "not json").unwrap();
        let err = StatCache::new(&path).load(7).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Parsing);
    }
}
