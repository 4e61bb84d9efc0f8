//! Per-path write counter over a fixed window

use ahash::AHashMap;
use snap_core::{Error, Result};
use std::time::Duration;
use tokio::time::Instant;

/// Counts writes per path and trips once a path is written too often
/// within one window
#[derive(Debug)]
pub struct Heatmap {
    window: Duration,
    limit: u32,
    started: Option<Instant>,
    counts: AHashMap<String, u32>,
}

impl Heatmap {
    pub fn new(window: Duration, limit: u32) -> Self {
        Self {
            window,
            limit,
            started: None,
            counts: AHashMap::new(),
        }
    }

    /// Count one write to each distinct path in `paths`
    pub fn record<'a>(&mut self, paths: impl IntoIterator<Item = &'a str>, now: Instant) -> Result<()> {
        match self.started {
            Some(started) if now.duration_since(started) < self.window => {}
            _ => {
                self.counts.clear();
                self.started = Some(now);
            }
        }

        let mut seen: Vec<&str> = paths.into_iter().collect();
        seen.sort_unstable();
        seen.dedup();
        for path in seen {
            let count = self.counts.entry(path.to_string()).or_insert(0);
            *count += 1;
            if *count > self.limit {
                return Err(Error::TooManyWrites {
                    path: path.to_string(),
                    count: *count,
                });
            }
        }
        Ok(())
    }

    /// Writes counted for `path` in the current window
    pub fn count(&self, path: &str) -> u32 {
        self.counts.get(path).copied().unwrap_or(0)
    }
}
