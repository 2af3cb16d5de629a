//! Frame completion statistics
//!
//! Every surface keeps a [`FrameClock`] fed with the server timestamps of
//! its frame-completion callbacks. The clock keeps a bounded history and
//! derives the presentation interval and rate from it.

use std::collections::VecDeque;
use std::time::Duration;

/// Statistics about presented frames
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameStats {
    /// Frames the server reported as presented
    pub presented: u64,
    /// Average interval between presentations over the history
    pub avg_interval: Duration,
    /// Shortest interval in the history
    pub min_interval: Duration,
    /// Longest interval in the history
    pub max_interval: Duration,
    /// Presentations per second derived from the average interval
    pub fps: f32,
}

/// Bounded history of frame-completion timestamps.
#[derive(Debug, Clone)]
pub struct FrameClock {
    history: VecDeque<u32>,
    capacity: usize,
    presented: u64,
}

impl FrameClock {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            history: VecDeque::with_capacity(capacity),
            capacity,
            presented: 0,
        }
    }

    /// Records a completion timestamp in milliseconds.
    pub fn record(&mut self, time_ms: u32) {
        self.history.push_back(time_ms);
        if self.history.len() > self.capacity {
            self.history.pop_front();
        }
        self.presented += 1;
    }

    pub fn presented(&self) -> u64 {
        self.presented
    }

    /// Timestamp of the last completion.
    pub fn last(&self) -> Option<u32> {
        self.history.back().copied()
    }

    pub fn stats(&self) -> FrameStats {
        let intervals: Vec<u32> = self
            .history
            .iter()
            .zip(self.history.iter().skip(1))
            .map(|(a, b)| b.wrapping_sub(*a))
            .collect();

        let mut stats = FrameStats {
            presented: self.presented,
            ..FrameStats::default()
        };
        if intervals.is_empty() {
            return stats;
        }

        let total: u64 = intervals.iter().map(|&ms| ms as u64).sum();
        let avg_ms = total as f64 / intervals.len() as f64;
        stats.avg_interval = Duration::from_secs_f64(avg_ms / 1000.0);
        stats.min_interval = Duration::from_millis(intervals.iter().copied().min().unwrap_or(0) as u64);
        stats.max_interval = Duration::from_millis(intervals.iter().copied().max().unwrap_or(0) as u64);
        if avg_ms > 0.0 {
            stats.fps = (1000.0 / avg_ms) as f32;
        }
        stats
    }

    pub fn reset(&mut self) {
        self.history.clear();
        self.presented = 0;
    }
}

impl Default for FrameClock {
    fn default() -> Self {
        Self::new(120)
    }
}
