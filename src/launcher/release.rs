// src/launcher/release.rs

//! Rate-limited release of admitted jobs.
//!
//! Launches are spread over the part of the interval that is left before the
//! release deadline, so that the executor never sees one large burst.

use std::time::Duration;

use crate::config::LauncherConfig;

/// How `job_count` admitted jobs are released within one interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleasePlan {
    pub job_count: usize,
    pub batch_size: usize,
    pub batches: usize,
    /// Pause between two consecutive batches. Never applied after the last.
    pub pause: Duration,
}

impl ReleasePlan {
    /// Plan releases for a cycle that starts `seconds_into_interval` seconds
    /// after the interval boundary.
    pub fn compute(job_count: usize, seconds_into_interval: u64, config: &LauncherConfig) -> Self {
        let window_end = config
            .release_deadline_seconds
            .saturating_sub(config.safety_margin_seconds);
        let remaining = window_end.saturating_sub(seconds_into_interval);
        let slice = config.slice_seconds.max(1);
        let slices = usize::try_from(remaining / slice).unwrap_or(usize::MAX).max(1);

        let batch_size = config.min_batch_size.max(job_count.div_ceil(slices)).max(1);
        let batches = job_count.div_ceil(batch_size);

        Self {
            job_count,
            batch_size,
            batches,
            pause: Duration::from_secs(slice),
        }
    }

    /// Index ranges of each batch over the admitted jobs.
    pub fn batch_ranges(&self) -> impl Iterator<Item = std::ops::Range<usize>> + '_ {
        (0..self.batches).map(move |i| {
            let start = i * self.batch_size;
            start..(start + self.batch_size).min(self.job_count)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> LauncherConfig {
        LauncherConfig {
            release_deadline_seconds: 50,
            safety_margin_seconds: 5,
            slice_seconds: 5,
            min_batch_size: 5,
            ..LauncherConfig::default()
        }
    }

    #[test]
    fn jobs_spread_over_remaining_slices() {
        // 45 s left -> 9 slices; 90 jobs -> batches of 10.
        let plan = ReleasePlan::compute(90, 0, &config());
        assert_eq!(plan.batch_size, 10);
        assert_eq!(plan.batches, 9);
        assert_eq!(plan.pause, Duration::from_secs(5));
    }

    #[test]
    fn small_loads_use_min_batch_size() {
        let plan = ReleasePlan::compute(7, 0, &config());
        assert_eq!(plan.batch_size, 5);
        assert_eq!(plan.batches, 2);
        let ranges: Vec<_> = plan.batch_ranges().collect();
        assert_eq!(ranges, vec![0..5, 5..7]);
    }

    #[test]
    fn late_start_releases_everything_at_once() {
        let plan = ReleasePlan::compute(30, 58, &config());
        assert_eq!(plan.batches, 1);
        assert_eq!(plan.batch_size, 30);
    }

    #[test]
    fn nothing_to_release() {
        let plan = ReleasePlan::compute(0, 0, &config());
        assert_eq!(plan.batches, 0);
        assert_eq!(plan.batch_ranges().count(), 0);
    }
}
