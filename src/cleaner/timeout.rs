// src/cleaner/timeout.rs

//! Detection of jobs stuck in `launched` or `running`.

use chrono::{DateTime, TimeDelta, Utc};

use crate::config::{ConfigFile, StageConfig};
use crate::errors::Result;
use crate::model::{Job, JobState};
use crate::store::{JobFilter, StoreRead};

/// States the timeout applies to.
pub const WATCHED_STATES: [JobState; 2] = [JobState::Launched, JobState::Running];

/// Configured wait for `state`, in minutes. Negative means no limit.
pub fn max_wait_minutes(config: &StageConfig, state: JobState) -> i64 {
    match state {
        JobState::Launched => config.max_wait_minutes_launched,
        JobState::Running => config.max_wait_minutes_running,
        _ => -1,
    }
}

/// Launch times before this instant are too old.
///
/// `None` when disabled, or when the limit reaches past the representable
/// calendar and so no job can exceed it.
pub fn cutoff(max_wait_minutes: i64, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if max_wait_minutes < 0 {
        return None;
    }
    TimeDelta::try_minutes(max_wait_minutes).and_then(|wait| now.checked_sub_signed(wait))
}

/// Every job past its stage's limit for the state it is in.
pub fn find_stuck_jobs(
    store: &dyn StoreRead,
    config: &ConfigFile,
    now: DateTime<Utc>,
) -> Result<Vec<Job>> {
    let mut stuck = Vec::new();
    for (stage, stage_config) in &config.stage {
        for state in WATCHED_STATES {
            let Some(cutoff) = cutoff(max_wait_minutes(stage_config, state), now) else {
                continue;
            };
            stuck.extend(store.find_jobs(
                &JobFilter::in_state(state)
                    .stage(stage)
                    .launched_before(cutoff),
            )?);
        }
    }
    Ok(stuck)
}
