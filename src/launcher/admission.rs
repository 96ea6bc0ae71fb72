// src/launcher/admission.rs

//! Pure admission logic: priority escalation, admission count and launch
//! ordering. No IO; the launcher shell feeds it rows read from the store.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};

use crate::config::EscalationTier;
use crate::model::Job;

/// Priority floor for a job that has waited `waited_seconds`.
///
/// Picks the highest tier whose threshold has been reached, regardless of the
/// order the tiers are configured in. `None` when no tier qualifies.
pub fn escalation_target(tiers: &[EscalationTier], waited_seconds: i64) -> Option<i64> {
    tiers
        .iter()
        .filter(|tier| tier.wait_seconds <= waited_seconds)
        .max_by_key(|tier| tier.wait_seconds)
        .map(|tier| tier.priority)
}

/// Raise the priority of each job to its escalation target.
///
/// Priorities never decrease. Returns the jobs whose priority changed, with
/// the new value applied.
pub fn escalate(jobs: &[Job], tiers: &[EscalationTier], now: DateTime<Utc>) -> Vec<Job> {
    jobs.iter()
        .filter_map(|job| {
            let target = escalation_target(tiers, job.waited_seconds(now))?;
            (target > job.priority).then(|| Job {
                priority: target,
                ..job.clone()
            })
        })
        .collect()
}

/// How many planned jobs may be launched this cycle.
///
/// `min(clamp(max_running - running, 0, max_launch_per_cycle), planned)`.
pub fn admission_count(
    max_running: usize,
    running: usize,
    planned: usize,
    max_launch_per_cycle: usize,
) -> usize {
    max_running
        .saturating_sub(running)
        .min(max_launch_per_cycle)
        .min(planned)
}

/// Launch order: live work before backfill, then higher priority, then older
/// jobs, then lower id.
pub fn launch_order(a: &Job, b: &Job) -> Ordering {
    a.is_backfill
        .cmp(&b.is_backfill)
        .then_with(|| b.priority.cmp(&a.priority))
        .then_with(|| a.creation_time.cmp(&b.creation_time))
        .then_with(|| a.id.cmp(&b.id))
}

/// The first `n` jobs in [`launch_order`].
pub fn select_for_launch(mut jobs: Vec<Job>, n: usize) -> Vec<Job> {
    jobs.sort_by(launch_order);
    jobs.truncate(n);
    jobs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewJob;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn job(id: i64, is_backfill: bool, priority: i64) -> Job {
        NewJob::new("l1", "img", &serde_json::Value::Null, t0())
            .with_priority(priority)
            .backfill(is_backfill)
            .into_job(id)
    }

    fn tiers() -> Vec<EscalationTier> {
        vec![
            EscalationTier {
                wait_seconds: 86_400,
                priority: 100,
            },
            EscalationTier {
                wait_seconds: 3_600,
                priority: 50,
            },
        ]
    }

    #[test]
    fn highest_qualifying_tier_wins() {
        assert_eq!(escalation_target(&tiers(), 60), None);
        assert_eq!(escalation_target(&tiers(), 3_600), Some(50));
        assert_eq!(escalation_target(&tiers(), 90_000), Some(100));
    }

    #[test]
    fn escalation_never_lowers_priority() {
        let jobs = vec![job(1, false, 10), job(2, false, 500)];
        let now = t0() + Duration::hours(2);

        let changed = escalate(&jobs, &tiers(), now);

        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].id, 1);
        assert_eq!(changed[0].priority, 50);
    }

    #[test]
    fn live_work_beats_backfill_at_equal_priority() {
        let jobs = vec![job(1, false, 5), job(2, false, 100), job(3, true, 100)];
        let picked = select_for_launch(jobs, 1);
        assert_eq!(picked.iter().map(|j| j.id).collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn ties_break_on_age_then_id() {
        let mut older = job(9, false, 1);
        older.creation_time = t0() - Duration::minutes(1);
        let jobs = vec![job(4, false, 1), job(3, false, 1), older];
        let picked = select_for_launch(jobs, 3);
        assert_eq!(picked.iter().map(|j| j.id).collect::<Vec<_>>(), vec![9, 3, 4]);
    }

    #[test]
    fn admission_is_zero_when_saturated() {
        assert_eq!(admission_count(40, 40, 10, 20), 0);
        assert_eq!(admission_count(40, 45, 10, 20), 0);
        assert_eq!(admission_count(40, 10, 100, 20), 20);
        assert_eq!(admission_count(40, 35, 100, 20), 5);
        assert_eq!(admission_count(40, 0, 3, 20), 3);
    }

    proptest! {
        #[test]
        fn admission_respects_every_bound(
            max_running in 0usize..200,
            running in 0usize..300,
            planned in 0usize..300,
            per_cycle in 0usize..100,
        ) {
            let n = admission_count(max_running, running, planned, per_cycle);
            prop_assert!(n <= planned);
            prop_assert!(n <= per_cycle);
            prop_assert!(running + n <= max_running.max(running));
        }

        #[test]
        fn escalation_is_monotonic_in_wait(a in 0i64..200_000, b in 0i64..200_000) {
            let (short, long) = if a <= b { (a, b) } else { (b, a) };
            let lo = escalation_target(&tiers(), short).unwrap_or(i64::MIN);
            let hi = escalation_target(&tiers(), long).unwrap_or(i64::MIN);
            prop_assert!(lo <= hi);
        }
    }
}
