// src/launcher/mod.rs

//! Admission and launch of planned jobs.
//!
//! This module is split into a pure core and an IO shell:
//!
//! - [`admission`] decides escalation, how many jobs to admit and which ones.
//! - [`release`] decides how admitted jobs are spread over the interval.
//! - [`Launcher`] reads and writes the store and talks to the executor.

pub mod admission;
pub mod release;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::config::ConfigFile;
use crate::errors::Result;
use crate::executor::{ExecutorClient, RunInfo, RunStatus, deployment_name, launch_parameters};
use crate::model::{Job, JobId, JobState};
use crate::store::{JobFilter, Store};

pub use admission::{admission_count, escalate, escalation_target, select_for_launch};
pub use release::ReleasePlan;

/// Job states counted against `max_running`. A launched job already holds an
/// executor slot even though its harness has not reported `running` yet.
pub const OCCUPYING_STATES: [JobState; 2] = [JobState::Launched, JobState::Running];

/// Structured result of one launch cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchReport {
    /// Jobs whose priority was raised.
    pub escalated: Vec<JobId>,
    /// Jobs moved to `launched` at the start of the cycle.
    pub admitted: Vec<JobId>,
    /// Admitted jobs the executor confirmed.
    pub confirmed: Vec<JobId>,
    /// Admitted jobs that went back to `planned`.
    pub reverted: Vec<JobId>,
    pub batches: usize,
}

/// What happened to one launch request.
enum LaunchResult {
    Confirmed(RunInfo),
    Rejected(String),
}

pub struct Launcher<E: ?Sized> {
    store: Arc<dyn Store>,
    executor: Arc<E>,
    config: Arc<ConfigFile>,
}

impl<E: ExecutorClient + ?Sized> Launcher<E> {
    pub fn new(store: Arc<dyn Store>, executor: Arc<E>, config: Arc<ConfigFile>) -> Self {
        Self {
            store,
            executor,
            config,
        }
    }

    /// Run one launch cycle as of `now`.
    ///
    /// Store errors abort the cycle. Executor errors never do: the affected
    /// jobs are returned to `planned` and picked up again next cycle.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<LaunchReport> {
        let mut report = LaunchReport {
            escalated: self.escalate_planned(now)?,
            ..LaunchReport::default()
        };

        let selected = self.admit(now)?;
        if selected.is_empty() {
            debug!("no jobs admitted this cycle");
            return Ok(report);
        }
        report.admitted = selected.iter().map(|job| job.id).collect();

        let mut results: HashMap<JobId, LaunchResult> = HashMap::new();

        let deployments = match self.executor.list_deployments().await {
            Ok(deployments) => deployments,
            Err(err) => {
                warn!(error = %err, "could not list deployments; reverting admitted jobs");
                HashMap::new()
            }
        };

        let mut requests = Vec::with_capacity(selected.len());
        for job in &selected {
            match deployments.get(&deployment_name(&job.stage)) {
                Some(deployment_id) => requests.push((job.id, deployment_id.clone())),
                None => {
                    warn!(job_id = job.id, stage = %job.stage, "no deployment for stage");
                    results.insert(
                        job.id,
                        LaunchResult::Rejected("deployment missing".to_string()),
                    );
                }
            }
        }

        let plan = ReleasePlan::compute(
            requests.len(),
            seconds_into_interval(now, self.config.launcher.interval_seconds),
            &self.config.launcher,
        );
        report.batches = plan.batches;
        debug!(
            jobs = requests.len(),
            batches = plan.batches,
            batch_size = plan.batch_size,
            "releasing admitted jobs"
        );

        for (index, range) in plan.batch_ranges().enumerate() {
            if index > 0 {
                tokio::time::sleep(plan.pause).await;
            }
            let batch = &requests[range];
            let outcomes = join_all(batch.iter().map(|(job_id, deployment_id)| {
                let job_id = *job_id;
                async move {
                    let outcome = self
                        .executor
                        .create_run(deployment_id, launch_parameters(job_id))
                        .await;
                    (job_id, outcome)
                }
            }))
            .await;

            for (job_id, outcome) in outcomes {
                let result = match outcome {
                    Ok(run) if run.status == RunStatus::Scheduled => LaunchResult::Confirmed(run),
                    Ok(run) => LaunchResult::Rejected(format!("run status '{}'", run.status)),
                    Err(err) => LaunchResult::Rejected(err.to_string()),
                };
                results.insert(job_id, result);
            }
        }

        let (confirmed, reverted) = self.reconcile(&selected, results)?;
        report.confirmed = confirmed;
        report.reverted = reverted;

        info!(
            admitted = report.admitted.len(),
            confirmed = report.confirmed.len(),
            reverted = report.reverted.len(),
            "launch cycle finished"
        );
        Ok(report)
    }

    /// Apply escalation tiers to every stage's planned jobs.
    fn escalate_planned(&self, now: DateTime<Utc>) -> Result<Vec<JobId>> {
        let mut tx = self.store.begin()?;
        let mut escalated = Vec::new();

        for (stage, stage_config) in &self.config.stage {
            if stage_config.escalation.is_empty() {
                continue;
            }
            let planned = tx.find_jobs(&JobFilter::in_state(JobState::Planned).stage(stage))?;
            for job in escalate(&planned, &stage_config.escalation, now) {
                debug!(job_id = job.id, stage = %stage, priority = job.priority, "priority escalated");
                tx.update_job(&job)?;
                escalated.push(job.id);
            }
        }

        tx.commit()?;
        Ok(escalated)
    }

    /// Pick this cycle's jobs and mark them `launched`.
    fn admit(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let mut tx = self.store.begin()?;

        let running = tx.count_jobs(&JobFilter::in_states(&OCCUPYING_STATES))?;
        let planned = tx.find_jobs(&JobFilter::in_state(JobState::Planned))?;
        let n = admission_count(
            self.config.launcher.max_running,
            running,
            planned.len(),
            self.config.launcher.max_launch_per_cycle,
        );
        debug!(running, planned = planned.len(), admitted = n, "admission");
        if n == 0 {
            return Ok(Vec::new());
        }

        let mut selected = select_for_launch(planned, n);
        for job in &mut selected {
            job.state = JobState::Launched;
            job.launch_time = Some(now);
            tx.update_job(job)?;
        }
        tx.commit()?;
        Ok(selected)
    }

    /// Record confirmed runs and return every other admitted job to `planned`.
    fn reconcile(
        &self,
        selected: &[Job],
        mut results: HashMap<JobId, LaunchResult>,
    ) -> Result<(Vec<JobId>, Vec<JobId>)> {
        let mut tx = self.store.begin()?;
        let mut confirmed = Vec::new();
        let mut reverted = Vec::new();

        for admitted in selected {
            let Some(mut job) = tx.job(admitted.id)? else {
                warn!(job_id = admitted.id, "admitted job disappeared");
                continue;
            };

            match results.remove(&admitted.id) {
                Some(LaunchResult::Confirmed(run)) => {
                    if job.state == JobState::Launched && job.run_id.is_none() {
                        job.run_id = Some(run.id);
                        job.run_name = Some(run.name);
                        tx.update_job(&job)?;
                    }
                    confirmed.push(job.id);
                }
                rejected => {
                    let reason = match rejected {
                        Some(LaunchResult::Rejected(reason)) => reason,
                        _ => "no launch attempted".to_string(),
                    };
                    if job.state == JobState::Launched {
                        warn!(job_id = job.id, reason = %reason, "launch not confirmed; job back to planned");
                        job.unlaunch();
                        tx.update_job(&job)?;
                        reverted.push(job.id);
                    }
                }
            }
        }

        tx.commit()?;
        Ok((confirmed, reverted))
    }
}

/// Seconds elapsed since the last interval boundary.
fn seconds_into_interval(now: DateTime<Utc>, interval_seconds: u64) -> u64 {
    let interval = i64::try_from(interval_seconds.max(1)).unwrap_or(i64::MAX);
    now.timestamp().rem_euclid(interval).unsigned_abs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn interval_offset_wraps() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 1, 7).unwrap();
        assert_eq!(seconds_into_interval(at, 60), 7);
        assert_eq!(seconds_into_interval(at, 0), 0);
    }
}
