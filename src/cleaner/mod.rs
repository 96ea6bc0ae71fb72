// src/cleaner/mod.rs

//! Periodic repair pass.
//!
//! - [`revival`] plans the removal of revivable jobs and their outputs.
//! - [`timeout`] finds jobs stuck in `launched` / `running`.
//!
//! [`Cleaner`] applies both, and additionally fails jobs whose executor run
//! ended abnormally without the harness recording it.

pub mod revival;
pub mod timeout;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::config::ConfigFile;
use crate::errors::Result;
use crate::executor::{ExecutorClient, RunFilter, RunStatus};
use crate::fs::{ArtifactLayout, FileSystem, prune_empty_dirs};
use crate::model::{Job, JobId, JobState, ProductState};
use crate::store::{JobFilter, Store, Transaction, set_product_states};

pub use revival::RevivalPlan;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RevivalReport {
    pub jobs_deleted: usize,
    pub products_deleted: usize,
    pub parents_reset: usize,
    pub files_removed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimeoutReport {
    pub failed: Vec<JobId>,
    pub cancel_requested: usize,
    pub cancel_failed: usize,
}

/// Outcome of a full cleaner pass. A section is `None` when it errored; the
/// error has been logged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanReport {
    pub revival: Option<RevivalReport>,
    pub timeout: Option<TimeoutReport>,
    pub crashed: Option<Vec<JobId>>,
}

pub struct Cleaner<E: ?Sized> {
    store: Arc<dyn Store>,
    executor: Arc<E>,
    fs: Arc<dyn FileSystem>,
    layout: ArtifactLayout,
    config: Arc<ConfigFile>,
}

impl<E: ExecutorClient + ?Sized> Cleaner<E> {
    pub fn new(
        store: Arc<dyn Store>,
        executor: Arc<E>,
        fs: Arc<dyn FileSystem>,
        layout: ArtifactLayout,
        config: Arc<ConfigFile>,
    ) -> Self {
        Self {
            store,
            executor,
            fs,
            layout,
            config,
        }
    }

    /// Run revival, stuck-job timeout and crashed-run reconciliation.
    pub async fn run_pass(&self, now: DateTime<Utc>) -> CleanReport {
        let revival = self
            .revive()
            .inspect_err(|err| warn!(error = %err, "revival pass failed"))
            .ok();
        let timeout = self
            .time_out_stuck_jobs(now)
            .await
            .inspect_err(|err| warn!(error = %err, "timeout pass failed"))
            .ok();
        let crashed = self
            .reconcile_crashed_runs(now)
            .await
            .inspect_err(|err| warn!(error = %err, "crashed-run reconciliation failed"))
            .ok();

        CleanReport {
            revival,
            timeout,
            crashed,
        }
    }

    /// Delete revivable jobs and their outputs and re-enable their inputs.
    ///
    /// Artifact files are removed before the store changes are committed;
    /// files that are already gone are skipped.
    pub fn revive(&self) -> Result<RevivalReport> {
        let mut tx = self.store.begin()?;
        let plan = RevivalPlan::build(tx.as_read(), &self.config)?;
        if plan.is_empty() {
            return Ok(RevivalReport::default());
        }

        let mut report = RevivalReport::default();

        for child in &plan.children {
            let key = child.key();
            let removed = self.layout.remove_artifact(self.fs.as_ref(), &key)?;
            report.files_removed += removed.len();
            let pruned = prune_empty_dirs(self.fs.as_ref(), &self.layout.dir_for(&key), self.layout.root())?;
            if !pruned.is_empty() {
                debug!(product_id = child.id, dirs = pruned.len(), "pruned empty directories");
            }
        }

        for &parent_id in &plan.parents_to_reset {
            if let Some(mut parent) = tx.product(parent_id)? {
                parent.state = ProductState::Created;
                tx.update_product(&parent)?;
                report.parents_reset += 1;
            }
        }

        for child in &plan.children {
            tx.delete_relationships_touching(child.id)?;
            tx.delete_product(child.id)?;
            report.products_deleted += 1;
        }

        for &job_id in &plan.jobs {
            tx.delete_job(job_id)?;
            report.jobs_deleted += 1;
        }

        tx.commit()?;

        info!(
            jobs = report.jobs_deleted,
            products = report.products_deleted,
            parents_reset = report.parents_reset,
            files = report.files_removed,
            "revived jobs"
        );
        Ok(report)
    }

    /// Fail jobs stuck past their stage's limit and cancel their runs.
    ///
    /// Only `running` jobs get a cancellation request; `launched` jobs are not
    /// known to the executor yet.
    pub async fn time_out_stuck_jobs(&self, now: DateTime<Utc>) -> Result<TimeoutReport> {
        let stuck = self.fail_stuck_jobs(now)?;

        let mut report = TimeoutReport {
            failed: stuck.iter().map(|job| job.id).collect(),
            ..TimeoutReport::default()
        };

        let to_cancel: Vec<String> = stuck
            .into_iter()
            .filter(|job| job.state == JobState::Running)
            .filter_map(|job| job.run_id)
            .collect();

        let batch_size = self.config.cleaner.cancel_batch_size.max(1);
        let pause = Duration::from_millis(self.config.cleaner.cancel_pause_ms);

        for (index, batch) in to_cancel.chunks(batch_size).enumerate() {
            if index > 0 {
                tokio::time::sleep(pause).await;
            }
            let outcomes = join_all(batch.iter().map(|run_id| async move {
                (run_id, self.executor.cancel_run(run_id).await)
            }))
            .await;

            for (run_id, outcome) in outcomes {
                report.cancel_requested += 1;
                if let Err(err) = outcome {
                    warn!(run_id = %run_id, error = %err, "cancellation request failed");
                    report.cancel_failed += 1;
                }
            }
        }

        if !report.failed.is_empty() {
            info!(
                failed = report.failed.len(),
                cancelled = report.cancel_requested - report.cancel_failed,
                "timed out stuck jobs"
            );
        }
        Ok(report)
    }

    /// Mark stuck jobs and their products failed. Returns the jobs as they
    /// were before the update.
    fn fail_stuck_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let mut tx = self.store.begin()?;
        let stuck = timeout::find_stuck_jobs(tx.as_read(), &self.config, now)?;
        for job in &stuck {
            warn!(
                job_id = job.id,
                stage = %job.stage,
                state = %job.state,
                "job exceeded its wait limit"
            );
            fail_job(&mut *tx, job.clone(), now)?;
        }
        tx.commit()?;
        Ok(stuck)
    }

    /// Fail `launched` / `running` jobs whose run ended abnormally.
    pub async fn reconcile_crashed_runs(&self, now: DateTime<Utc>) -> Result<Vec<JobId>> {
        let runs = self
            .executor
            .list_runs(&RunFilter::with_statuses(&RunStatus::ABNORMAL_END))
            .await?;
        let ended: HashSet<String> = runs.into_iter().map(|run| run.id).collect();
        if ended.is_empty() {
            return Ok(Vec::new());
        }

        self.fail_jobs_of_runs(&ended, now)
    }

    fn fail_jobs_of_runs(&self, run_ids: &HashSet<String>, now: DateTime<Utc>) -> Result<Vec<JobId>> {
        let mut tx = self.store.begin()?;
        let mut failed = Vec::new();
        for job in tx.find_jobs(&JobFilter::in_states(&[JobState::Launched, JobState::Running]))? {
            if job.run_id.as_ref().is_some_and(|id| run_ids.contains(id)) {
                warn!(job_id = job.id, run_id = ?job.run_id, "run ended abnormally; failing job");
                failed.push(job.id);
                fail_job(&mut *tx, job, now)?;
            }
        }
        tx.commit()?;
        Ok(failed)
    }
}

fn fail_job(tx: &mut dyn Transaction, mut job: Job, now: DateTime<Utc>) -> Result<()> {
    job.finish(JobState::Failed, now);
    tx.update_job(&job)?;
    let mut products = tx.products_for_job(job.id)?;
    set_product_states(tx, &mut products, ProductState::Failed)
}
