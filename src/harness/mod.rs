// src/harness/mod.rs

//! Processing harness: wraps one job execution.
//!
//! The harness moves a `launched` job to `running`, runs the stage's
//! transformation, reconciles returned artifacts against the job's expected
//! products and finalizes state. Whatever fails after the job was picked up,
//! the job and all its products end up `failed` before the error is returned
//! to the executor. A job that someone else moved out of `running` meanwhile
//! (for example to `revivable`) keeps the state it was given.

use std::collections::HashMap;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::errors::{ReductorError, Result};
use crate::fs::{ArtifactLayout, FileSystem};
use crate::model::{Job, JobId, JobState, Product, ProductId, ProductKey, ProductState};
use crate::stage::{Artifact, ArtifactContent, ParameterContext, Transformation};
use crate::store::{Store, Transaction, set_product_states};

/// Executor-side identity of the run executing a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunIdentity {
    pub name: String,
    pub id: String,
}

/// What happened to a job handed to [`Harness::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HarnessOutcome {
    /// The job was not `launched`; nothing was touched.
    Skipped { state: JobState },
    Completed {
        created: Vec<ProductId>,
        blank: Vec<ProductId>,
        unreported: Vec<ProductId>,
    },
}

pub struct Harness<'a> {
    store: &'a dyn Store,
    fs: &'a dyn FileSystem,
    layout: &'a ArtifactLayout,
}

impl<'a> Harness<'a> {
    pub fn new(store: &'a dyn Store, fs: &'a dyn FileSystem, layout: &'a ArtifactLayout) -> Self {
        Self { store, fs, layout }
    }

    /// Execute `job_id` with `transformation`.
    ///
    /// Returns [`HarnessOutcome::Skipped`] without side effects when the job
    /// is not `launched` (duplicate or late invocation).
    pub fn run(
        &self,
        job_id: JobId,
        identity: &RunIdentity,
        transformation: &dyn Transformation,
    ) -> Result<HarnessOutcome> {
        let tx = self.store.begin()?;
        let job = tx.job(job_id)?.ok_or(ReductorError::JobNotFound(job_id))?;

        if job.state != JobState::Launched {
            warn!(
                job_id,
                state = %job.state,
                "job is not launched; refusing to process"
            );
            return Ok(HarnessOutcome::Skipped { state: job.state });
        }

        match self.process(tx, job, identity, transformation) {
            Ok(outcome) => Ok(outcome),
            Err(err @ ReductorError::JobStateChanged { .. }) => {
                warn!(job_id, error = %err, "job was reassigned while processing; discarding output");
                Err(err)
            }
            Err(err) => {
                error!(job_id, error = %err, "job processing failed");
                if let Err(mark_err) = self.mark_failed(job_id) {
                    error!(
                        job_id,
                        error = %mark_err,
                        "could not record job failure"
                    );
                }
                Err(err)
            }
        }
    }

    fn process(
        &self,
        mut tx: Box<dyn Transaction + '_>,
        mut job: Job,
        identity: &RunIdentity,
        transformation: &dyn Transformation,
    ) -> Result<HarnessOutcome> {
        let job_id = job.id;

        job.state = JobState::Running;
        job.start_time = Some(Utc::now());
        job.run_name = Some(identity.name.clone());
        job.run_id = Some(identity.id.clone());
        tx.update_job(&job)?;
        tx.commit()?;
        info!(job_id, stage = %job.stage, run_id = %identity.id, "job running");

        {
            let mut tx = self.store.begin()?;
            let mut expected = tx.products_for_job(job_id)?;
            if expected.is_empty() {
                return Err(ReductorError::NoExpectedOutputs(job_id));
            }
            set_product_states(&mut *tx, &mut expected, ProductState::Creating)?;
            tx.commit()?;
        }

        let parameters: Value = serde_json::from_str(&job.call_parameters)?;
        let context = ParameterContext {
            job_id,
            stage: &job.stage,
            storage_root: self.layout.root(),
        };
        let parameters = transformation.prepare_parameters(parameters, &context)?;
        debug!(job_id, "invoking transformation");
        let artifacts = transformation.transform(parameters)?;
        debug!(job_id, artifacts = artifacts.len(), "transformation returned");

        self.reconcile(job_id, artifacts)
    }

    /// Match artifacts to expected products, persist them and finish the job.
    ///
    /// Every artifact is matched before anything is written, so a rejected
    /// artifact leaves no files behind.
    fn reconcile(&self, job_id: JobId, artifacts: Vec<Artifact>) -> Result<HarnessOutcome> {
        let mut tx = self.store.begin()?;

        let mut job = tx.job(job_id)?.ok_or(ReductorError::JobNotFound(job_id))?;
        if job.state != JobState::Running {
            return Err(ReductorError::JobStateChanged {
                job_id,
                state: job.state,
            });
        }

        let mut expected = tx.products_for_job(job_id)?;
        let assigned = self.match_artifacts(job_id, &expected, &artifacts)?;

        let mut created = Vec::new();
        let mut blank = Vec::new();
        let mut unreported = Vec::new();

        for (product, slot) in expected.iter_mut().zip(assigned) {
            let Some(artifact) = slot.map(|idx| &artifacts[idx]) else {
                product.state = ProductState::Unreported;
                tx.update_product(product)?;
                unreported.push(product.id);
                continue;
            };

            product.outlier = artifact.outlier;
            product.quality_flags |= artifact.quality_flags;

            match &artifact.content {
                ArtifactContent::Data(data) => {
                    let key = product.key();
                    self.fs.write(&self.layout.path_for(&key), data)?;
                    for sidecar in &artifact.sidecars {
                        self.fs
                            .write(&self.layout.sidecar_path(&key, &sidecar.extension), &sidecar.data)?;
                    }
                    product.state = ProductState::Created;
                    created.push(product.id);
                }
                ArtifactContent::Blank => {
                    product.state = ProductState::Blank;
                    blank.push(product.id);
                }
            }
            tx.update_product(product)?;
        }
        if !unreported.is_empty() {
            debug!(job_id, products = ?unreported, "expected products not reported");
        }

        job.finish(JobState::Completed, Utc::now());
        tx.update_job(&job)?;
        tx.commit()?;

        info!(
            job_id,
            created = created.len(),
            blank = blank.len(),
            unreported = unreported.len(),
            "job completed"
        );

        Ok(HarnessOutcome::Completed {
            created,
            blank,
            unreported,
        })
    }

    /// For each expected product, the index of the artifact carrying its key.
    fn match_artifacts(
        &self,
        job_id: JobId,
        expected: &[Product],
        artifacts: &[Artifact],
    ) -> Result<Vec<Option<usize>>> {
        let by_key: HashMap<ProductKey, usize> = expected
            .iter()
            .enumerate()
            .map(|(idx, product)| (product.key(), idx))
            .collect();

        let mut assigned = vec![None; expected.len()];
        for (artifact_idx, artifact) in artifacts.iter().enumerate() {
            let Some(&idx) = by_key.get(&artifact.key) else {
                return Err(ReductorError::UnmatchedArtifact {
                    job_id,
                    name: self.layout.file_name(&artifact.key),
                });
            };
            if assigned[idx].replace(artifact_idx).is_some() {
                return Err(ReductorError::AmbiguousArtifact {
                    job_id,
                    name: self.layout.file_name(&artifact.key),
                });
            }
        }
        Ok(assigned)
    }

    /// Failure branch: a job still being processed and every product it owns
    /// become `failed`.
    fn mark_failed(&self, job_id: JobId) -> Result<()> {
        let mut tx = self.store.begin()?;
        let Some(mut job) = tx.job(job_id)? else {
            return Ok(());
        };
        if !matches!(job.state, JobState::Launched | JobState::Running) {
            warn!(job_id, state = %job.state, "job no longer in progress; not marking it failed");
            return Ok(());
        }
        job.finish(JobState::Failed, Utc::now());
        tx.update_job(&job)?;

        let mut products = tx.products_for_job(job_id)?;
        set_product_states(&mut *tx, &mut products, ProductState::Failed)?;
        tx.commit()?;

        warn!(job_id, products = products.len(), "job marked failed");
        Ok(())
    }
}
