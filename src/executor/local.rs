// src/executor/local.rs

//! In-process executor.
//!
//! `LocalExecutor` implements [`ExecutorClient`] by running the processing
//! harness for each created run on the tokio blocking pool. There is one
//! deployment per registered stage. At most one worker exists per run; a
//! cancel request stops waiting for the worker and marks the run
//! `cancelled` (the blocking harness call itself is not interrupted).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::errors::{ReductorError, Result};
use crate::fs::{ArtifactLayout, FileSystem};
use crate::harness::{Harness, HarnessOutcome, RunIdentity};
use crate::model::JobId;
use crate::stage::{StageRegistry, Transformation};
use crate::store::Store;

use super::client::{
    ExecutorClient, ExecutorFuture, RunFilter, RunInfo, RunStatus, deployment_name,
};

/// Handle for a run whose worker has not finished yet.
struct ActiveRun {
    cancel: Option<oneshot::Sender<()>>,
    handle: tokio::task::JoinHandle<()>,
}

struct Shared {
    store: Arc<dyn Store>,
    stages: Arc<StageRegistry>,
    fs: Arc<dyn FileSystem>,
    layout: ArtifactLayout,
    runs: Mutex<HashMap<String, RunInfo>>,
    active: Mutex<HashMap<String, ActiveRun>>,
    next_run: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn set_status(&self, run_id: &str, status: RunStatus) {
        if let Some(run) = lock(&self.runs).get_mut(run_id) {
            run.status = status;
        }
    }

    fn execute(
        &self,
        job_id: JobId,
        identity: &RunIdentity,
        transformation: &dyn Transformation,
    ) -> Result<HarnessOutcome> {
        Harness::new(self.store.as_ref(), self.fs.as_ref(), &self.layout).run(
            job_id,
            identity,
            transformation,
        )
    }
}

/// Executor that processes jobs inside this process.
#[derive(Clone)]
pub struct LocalExecutor {
    shared: Arc<Shared>,
}

impl LocalExecutor {
    pub fn new(
        store: Arc<dyn Store>,
        stages: Arc<StageRegistry>,
        fs: Arc<dyn FileSystem>,
        layout: ArtifactLayout,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                stages,
                fs,
                layout,
                runs: Mutex::new(HashMap::new()),
                active: Mutex::new(HashMap::new()),
                next_run: AtomicU64::new(1),
            }),
        }
    }

    /// Wait for every worker started so far.
    pub async fn wait_idle(&self) {
        let handles: Vec<_> = lock(&self.shared.active)
            .drain()
            .map(|(_, active)| active.handle)
            .collect();
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "run worker panicked");
            }
        }
    }

    fn stage_for_deployment(&self, deployment_id: &str) -> Option<String> {
        self.shared
            .stages
            .names()
            .find(|stage| deployment_name(stage) == deployment_id)
            .map(str::to_string)
    }

    fn start_run(&self, deployment_id: &str, parameters: Value) -> Result<RunInfo> {
        let stage = self.stage_for_deployment(deployment_id).ok_or_else(|| {
            ReductorError::Executor(format!("unknown deployment '{deployment_id}'"))
        })?;
        let transformation: Arc<dyn Transformation> = self
            .shared
            .stages
            .get(&stage)
            .map(|s| s.transformation.clone())
            .ok_or_else(|| ReductorError::Executor(format!("stage '{stage}' not registered")))?;

        let run = RunInfo {
            id: format!(
                "local-{}",
                self.shared.next_run.fetch_add(1, Ordering::Relaxed)
            ),
            name: String::new(),
            deployment_id: deployment_id.to_string(),
            status: RunStatus::Scheduled,
            parameters,
        };
        let job_id = run.job_id().ok_or_else(|| {
            ReductorError::Executor(format!("run {} has no job_id parameter", run.id))
        })?;
        let run = RunInfo {
            name: format!("{stage}-job-{job_id}"),
            ..run
        };
        let identity = RunIdentity {
            name: run.name.clone(),
            id: run.id.clone(),
        };

        lock(&self.shared.runs).insert(run.id.clone(), run.clone());

        // Hold the active table while spawning so the worker cannot deregister
        // before it is registered.
        let mut active = lock(&self.shared.active);
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let shared = self.shared.clone();
        let handle = tokio::spawn(async move {
            drive_run(shared, job_id, identity, transformation, cancel_rx).await;
        });
        active.insert(
            run.id.clone(),
            ActiveRun {
                cancel: Some(cancel_tx),
                handle,
            },
        );

        info!(run_id = %run.id, job_id, stage = %stage, "run created");
        Ok(run)
    }

    fn request_cancel(&self, run_id: &str) -> Result<()> {
        if !lock(&self.shared.runs).contains_key(run_id) {
            return Err(ReductorError::Executor(format!("unknown run '{run_id}'")));
        }

        let mut active = lock(&self.shared.active);
        match active.get_mut(run_id).and_then(|a| a.cancel.take()) {
            Some(cancel) => {
                if cancel.send(()).is_err() {
                    debug!(run_id, "run finished while cancelling");
                }
            }
            None => debug!(run_id, "run not active; nothing to cancel"),
        }
        Ok(())
    }
}

async fn drive_run(
    shared: Arc<Shared>,
    job_id: JobId,
    identity: RunIdentity,
    transformation: Arc<dyn Transformation>,
    mut cancel_rx: oneshot::Receiver<()>,
) {
    let run_id = identity.id.clone();
    shared.set_status(&run_id, RunStatus::Running);

    let worker = {
        let shared = shared.clone();
        tokio::task::spawn_blocking(move || {
            shared.execute(job_id, &identity, transformation.as_ref())
        })
    };

    let status = tokio::select! {
        Ok(()) = &mut cancel_rx => {
            info!(run_id = %run_id, job_id, "run cancelled");
            RunStatus::Cancelled
        }
        joined = worker => match joined {
            Ok(Ok(HarnessOutcome::Completed { .. })) => RunStatus::Completed,
            Ok(Ok(HarnessOutcome::Skipped { state })) => {
                warn!(run_id = %run_id, job_id, state = %state, "run found job in unexpected state");
                RunStatus::Completed
            }
            Ok(Err(err)) => {
                error!(run_id = %run_id, job_id, error = %err, "run failed");
                RunStatus::Failed
            }
            Err(err) => {
                error!(run_id = %run_id, job_id, error = %err, "run worker crashed");
                RunStatus::Crashed
            }
        },
    };

    shared.set_status(&run_id, status);
    lock(&shared.active).remove(&run_id);
    debug!(run_id = %run_id, status = %status, "run finished");
}

impl ExecutorClient for LocalExecutor {
    fn list_deployments(&self) -> ExecutorFuture<'_, HashMap<String, String>> {
        Box::pin(async move {
            Ok(self
                .shared
                .stages
                .names()
                .map(|stage| {
                    let name = deployment_name(stage);
                    (name.clone(), name)
                })
                .collect())
        })
    }

    fn create_run(&self, deployment_id: &str, parameters: Value) -> ExecutorFuture<'_, RunInfo> {
        let deployment_id = deployment_id.to_string();
        Box::pin(async move { self.start_run(&deployment_id, parameters) })
    }

    fn list_runs(&self, filter: &RunFilter) -> ExecutorFuture<'_, Vec<RunInfo>> {
        let filter = filter.clone();
        Box::pin(async move {
            let mut runs: Vec<RunInfo> = lock(&self.shared.runs)
                .values()
                .filter(|run| filter.matches(run))
                .cloned()
                .collect();
            runs.sort_by(|a, b| a.id.cmp(&b.id));
            Ok(runs)
        })
    }

    fn cancel_run(&self, run_id: &str) -> ExecutorFuture<'_, ()> {
        let run_id = run_id.to_string();
        Box::pin(async move { self.request_cancel(&run_id) })
    }

    fn delete_run(&self, run_id: &str) -> ExecutorFuture<'_, ()> {
        let run_id = run_id.to_string();
        Box::pin(async move {
            self.request_cancel(&run_id)?;
            lock(&self.shared.runs).remove(&run_id);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StageConfig;
    use crate::fs::mock::MockFileSystem;
    use crate::model::{JobState, NewJob, NewProduct, Product, ProductKey, ProductState};
    use crate::stage::{Artifact, StageStrategy};
    use crate::store::{MemoryStore, StoreRead};
    use chrono::{DateTime, TimeZone, Utc};

    struct NoStrategy;

    impl StageStrategy for NoStrategy {
        fn find_ready_inputs(
            &self,
            _store: &dyn StoreRead,
            _config: &StageConfig,
            _now: DateTime<Utc>,
        ) -> anyhow::Result<Vec<Vec<i64>>> {
            Ok(Vec::new())
        }

        fn make_outputs(
            &self,
            _inputs: &[Product],
            _config: &StageConfig,
            _now: DateTime<Utc>,
        ) -> anyhow::Result<Vec<NewProduct>> {
            Ok(Vec::new())
        }

        fn make_job(
            &self,
            _inputs: &[Product],
            _outputs: &[Product],
            _config: &StageConfig,
            now: DateTime<Utc>,
        ) -> anyhow::Result<NewJob> {
            Ok(NewJob::new("l1", "img", &Value::Null, now))
        }
    }

    fn key() -> ProductKey {
        ProductKey {
            stage: "l1".into(),
            product_type: "img".into(),
            source: "cam".into(),
            version: 1,
            observation_time: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    struct Echo;

    impl Transformation for Echo {
        fn transform(&self, _parameters: Value) -> anyhow::Result<Vec<Artifact>> {
            Ok(vec![Artifact::new(key(), b"ok".to_vec())])
        }
    }

    fn executor(store: Arc<MemoryStore>) -> LocalExecutor {
        let mut stages = StageRegistry::new();
        stages.register("l1", Arc::new(NoStrategy), Arc::new(Echo));
        LocalExecutor::new(
            store,
            Arc::new(stages),
            Arc::new(MockFileSystem::new()),
            ArtifactLayout::new("/data"),
        )
    }

    fn launched_job(store: &MemoryStore) -> JobId {
        let now = Utc::now();
        let mut tx = store.begin().unwrap();
        let job_id = tx
            .insert_job(NewJob::new("l1", "img", &Value::Null, now))
            .unwrap();
        let mut product = NewProduct::planned(key(), now);
        product.producing_job_id = Some(job_id);
        tx.insert_product(product).unwrap();
        let mut job = tx.job(job_id).unwrap().unwrap();
        job.state = JobState::Launched;
        job.launch_time = Some(now);
        tx.update_job(&job).unwrap();
        tx.commit().unwrap();
        job_id
    }

    #[tokio::test]
    async fn created_run_processes_the_job() {
        let store = Arc::new(MemoryStore::new());
        let job_id = launched_job(&store);
        let executor = executor(store.clone());

        let deployments = executor.list_deployments().await.unwrap();
        let deployment = &deployments["l1_process"];
        let run = executor
            .create_run(deployment, crate::executor::launch_parameters(job_id))
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Scheduled);
        assert_eq!(run.name, format!("l1-job-{job_id}"));

        executor.wait_idle().await;

        let runs = executor.list_runs(&RunFilter::default()).await.unwrap();
        assert_eq!(runs[0].status, RunStatus::Completed);
        let job = store.jobs().unwrap().remove(0);
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.run_id.as_deref(), Some(run.id.as_str()));
        assert_eq!(store.products().unwrap()[0].state, ProductState::Created);
    }

    #[tokio::test]
    async fn unknown_deployment_is_rejected() {
        let executor = executor(Arc::new(MemoryStore::new()));
        let err = executor
            .create_run("l9_process", crate::executor::launch_parameters(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ReductorError::Executor(_)));
    }

    #[tokio::test]
    async fn cancelling_unknown_run_fails() {
        let executor = executor(Arc::new(MemoryStore::new()));
        assert!(executor.cancel_run("local-99").await.is_err());
    }
}
