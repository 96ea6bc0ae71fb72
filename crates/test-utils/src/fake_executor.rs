use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::time::Instant;

use reductor::errors::ReductorError;
use reductor::executor::{
    ExecutorClient, ExecutorFuture, RunFilter, RunInfo, RunStatus, deployment_name,
};
use reductor::model::JobId;

#[derive(Default)]
struct FakeState {
    deployments: HashMap<String, String>,
    runs: Vec<RunInfo>,
    launches: Vec<(JobId, Instant)>,
    cancelled: Vec<String>,
    reply_status: Option<RunStatus>,
    reject_jobs: HashSet<JobId>,
    failing_cancels: HashSet<String>,
    next_run: u64,
}

/// A fake executor that:
/// - records every launch (with the tokio instant it happened at) and every
///   cancellation request
/// - answers launches with a scripted status (`scheduled` by default)
/// - fails launches or cancellations that were set up to fail.
#[derive(Clone, Default)]
pub struct FakeExecutor {
    state: Arc<Mutex<FakeState>>,
}

impl FakeExecutor {
    /// An executor with one `{stage}_process` deployment per stage.
    pub fn with_stages(stages: &[&str]) -> Self {
        let fake = Self::default();
        {
            let mut state = fake.state.lock().unwrap();
            for stage in stages {
                let name = deployment_name(stage);
                state.deployments.insert(name.clone(), format!("dep-{name}"));
            }
        }
        fake
    }

    /// Status returned by every subsequent `create_run`.
    pub fn reply_with(&self, status: RunStatus) {
        self.state.lock().unwrap().reply_status = Some(status);
    }

    /// Make `create_run` fail for this job.
    pub fn reject_job(&self, job_id: JobId) {
        self.state.lock().unwrap().reject_jobs.insert(job_id);
    }

    /// Make `cancel_run` fail for this run.
    pub fn fail_cancel_of(&self, run_id: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_cancels
            .insert(run_id.to_string());
    }

    /// Register a run as if it had been created earlier.
    pub fn add_run(&self, run_id: &str, job_id: JobId, status: RunStatus) {
        self.state.lock().unwrap().runs.push(RunInfo {
            id: run_id.to_string(),
            name: format!("job-{job_id}"),
            deployment_id: String::new(),
            status,
            parameters: serde_json::json!({ "job_id": job_id }),
        });
    }

    /// Job ids in launch order.
    pub fn launched_jobs(&self) -> Vec<JobId> {
        self.state
            .lock()
            .unwrap()
            .launches
            .iter()
            .map(|(job_id, _)| *job_id)
            .collect()
    }

    /// Instants at which launches were requested, in order.
    pub fn launch_instants(&self) -> Vec<Instant> {
        self.state
            .lock()
            .unwrap()
            .launches
            .iter()
            .map(|(_, at)| *at)
            .collect()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.state.lock().unwrap().cancelled.clone()
    }
}

impl ExecutorClient for FakeExecutor {
    fn list_deployments(&self) -> ExecutorFuture<'_, HashMap<String, String>> {
        let deployments = self.state.lock().unwrap().deployments.clone();
        Box::pin(async move { Ok(deployments) })
    }

    fn create_run(&self, deployment_id: &str, parameters: Value) -> ExecutorFuture<'_, RunInfo> {
        let state = Arc::clone(&self.state);
        let deployment_id = deployment_id.to_string();

        Box::pin(async move {
            let mut state = state.lock().unwrap();
            let job_id = parameters
                .get("job_id")
                .and_then(Value::as_i64)
                .ok_or_else(|| ReductorError::Executor("missing job_id".to_string()))?;
            state.launches.push((job_id, Instant::now()));

            if state.reject_jobs.contains(&job_id) {
                return Err(ReductorError::Executor(format!(
                    "launch of job {job_id} refused"
                )));
            }

            state.next_run += 1;
            let run = RunInfo {
                id: format!("fake-{}", state.next_run),
                name: format!("job-{job_id}"),
                deployment_id,
                status: state.reply_status.unwrap_or(RunStatus::Scheduled),
                parameters,
            };
            state.runs.push(run.clone());
            Ok(run)
        })
    }

    fn list_runs(&self, filter: &RunFilter) -> ExecutorFuture<'_, Vec<RunInfo>> {
        let runs: Vec<RunInfo> = self
            .state
            .lock()
            .unwrap()
            .runs
            .iter()
            .filter(|run| filter.matches(run))
            .cloned()
            .collect();
        Box::pin(async move { Ok(runs) })
    }

    fn cancel_run(&self, run_id: &str) -> ExecutorFuture<'_, ()> {
        let state = Arc::clone(&self.state);
        let run_id = run_id.to_string();

        Box::pin(async move {
            let mut state = state.lock().unwrap();
            state.cancelled.push(run_id.clone());
            if state.failing_cancels.contains(&run_id) {
                return Err(ReductorError::Executor(format!("cancel of {run_id} failed")));
            }
            if let Some(run) = state.runs.iter_mut().find(|run| run.id == run_id) {
                run.status = RunStatus::Cancelled;
            }
            Ok(())
        })
    }

    fn delete_run(&self, run_id: &str) -> ExecutorFuture<'_, ()> {
        let state = Arc::clone(&self.state);
        let run_id = run_id.to_string();

        Box::pin(async move {
            state.lock().unwrap().runs.retain(|run| run.id != run_id);
            Ok(())
        })
    }
}
