// src/executor/client.rs

//! Pluggable executor abstraction.
//!
//! The launcher and cleaner talk to an [`ExecutorClient`] instead of a
//! concrete execution substrate. Production deployments wrap their workflow
//! service; tests provide a fake that records requests and answers with
//! scripted statuses.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::Result;
use crate::model::JobId;

/// Boxed future returned by [`ExecutorClient`] methods.
pub type ExecutorFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Status of a run as reported by the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Accepted and queued. The only status that confirms a launch.
    Scheduled,
    Pending,
    Running,
    Completed,
    Failed,
    Crashed,
    Cancelled,
}

impl RunStatus {
    /// Terminal statuses that mean the job did not finish on its own.
    pub const ABNORMAL_END: [RunStatus; 3] =
        [RunStatus::Failed, RunStatus::Crashed, RunStatus::Cancelled];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Crashed | RunStatus::Cancelled
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Scheduled => "scheduled",
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Crashed => "crashed",
            RunStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// One run known to the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    pub id: String,
    pub name: String,
    pub deployment_id: String,
    pub status: RunStatus,
    pub parameters: Value,
}

impl RunInfo {
    /// The job this run executes, if its parameters carry one.
    pub fn job_id(&self) -> Option<JobId> {
        self.parameters.get("job_id").and_then(Value::as_i64)
    }
}

/// Run query. Unset fields match everything; an empty `statuses` list matches
/// every status.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub deployment_id: Option<String>,
    pub statuses: Vec<RunStatus>,
}

impl RunFilter {
    pub fn with_statuses(statuses: &[RunStatus]) -> Self {
        Self {
            deployment_id: None,
            statuses: statuses.to_vec(),
        }
    }

    pub fn matches(&self, run: &RunInfo) -> bool {
        self.deployment_id
            .as_deref()
            .is_none_or(|d| d == run.deployment_id)
            && (self.statuses.is_empty() || self.statuses.contains(&run.status))
    }
}

/// Trait abstracting the external system that runs launched jobs.
///
/// All methods take `&self` so that the launcher can issue several requests
/// concurrently.
pub trait ExecutorClient: Send + Sync {
    /// Deployment name -> deployment id.
    fn list_deployments(&self) -> ExecutorFuture<'_, HashMap<String, String>>;

    fn create_run(&self, deployment_id: &str, parameters: Value) -> ExecutorFuture<'_, RunInfo>;

    fn list_runs(&self, filter: &RunFilter) -> ExecutorFuture<'_, Vec<RunInfo>>;

    fn cancel_run(&self, run_id: &str) -> ExecutorFuture<'_, ()>;

    fn delete_run(&self, run_id: &str) -> ExecutorFuture<'_, ()>;
}

/// Deployment that processes the jobs of `stage`.
pub fn deployment_name(stage: &str) -> String {
    format!("{stage}_process")
}

/// Parameters sent with a launch request.
pub fn launch_parameters(job_id: JobId) -> Value {
    serde_json::json!({ "job_id": job_id })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_job_id_comes_from_launch_parameters() {
        let run = RunInfo {
            id: "r1".into(),
            name: "l1-job-7".into(),
            deployment_id: "l1_process".into(),
            status: RunStatus::Scheduled,
            parameters: launch_parameters(7),
        };
        assert_eq!(run.job_id(), Some(7));
        assert_eq!(deployment_name("l1"), "l1_process");
    }

    #[test]
    fn filter_by_status() {
        let mut run = RunInfo {
            id: "r1".into(),
            name: "n".into(),
            deployment_id: "d".into(),
            status: RunStatus::Crashed,
            parameters: Value::Null,
        };
        let filter = RunFilter::with_statuses(&RunStatus::ABNORMAL_END);
        assert!(filter.matches(&run));
        run.status = RunStatus::Running;
        assert!(!filter.matches(&run));
    }
}
