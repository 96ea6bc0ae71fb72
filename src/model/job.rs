// src/model/job.rs

//! Scheduled executions of a stage's transformation.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::JobId;

/// Lifecycle state of a job.
///
/// `Planned -> Launched -> Running -> Completed | Failed`. `Revivable` is set
/// from outside the control plane when upstream inputs changed; the cleaner
/// deletes such jobs together with their outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Planned,
    Launched,
    Running,
    Completed,
    Failed,
    Revivable,
}

impl JobState {
    pub const ALL: [JobState; 6] = [
        JobState::Planned,
        JobState::Launched,
        JobState::Running,
        JobState::Completed,
        JobState::Failed,
        JobState::Revivable,
    ];

    /// States counted against a stage's in-flight ceiling.
    pub const IN_FLIGHT: [JobState; 3] =
        [JobState::Planned, JobState::Launched, JobState::Running];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Planned => "planned",
            JobState::Launched => "launched",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Revivable => "revivable",
        }
    }

    /// Whether a job in this state carries an end time.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "planned" => Ok(JobState::Planned),
            "launched" => Ok(JobState::Launched),
            "running" => Ok(JobState::Running),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "revivable" => Ok(JobState::Revivable),
            other => Err(format!("invalid job state: {other}")),
        }
    }
}

/// One scheduled execution of a stage's transformation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub stage: String,
    pub job_type: String,
    pub state: JobState,
    pub priority: i64,
    /// Reprocessing work; never preempts live work.
    pub is_backfill: bool,
    pub creation_time: DateTime<Utc>,
    pub launch_time: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub run_name: Option<String>,
    pub run_id: Option<String>,
    /// Stage-defined JSON. Never interpreted by the control plane.
    pub call_parameters: String,
}

impl Job {
    /// Move to a terminal state, stamping the end time.
    pub fn finish(&mut self, state: JobState, now: DateTime<Utc>) {
        debug_assert!(state.is_terminal());
        self.state = state;
        self.end_time = Some(now);
    }

    /// Return a launched job to the planned pool.
    pub fn unlaunch(&mut self) {
        self.state = JobState::Planned;
        self.launch_time = None;
        self.run_id = None;
        self.run_name = None;
    }

    /// Time spent waiting since creation, in whole seconds (never negative).
    pub fn waited_seconds(&self, now: DateTime<Utc>) -> i64 {
        (now - self.creation_time).num_seconds().max(0)
    }
}

/// A job row that has not been inserted yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub stage: String,
    pub job_type: String,
    pub priority: i64,
    pub is_backfill: bool,
    pub creation_time: DateTime<Utc>,
    pub call_parameters: String,
}

impl NewJob {
    pub fn new(
        stage: impl Into<String>,
        job_type: impl Into<String>,
        call_parameters: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            stage: stage.into(),
            job_type: job_type.into(),
            priority: 0,
            is_backfill: false,
            creation_time: now,
            call_parameters: call_parameters.to_string(),
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn backfill(mut self, is_backfill: bool) -> Self {
        self.is_backfill = is_backfill;
        self
    }

    pub fn into_job(self, id: JobId) -> Job {
        Job {
            id,
            stage: self.stage,
            job_type: self.job_type,
            state: JobState::Planned,
            priority: self.priority,
            is_backfill: self.is_backfill,
            creation_time: self.creation_time,
            launch_time: None,
            start_time: None,
            end_time: None,
            run_name: None,
            run_id: None,
            call_parameters: self.call_parameters,
        }
    }
}
