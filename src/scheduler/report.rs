// src/scheduler/report.rs

//! Result types for a scheduler pass.

use crate::model::{JobId, ProductId};

/// Why a scheduler pass did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The stage's `enabled` switch is off.
    Disabled,
    /// The stage already has `in_flight >= max` jobs planned, launched or
    /// running.
    InFlightCeiling { in_flight: usize, max: usize },
}

/// One committed input group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledGroup {
    pub job_id: JobId,
    pub inputs: Vec<ProductId>,
    pub outputs: Vec<ProductId>,
    pub relationships: usize,
}

/// Structured result of one scheduler pass over a stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleReport {
    pub stage: String,
    /// Set when the whole pass was skipped; nothing was written.
    pub skipped: Option<SkipReason>,
    pub scheduled: Vec<ScheduledGroup>,
    pub marked_impossible: Vec<ProductId>,
}

impl ScheduleReport {
    pub(crate) fn new(stage: &str) -> Self {
        Self {
            stage: stage.to_string(),
            skipped: None,
            scheduled: Vec::new(),
            marked_impossible: Vec::new(),
        }
    }

    pub(crate) fn skipped(stage: &str, reason: SkipReason) -> Self {
        Self {
            skipped: Some(reason),
            ..Self::new(stage)
        }
    }

    pub fn jobs_created(&self) -> usize {
        self.scheduled.len()
    }
}
